//! Team 数据模型 - Team / 成员 / 任务 / 消息
//!
//! 所有记录以 camelCase JSON 持久化在 team 目录下。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use super::permissions::MemberPermissions;
use crate::error::TeamError;

/// 广播地址
pub const BROADCAST: &str = "broadcast";

/// 全局计数器，确保同一毫秒内生成的 id 不重复
static ID_COUNTER: AtomicU64 = AtomicU64::new(0);

/// 生成 `{prefix}-{毫秒时间戳}-{pid}-{计数}` 形式的 id
pub fn generate_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let counter = ID_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}-{}-{}", prefix, timestamp, std::process::id(), counter)
}

/// Team 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TeamState {
    Active,
    Shutdown,
}

/// 成员角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Lead,
    Teammate,
}

impl std::fmt::Display for MemberRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MemberRole::Lead => write!(f, "lead"),
            MemberRole::Teammate => write!(f, "teammate"),
        }
    }
}

impl std::str::FromStr for MemberRole {
    type Err = TeamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "lead" | "team-lead" | "leader" => Ok(MemberRole::Lead),
            "teammate" | "member" => Ok(MemberRole::Teammate),
            _ => Err(TeamError::validation(format!("Unknown member role: {}", s))),
        }
    }
}

/// 成员状态（只能 active → inactive）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Active,
    Inactive,
}

/// teammate 的显示/执行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayMode {
    /// 独立 tmux session（单独的终端窗口）
    Tmux,
    /// 无界面的子进程
    Process,
    /// lead 进程内的逻辑上下文
    InProcess,
}

impl std::fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisplayMode::Tmux => write!(f, "tmux"),
            DisplayMode::Process => write!(f, "process"),
            DisplayMode::InProcess => write!(f, "in_process"),
        }
    }
}

impl std::str::FromStr for DisplayMode {
    type Err = TeamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "tmux" | "terminal" | "pane" => Ok(DisplayMode::Tmux),
            "process" | "headless" | "background" => Ok(DisplayMode::Process),
            "in_process" | "in-process" | "inprocess" => Ok(DisplayMode::InProcess),
            _ => Err(TeamError::validation(format!("Unknown display mode: {}", s))),
        }
    }
}

/// Team 成员
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMember {
    pub id: String,
    pub name: String,
    pub role: MemberRole,
    /// 描述性角色标签（如 "reviewer"）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_label: Option<String>,
    pub status: MemberStatus,
    pub permissions: MemberPermissions,
    pub display_mode: DisplayMode,
    pub joined_at: DateTime<Utc>,
}

impl TeamMember {
    pub fn is_active(&self) -> bool {
        self.status == MemberStatus::Active
    }

    pub fn is_lead(&self) -> bool {
        self.role == MemberRole::Lead
    }
}

/// 新成员草稿（由 Spawner 填写，权限由 Store 分配）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberDraft {
    /// 预先生成的成员 id（Spawner 需要在启动进程前确定）
    pub id: Option<String>,
    pub name: String,
    pub role_label: Option<String>,
    pub display_mode: Option<DisplayMode>,
}

/// 任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

/// 任务优先级
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// 任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamTask {
    pub id: String,
    pub team_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// 新任务草稿
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskDraft {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: TaskPriority,
}

/// Team
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub lead_session_id: String,
    pub lead_member_id: String,
    pub members: Vec<TeamMember>,
    pub status: TeamState,
    pub work_dir: PathBuf,
    /// 与 tasks/ 目录保持同步的任务副本
    #[serde(default)]
    pub tasks: Vec<TeamTask>,
    /// 下一个任务序号
    #[serde(default = "first_task_seq")]
    pub next_task_seq: u64,
}

fn first_task_seq() -> u64 {
    1
}

impl Team {
    pub fn member(&self, member_id: &str) -> Option<&TeamMember> {
        self.members.iter().find(|m| m.id == member_id)
    }

    pub fn lead(&self) -> Option<&TeamMember> {
        self.member(&self.lead_member_id)
    }

    pub fn active_members(&self) -> impl Iterator<Item = &TeamMember> {
        self.members.iter().filter(|m| m.is_active())
    }
}

/// 消息类型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Message,
    Broadcast,
    TaskUpdate,
    Shutdown,
    System,
}

/// 单个接收者的投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Acknowledged,
}

/// 投递记录（每个接收者一条）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryInfo {
    pub recipient: String,
    pub status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
}

impl DeliveryInfo {
    pub fn pending(recipient: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            status: DeliveryStatus::Pending,
            delivered_at: None,
            acknowledged_at: None,
            acknowledged_by: None,
        }
    }

    pub fn is_acknowledged(&self) -> bool {
        self.status == DeliveryStatus::Acknowledged
    }
}

/// Team 消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamMessage {
    pub id: String,
    pub team_id: String,
    pub from: String,
    /// 成员 id 或 `broadcast`
    pub to: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type", default)]
    pub message_type: MessageType,
    #[serde(default)]
    pub read: bool,
    #[serde(default)]
    pub deliveries: Vec<DeliveryInfo>,
}

impl TeamMessage {
    /// 构造消息，`recipients` 为预期接收者（广播时不含发送者）
    pub fn new(
        team_id: &str,
        from: &str,
        to: &str,
        content: &str,
        message_type: MessageType,
        recipients: &[String],
    ) -> Self {
        Self {
            id: generate_id("msg"),
            team_id: team_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            message_type,
            read: false,
            deliveries: recipients.iter().map(DeliveryInfo::pending).collect(),
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }
}

/// 计算一条消息的接收者：广播发给除发送者外的所有成员
pub fn resolve_recipients<'a, I>(from: &str, to: &str, members: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    if to == BROADCAST {
        members
            .into_iter()
            .filter(|m| *m != from)
            .map(|m| m.to_string())
            .collect()
    } else {
        vec![to.to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_id_unique() {
        let a = generate_id("task");
        let b = generate_id("task");
        assert_ne!(a, b);
        assert!(a.starts_with("task-"));
    }

    #[test]
    fn test_display_mode_parse() {
        assert_eq!("tmux".parse::<DisplayMode>().unwrap(), DisplayMode::Tmux);
        assert_eq!("in-process".parse::<DisplayMode>().unwrap(), DisplayMode::InProcess);
        assert_eq!(DisplayMode::InProcess.to_string(), "in_process");
        assert!("window".parse::<DisplayMode>().is_err());
    }

    #[test]
    fn test_task_deserialization_defaults() {
        let json = r#"{
            "id": "1",
            "teamId": "team-a",
            "title": "Write parser",
            "status": "in_progress",
            "assignee": "member-1",
            "createdAt": "2026-01-01T00:00:00Z",
            "updatedAt": "2026-01-01T00:00:00Z",
            "createdBy": "lead"
        }"#;

        let task: TeamTask = serde_json::from_str(json).unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert_eq!(task.priority, TaskPriority::Medium);
        assert!(task.dependencies.is_empty());
        assert!(task.result.is_none());
    }

    #[test]
    fn test_message_type_field_renamed() {
        let msg = TeamMessage::new("t", "a", "b", "hi", MessageType::Message, &["b".to_string()]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "message");
        assert_eq!(json["deliveries"][0]["status"], "pending");
    }

    #[test]
    fn test_resolve_recipients_broadcast_excludes_sender() {
        let members = ["lead", "m1", "m2"];
        let recipients = resolve_recipients("m1", BROADCAST, members.iter().copied());
        assert_eq!(recipients, vec!["lead", "m2"]);

        let direct = resolve_recipients("lead", "m2", members.iter().copied());
        assert_eq!(direct, vec!["m2"]);
    }
}
