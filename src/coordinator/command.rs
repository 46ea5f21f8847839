//! Coordinator 命令 - `team_action` 区分的命令及其所需能力

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, TeamError};
use crate::spawner::TeammateConfig;
use crate::team::model::{DisplayMode, MemberRole, MessageType, TaskPriority, BROADCAST};
use crate::team::permissions::Capability;

/// `task_update` 的子动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskAction {
    Claim,
    Complete,
    Release,
    Assign,
}

/// `task_list` 过滤条件
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFilter {
    Pending,
    Available,
    InProgress,
    Completed,
    #[default]
    All,
}

/// Coordinator 命令
///
/// 必填字段声明为 `Option`，缺失时由 `required` 返回可读的校验错误。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "team_action", rename_all = "snake_case")]
pub enum TeamCommand {
    Create {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        work_dir: Option<PathBuf>,
    },
    Spawn {
        #[serde(default)]
        team_id: Option<String>,
        #[serde(default)]
        teammates: Vec<TeammateConfig>,
        #[serde(default)]
        display_mode: Option<DisplayMode>,
    },
    Message {
        #[serde(default)]
        team_id: Option<String>,
        /// 成员 id 或 `broadcast`（默认）
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        content: Option<String>,
        #[serde(default)]
        wait_for_ack: bool,
        #[serde(default)]
        message_type: Option<MessageType>,
    },
    TaskCreate {
        #[serde(default)]
        team_id: Option<String>,
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        description: String,
        #[serde(default)]
        dependencies: Vec<String>,
        #[serde(default)]
        priority: TaskPriority,
    },
    TaskUpdate {
        #[serde(default)]
        team_id: Option<String>,
        #[serde(default)]
        task_id: Option<String>,
        #[serde(default)]
        action: Option<TaskAction>,
        /// `assign` 的目标成员
        #[serde(default)]
        assignee: Option<String>,
        /// `complete` 的结果
        #[serde(default)]
        result: Option<serde_json::Value>,
    },
    TaskDelete {
        #[serde(default)]
        team_id: Option<String>,
        #[serde(default)]
        task_id: Option<String>,
    },
    TaskList {
        #[serde(default)]
        team_id: Option<String>,
        #[serde(default)]
        filter: TaskFilter,
    },
    Shutdown {
        #[serde(default)]
        team_id: Option<String>,
        /// 为空或等于调用者时关闭自身
        #[serde(default)]
        member_id: Option<String>,
    },
    Cleanup {
        #[serde(default)]
        team_id: Option<String>,
    },
    ListTeams {},
    GetStatus {
        #[serde(default)]
        team_id: Option<String>,
    },
}

impl TeamCommand {
    /// 命令名（即 `team_action` 的值）
    pub fn action_name(&self) -> &'static str {
        match self {
            TeamCommand::Create { .. } => "create",
            TeamCommand::Spawn { .. } => "spawn",
            TeamCommand::Message { .. } => "message",
            TeamCommand::TaskCreate { .. } => "task_create",
            TeamCommand::TaskUpdate { .. } => "task_update",
            TeamCommand::TaskDelete { .. } => "task_delete",
            TeamCommand::TaskList { .. } => "task_list",
            TeamCommand::Shutdown { .. } => "shutdown",
            TeamCommand::Cleanup { .. } => "cleanup",
            TeamCommand::ListTeams {} => "list_teams",
            TeamCommand::GetStatus { .. } => "get_status",
        }
    }

    /// 命令所属 team（`create` / `list_teams` 没有）
    pub fn team_id(&self) -> Option<&str> {
        match self {
            TeamCommand::Create { .. } | TeamCommand::ListTeams {} => None,
            TeamCommand::Spawn { team_id, .. }
            | TeamCommand::Message { team_id, .. }
            | TeamCommand::TaskCreate { team_id, .. }
            | TeamCommand::TaskUpdate { team_id, .. }
            | TeamCommand::TaskDelete { team_id, .. }
            | TeamCommand::TaskList { team_id, .. }
            | TeamCommand::Shutdown { team_id, .. }
            | TeamCommand::Cleanup { team_id }
            | TeamCommand::GetStatus { team_id } => team_id.as_deref(),
        }
    }

    /// 执行命令所需的能力，`None` 表示只读命令
    ///
    /// `caller_id` / `caller_role` 来自 team 记录中的调用者；
    /// `create` 没有 team，按声明的角色检查。
    pub fn required_capability(
        &self,
        caller_id: &str,
        caller_role: MemberRole,
    ) -> Option<Capability> {
        match self {
            TeamCommand::Create { .. } => Some(Capability::InviteMembers),
            TeamCommand::Spawn { .. } => Some(Capability::InviteMembers),
            TeamCommand::Message { to, .. } => match to.as_deref() {
                None | Some(BROADCAST) => Some(Capability::MessageAll),
                Some(_) => Some(Capability::MessageDirect),
            },
            TeamCommand::TaskCreate { .. } => Some(Capability::CreateTask),
            TeamCommand::TaskUpdate { action, .. } => match action {
                Some(TaskAction::Claim) | Some(TaskAction::Release) | None => {
                    Some(Capability::ClaimTask)
                }
                Some(TaskAction::Complete) => Some(Capability::CompleteTask),
                Some(TaskAction::Assign) => Some(Capability::AssignTask),
            },
            TeamCommand::TaskDelete { .. } => Some(Capability::DeleteTask),
            TeamCommand::Shutdown { member_id, .. } => {
                let is_self = member_id.as_deref().map_or(true, |id| id == caller_id);
                match (is_self, caller_role == MemberRole::Lead) {
                    (true, true) => Some(Capability::ShutdownTeam),
                    // teammate 总是可以关闭自己
                    (true, false) => None,
                    (false, _) => Some(Capability::ShutdownMember),
                }
            }
            TeamCommand::Cleanup { .. } => Some(Capability::ShutdownTeam),
            TeamCommand::TaskList { .. }
            | TeamCommand::ListTeams {}
            | TeamCommand::GetStatus { .. } => None,
        }
    }

    /// 已 inactive 的调用者能否执行（lead 在整队关闭后仍需 cleanup）
    pub fn allows_inactive_caller(&self) -> bool {
        matches!(
            self,
            TeamCommand::Cleanup { .. }
                | TeamCommand::GetStatus { .. }
                | TeamCommand::TaskList { .. }
                | TeamCommand::ListTeams {}
        )
    }

    /// 是否需要 lead 会话持续运行（teammate 连接的 broker 位于 lead 进程内）
    pub fn needs_live_session(&self) -> bool {
        matches!(self, TeamCommand::Spawn { .. })
    }
}

/// 取出必填字段，缺失或为空白时返回校验错误
pub fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| TeamError::validation(format!("{} is required", field)))
}
