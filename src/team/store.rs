//! Team Store 模块 - Team / 任务 / inbox 的文件持久化
//!
//! 目录结构（每个 team 一个目录）：
//! - `{root}/{team-id}/team.json` - Team 记录（含成员与任务副本）
//! - `{root}/{team-id}/tasks/{task-id}.json` - 每个任务一个文件
//! - `{root}/{team-id}/inboxes/{member-id}/{message-id}.json` - 每条消息一个文件
//! - `{root}/{team-id}/.lock` - 读-改-写使用的排他文件锁
//!
//! 所有修改都在 team 级文件锁内完成，并通过临时文件 + rename 原子写入，
//! 因此多个 teammate 进程同时 claim 同一任务时只会有一个成功。
//! 绕过本模块直接写这些文件是不安全的。

use chrono::Utc;
use fs2::FileExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::model::{
    generate_id, resolve_recipients, DisplayMode, MemberDraft, MemberRole, MemberStatus,
    MessageType, TaskDraft, TaskStatus, Team, TeamMember, TeamMessage, TeamState, TeamTask,
    BROADCAST,
};
use super::permissions::MemberPermissions;
use crate::config::TeamsConfig;
use crate::error::{Result, TeamError};

const TEAM_RECORD: &str = "team.json";
const LOCK_FILE: &str = ".lock";

/// Team 汇总状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamStatusReport {
    pub team_id: String,
    pub name: String,
    pub status: TeamState,
    pub member_count: usize,
    pub active_members: usize,
    pub members: Vec<MemberStatusSummary>,
    pub pending_tasks: usize,
    pub in_progress_tasks: usize,
    pub completed_tasks: usize,
    /// 未完成任务数（pending + in_progress）
    pub active_tasks: usize,
    pub unread_messages: usize,
}

/// 成员状态摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberStatusSummary {
    pub id: String,
    pub name: String,
    pub role: MemberRole,
    pub status: MemberStatus,
    pub unread_count: usize,
}

/// Team Store
#[derive(Debug, Clone)]
pub struct TeamStore {
    root: PathBuf,
}

impl TeamStore {
    /// 使用指定根目录创建 Store
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &TeamsConfig) -> Self {
        Self::new(config.data_dir.clone())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn team_dir(&self, team_id: &str) -> PathBuf {
        self.root.join(team_id)
    }

    fn team_record_path(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join(TEAM_RECORD)
    }

    fn tasks_dir(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join("tasks")
    }

    fn task_path(&self, team_id: &str, task_id: &str) -> PathBuf {
        self.tasks_dir(team_id).join(format!("{}.json", task_id))
    }

    fn inboxes_dir(&self, team_id: &str) -> PathBuf {
        self.team_dir(team_id).join("inboxes")
    }

    fn inbox_dir(&self, team_id: &str, member_id: &str) -> PathBuf {
        self.inboxes_dir(team_id).join(member_id)
    }

    /// 检查 team 是否存在
    pub fn team_exists(&self, team_id: &str) -> bool {
        is_safe_id(team_id) && self.team_record_path(team_id).exists()
    }

    /// 在 team 级排他锁保护下执行操作（阻塞等待其他进程释放）
    fn with_team_lock<F, T>(&self, team_id: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        if !self.team_exists(team_id) {
            return Err(TeamError::not_found("Team", team_id));
        }

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.team_dir(team_id).join(LOCK_FILE))?;

        lock_file.lock_exclusive()?;

        // 持锁后再次确认（等待期间 team 可能已被删除）
        let result = if self.team_exists(team_id) {
            operation()
        } else {
            Err(TeamError::not_found("Team", team_id))
        };

        if let Err(e) = FileExt::unlock(&lock_file) {
            // 文件关闭时锁同样会释放
            warn!(team_id = %team_id, error = %e, "Failed to release team lock");
        }

        result
    }

    fn read_team(&self, team_id: &str) -> Result<Team> {
        let path = self.team_record_path(team_id);
        if !is_safe_id(team_id) || !path.exists() {
            return Err(TeamError::not_found("Team", team_id));
        }
        read_json(&path)
    }

    fn write_team(&self, team: &Team) -> Result<()> {
        write_json_atomic(&self.team_record_path(&team.id), team)
    }

    fn read_task(&self, team_id: &str, task_id: &str) -> Result<TeamTask> {
        let path = self.task_path(team_id, task_id);
        if !is_safe_id(task_id) || !path.exists() {
            return Err(TeamError::not_found("Task", task_id));
        }
        read_json(&path)
    }

    fn write_task(&self, task: &TeamTask) -> Result<()> {
        write_json_atomic(&self.task_path(&task.team_id, &task.id), task)
    }

    fn read_all_tasks(&self, team_id: &str) -> Result<Vec<TeamTask>> {
        let dir = self.tasks_dir(team_id);
        let mut tasks: Vec<TeamTask> = Vec::new();

        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_file() && path.extension().is_some_and(|e| e == "json") {
                    tasks.push(read_json(&path)?);
                }
            }
        }

        // 按数字 ID 排序
        tasks.sort_by(|a, b| {
            let a_num: u64 = a.id.parse().unwrap_or(u64::MAX);
            let b_num: u64 = b.id.parse().unwrap_or(u64::MAX);
            a_num.cmp(&b_num).then_with(|| a.id.cmp(&b.id))
        });

        Ok(tasks)
    }

    // ==================== Team ====================

    /// 创建新 Team（同时创建 lead 成员）
    pub fn create_team(&self, name: &str, lead_session_id: &str, work_dir: &Path) -> Result<Team> {
        let name = name.trim();
        if name.is_empty() {
            return Err(TeamError::validation("team name is required"));
        }

        let team_id = generate_id("team");
        let lead_id = generate_id("lead");
        let now = Utc::now();

        let lead = TeamMember {
            id: lead_id.clone(),
            name: "team-lead".to_string(),
            role: MemberRole::Lead,
            role_label: Some("lead".to_string()),
            status: MemberStatus::Active,
            permissions: MemberPermissions::LEAD,
            display_mode: DisplayMode::InProcess,
            joined_at: now,
        };

        let team = Team {
            id: team_id.clone(),
            name: name.to_string(),
            created_at: now,
            lead_session_id: lead_session_id.to_string(),
            lead_member_id: lead_id.clone(),
            members: vec![lead],
            status: TeamState::Active,
            work_dir: work_dir.to_path_buf(),
            tasks: Vec::new(),
            next_task_seq: 1,
        };

        // 创建目录结构
        fs::create_dir_all(self.tasks_dir(&team_id))?;
        fs::create_dir_all(self.inbox_dir(&team_id, &lead_id))?;
        self.write_team(&team)?;

        info!(team_id = %team_id, name = %name, lead_id = %lead_id, "Team created");

        Ok(team)
    }

    /// 读取 Team
    pub fn get_team(&self, team_id: &str) -> Result<Team> {
        self.read_team(team_id)
    }

    /// 列出所有 Teams（按创建时间排序）
    pub fn list_teams(&self) -> Result<Vec<Team>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut teams = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() || !path.join(TEAM_RECORD).exists() {
                continue;
            }
            match read_json::<Team>(&path.join(TEAM_RECORD)) {
                Ok(team) => teams.push(team),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable team record")
                }
            }
        }

        teams.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(teams)
    }

    /// 删除 Team 及其全部数据（不可恢复）
    pub fn delete_team(&self, team_id: &str) -> Result<()> {
        self.with_team_lock(team_id, || {
            fs::remove_dir_all(self.team_dir(team_id))?;
            Ok(())
        })?;

        info!(team_id = %team_id, "Team deleted");
        Ok(())
    }

    /// 删除没有 active teammate 的 team（检查与删除在同一把锁内完成）
    ///
    /// lead 自身的 active 状态不阻止删除。
    pub fn delete_idle_team(&self, team_id: &str) -> Result<Team> {
        let team = self.with_team_lock(team_id, || {
            let team = self.read_team(team_id)?;
            let active: Vec<&str> = team
                .active_members()
                .filter(|m| !m.is_lead())
                .map(|m| m.name.as_str())
                .collect();
            if !active.is_empty() {
                return Err(TeamError::conflict(format!(
                    "Cannot clean up team '{}': {} teammate(s) still active ({}); \
                     shut them down first",
                    team.name,
                    active.len(),
                    active.join(", ")
                )));
            }

            fs::remove_dir_all(self.team_dir(team_id))?;
            Ok(team)
        })?;

        info!(team_id = %team_id, name = %team.name, "Idle team deleted");
        Ok(team)
    }

    /// 将整个 Team 标记为已关闭
    pub fn set_team_state(&self, team_id: &str, state: TeamState) -> Result<Team> {
        self.with_team_lock(team_id, || {
            let mut team = self.read_team(team_id)?;
            team.status = state;
            self.write_team(&team)?;
            Ok(team)
        })
    }

    // ==================== Members ====================

    /// 添加 teammate（分配 TEAMMATE 权限并创建 inbox）
    pub fn add_member(&self, team_id: &str, draft: MemberDraft) -> Result<TeamMember> {
        let name = draft.name.trim().to_string();
        if name.is_empty() {
            return Err(TeamError::validation("member name is required"));
        }

        let member = self.with_team_lock(team_id, || {
            let mut team = self.read_team(team_id)?;

            let member = TeamMember {
                id: draft.id.clone().unwrap_or_else(|| generate_id("member")),
                name: name.clone(),
                role: MemberRole::Teammate,
                role_label: draft.role_label.clone(),
                status: MemberStatus::Active,
                permissions: MemberPermissions::TEAMMATE,
                display_mode: draft.display_mode.unwrap_or(DisplayMode::InProcess),
                joined_at: Utc::now(),
            };

            match team.members.iter_mut().find(|m| m.id == member.id) {
                Some(existing) if existing.is_lead() => {
                    return Err(TeamError::conflict(format!(
                        "Member '{}' is the team lead",
                        member.id
                    )));
                }
                Some(existing) => *existing = member.clone(),
                None => team.members.push(member.clone()),
            }

            fs::create_dir_all(self.inbox_dir(team_id, &member.id))?;
            self.write_team(&team)?;
            Ok(member)
        })?;

        info!(team_id = %team_id, member_id = %member.id, name = %member.name, "Member added");
        Ok(member)
    }

    /// 读取成员
    pub fn get_member(&self, team_id: &str, member_id: &str) -> Result<TeamMember> {
        self.read_team(team_id)?
            .member(member_id)
            .cloned()
            .ok_or_else(|| TeamError::not_found("Member", member_id))
    }

    /// 更新成员状态（只允许 active → inactive）
    pub fn set_member_status(
        &self,
        team_id: &str,
        member_id: &str,
        status: MemberStatus,
    ) -> Result<TeamMember> {
        let member = self.with_team_lock(team_id, || {
            let mut team = self.read_team(team_id)?;
            let member = team
                .members
                .iter_mut()
                .find(|m| m.id == member_id)
                .ok_or_else(|| TeamError::not_found("Member", member_id))?;

            if member.status == MemberStatus::Inactive && status == MemberStatus::Active {
                return Err(TeamError::conflict(format!(
                    "Member '{}' is inactive and cannot be reactivated",
                    member_id
                )));
            }

            member.status = status;
            let member = member.clone();
            self.write_team(&team)?;
            Ok(member)
        })?;

        debug!(
            team_id = %team_id,
            member_id = %member_id,
            status = ?status,
            "Member status updated"
        );
        Ok(member)
    }

    // ==================== Tasks ====================

    /// 创建任务（任务 ID 在锁内顺序分配）
    pub fn create_task(
        &self,
        team_id: &str,
        draft: TaskDraft,
        created_by: &str,
    ) -> Result<TeamTask> {
        let title = draft.title.trim().to_string();
        if title.is_empty() {
            return Err(TeamError::validation("task title is required"));
        }

        let task = self.with_team_lock(team_id, || {
            let mut team = self.read_team(team_id)?;
            let id = team.next_task_seq.to_string();

            for dep in &draft.dependencies {
                if *dep == id {
                    return Err(TeamError::validation("a task cannot depend on itself"));
                }
                if !is_safe_id(dep) || !self.task_path(team_id, dep).exists() {
                    return Err(TeamError::not_found("Task", dep.as_str()));
                }
            }

            team.next_task_seq += 1;

            let now = Utc::now();
            let task = TeamTask {
                id,
                team_id: team_id.to_string(),
                title: title.clone(),
                description: draft.description.clone(),
                status: TaskStatus::Pending,
                assignee: None,
                dependencies: draft.dependencies.clone(),
                priority: draft.priority,
                created_at: now,
                updated_at: now,
                created_by: created_by.to_string(),
                result: None,
            };

            self.write_task(&task)?;
            team.tasks.push(task.clone());
            self.write_team(&team)?;
            Ok(task)
        })?;

        info!(team_id = %team_id, task_id = %task.id, title = %task.title, "Task created");
        Ok(task)
    }

    /// 读取任务
    pub fn get_task(&self, team_id: &str, task_id: &str) -> Result<TeamTask> {
        if !self.team_exists(team_id) {
            return Err(TeamError::not_found("Team", team_id));
        }
        self.read_task(team_id, task_id)
    }

    /// 列出所有任务（按 ID 排序）
    pub fn get_tasks(&self, team_id: &str) -> Result<Vec<TeamTask>> {
        if !self.team_exists(team_id) {
            return Err(TeamError::not_found("Team", team_id));
        }
        self.read_all_tasks(team_id)
    }

    /// 在锁内对任务执行读-改-写，同步 team 记录并刷新 updatedAt
    pub fn update_task<F>(&self, team_id: &str, task_id: &str, mutate: F) -> Result<TeamTask>
    where
        F: FnOnce(&mut TeamTask) -> Result<()>,
    {
        self.with_team_lock(team_id, || self.update_task_locked(team_id, task_id, mutate))
    }

    fn update_task_locked<F>(&self, team_id: &str, task_id: &str, mutate: F) -> Result<TeamTask>
    where
        F: FnOnce(&mut TeamTask) -> Result<()>,
    {
        let mut task = self.read_task(team_id, task_id)?;
        mutate(&mut task)?;
        task.updated_at = Utc::now();
        self.write_task(&task)?;

        let mut team = self.read_team(team_id)?;
        match team.tasks.iter_mut().find(|t| t.id == task.id) {
            Some(copy) => *copy = task.clone(),
            None => team.tasks.push(task.clone()),
        }
        self.write_team(&team)?;

        Ok(task)
    }

    /// 删除任务（任意状态）
    pub fn delete_task(&self, team_id: &str, task_id: &str) -> Result<TeamTask> {
        let task = self.with_team_lock(team_id, || {
            let task = self.read_task(team_id, task_id)?;
            fs::remove_file(self.task_path(team_id, task_id))?;

            let mut team = self.read_team(team_id)?;
            team.tasks.retain(|t| t.id != task_id);
            self.write_team(&team)?;
            Ok(task)
        })?;

        info!(team_id = %team_id, task_id = %task_id, "Task deleted");
        Ok(task)
    }

    /// 可领取的任务：pending 且所有依赖都已 completed（未知依赖视为未满足）
    pub fn get_available_tasks(&self, team_id: &str) -> Result<Vec<TeamTask>> {
        let tasks = self.get_tasks(team_id)?;

        let available = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Pending)
            .filter(|t| blocking_dependencies(t, &tasks).is_empty())
            .cloned()
            .collect();

        Ok(available)
    }

    /// 领取任务：pending → in_progress（锁内 compare-and-set）
    pub fn claim_task(&self, team_id: &str, task_id: &str, member_id: &str) -> Result<TeamTask> {
        let task = self.with_team_lock(team_id, || {
            let team = self.read_team(team_id)?;
            let member = team
                .member(member_id)
                .ok_or_else(|| TeamError::not_found("Member", member_id))?;
            if !member.is_active() {
                return Err(TeamError::conflict(format!(
                    "Member '{}' is inactive",
                    member_id
                )));
            }

            let tasks = self.read_all_tasks(team_id)?;
            let current = tasks
                .iter()
                .find(|t| t.id == task_id)
                .ok_or_else(|| TeamError::not_found("Task", task_id))?;

            if current.status != TaskStatus::Pending {
                return Err(TeamError::conflict(format!(
                    "Task '{}' is {} and cannot be claimed",
                    task_id, current.status
                )));
            }

            if let Some(reserved) = current.assignee.as_deref().filter(|a| *a != member_id) {
                return Err(TeamError::conflict(format!(
                    "Task '{}' is assigned to '{}'",
                    task_id, reserved
                )));
            }

            let blocking = blocking_dependencies(current, &tasks);
            if !blocking.is_empty() {
                return Err(TeamError::conflict(format!(
                    "Task '{}' is blocked by unfinished dependencies: {}",
                    task_id,
                    blocking.join(", ")
                )));
            }

            self.update_task_locked(team_id, task_id, |task| {
                task.status = TaskStatus::InProgress;
                task.assignee = Some(member_id.to_string());
                Ok(())
            })
        })?;

        info!(team_id = %team_id, task_id = %task_id, member_id = %member_id, "Task claimed");
        Ok(task)
    }

    /// 预分配 pending 任务给成员（状态保持 pending，只有该成员可以 claim）
    pub fn assign_task(&self, team_id: &str, task_id: &str, member_id: &str) -> Result<TeamTask> {
        let task = self.with_team_lock(team_id, || {
            let team = self.read_team(team_id)?;
            if team.member(member_id).is_none() {
                return Err(TeamError::not_found("Member", member_id));
            }

            self.update_task_locked(team_id, task_id, |task| {
                if task.status != TaskStatus::Pending {
                    return Err(TeamError::conflict(format!(
                        "Task '{}' is {} and cannot be assigned",
                        task_id, task.status
                    )));
                }
                task.assignee = Some(member_id.to_string());
                Ok(())
            })
        })?;

        info!(team_id = %team_id, task_id = %task_id, member_id = %member_id, "Task assigned");
        Ok(task)
    }

    /// 完成任务：in_progress → completed
    ///
    /// `by` 为 `Some` 时要求调用者是当前 assignee。
    pub fn complete_task(
        &self,
        team_id: &str,
        task_id: &str,
        by: Option<&str>,
        result: Option<serde_json::Value>,
    ) -> Result<TeamTask> {
        let task = self.update_task(team_id, task_id, |task| {
            if task.status != TaskStatus::InProgress {
                return Err(TeamError::conflict(format!(
                    "Task '{}' is {} and cannot be completed",
                    task_id, task.status
                )));
            }
            check_assignee(task, by)?;
            task.status = TaskStatus::Completed;
            task.result = result;
            Ok(())
        })?;

        info!(team_id = %team_id, task_id = %task_id, "Task completed");
        Ok(task)
    }

    /// 释放任务：in_progress → pending，清空 assignee
    pub fn release_task(&self, team_id: &str, task_id: &str, by: Option<&str>) -> Result<TeamTask> {
        let task = self.update_task(team_id, task_id, |task| {
            if task.status != TaskStatus::InProgress {
                return Err(TeamError::conflict(format!(
                    "Task '{}' is {} and cannot be released",
                    task_id, task.status
                )));
            }
            check_assignee(task, by)?;
            task.status = TaskStatus::Pending;
            task.assignee = None;
            Ok(())
        })?;

        info!(team_id = %team_id, task_id = %task_id, "Task released");
        Ok(task)
    }

    // ==================== Inbox ====================

    /// 构造并持久化消息（广播时写入除发送者外每个 active 成员的 inbox）
    pub fn send_message(
        &self,
        team_id: &str,
        from: &str,
        to: &str,
        content: &str,
        message_type: MessageType,
    ) -> Result<TeamMessage> {
        let team = self.read_team(team_id)?;
        if team.member(from).is_none() {
            return Err(TeamError::not_found("Member", from));
        }
        if to != BROADCAST && team.member(to).is_none() {
            return Err(TeamError::not_found("Member", to));
        }

        // 广播只发给仍在线的成员
        let recipients = resolve_recipients(from, to, team.active_members().map(|m| m.id.as_str()));
        let message = TeamMessage::new(team_id, from, to, content, message_type, &recipients);
        self.persist_message(&message)?;
        Ok(message)
    }

    /// 持久化一条已构造的消息到每个接收者的 inbox
    pub fn persist_message(&self, message: &TeamMessage) -> Result<()> {
        let team_id = message.team_id.as_str();
        self.with_team_lock(team_id, || {
            for delivery in &message.deliveries {
                let dir = self.inbox_dir(team_id, &delivery.recipient);
                fs::create_dir_all(&dir)?;
                write_json_atomic(&dir.join(format!("{}.json", message.id)), message)?;
            }
            Ok(())
        })?;

        debug!(
            team_id = %team_id,
            message_id = %message.id,
            recipients = message.deliveries.len(),
            "Message persisted to inboxes"
        );
        Ok(())
    }

    fn read_inbox(&self, team_id: &str, member_id: &str) -> Result<Vec<(PathBuf, TeamMessage)>> {
        let dir = self.inbox_dir(team_id, member_id);
        let mut messages = Vec::new();

        if dir.exists() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.is_file() && path.extension().is_some_and(|e| e == "json") {
                    let message: TeamMessage = read_json(&path)?;
                    messages.push((path, message));
                }
            }
        }

        messages.sort_by(|(_, a), (_, b)| {
            a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
        });
        Ok(messages)
    }

    /// 读取成员 inbox（按时间顺序）
    pub fn get_messages(
        &self,
        team_id: &str,
        member_id: &str,
        unread_only: bool,
    ) -> Result<Vec<TeamMessage>> {
        let team = self.read_team(team_id)?;
        if team.member(member_id).is_none() {
            return Err(TeamError::not_found("Member", member_id));
        }

        Ok(self
            .read_inbox(team_id, member_id)?
            .into_iter()
            .map(|(_, m)| m)
            .filter(|m| !unread_only || !m.read)
            .collect())
    }

    /// 标记消息为已读，`ids` 为 `None` 时标记全部，返回新标记的数量
    pub fn mark_messages_read(
        &self,
        team_id: &str,
        member_id: &str,
        ids: Option<&[String]>,
    ) -> Result<usize> {
        self.with_team_lock(team_id, || {
            let mut marked = 0;
            for (path, mut message) in self.read_inbox(team_id, member_id)? {
                let selected = ids.map_or(true, |ids| ids.iter().any(|id| *id == message.id));
                if selected && !message.read {
                    message.read = true;
                    write_json_atomic(&path, &message)?;
                    marked += 1;
                }
            }
            Ok(marked)
        })
    }

    /// 清空成员 inbox，返回删除的消息数
    pub fn clear_messages(&self, team_id: &str, member_id: &str) -> Result<usize> {
        self.with_team_lock(team_id, || {
            let messages = self.read_inbox(team_id, member_id)?;
            for (path, _) in &messages {
                fs::remove_file(path)?;
            }
            Ok(messages.len())
        })
    }

    // ==================== Status ====================

    /// 获取 Team 汇总状态
    pub fn get_team_status(&self, team_id: &str) -> Result<TeamStatusReport> {
        let team = self.read_team(team_id)?;
        let tasks = self.read_all_tasks(team_id)?;

        let mut members = Vec::new();
        let mut total_unread = 0;
        for m in &team.members {
            let unread_count = self
                .read_inbox(team_id, &m.id)?
                .iter()
                .filter(|(_, msg)| !msg.read)
                .count();
            total_unread += unread_count;

            members.push(MemberStatusSummary {
                id: m.id.clone(),
                name: m.name.clone(),
                role: m.role,
                status: m.status,
                unread_count,
            });
        }

        let count = |status: TaskStatus| tasks.iter().filter(|t| t.status == status).count();
        let pending_tasks = count(TaskStatus::Pending);
        let in_progress_tasks = count(TaskStatus::InProgress);

        Ok(TeamStatusReport {
            team_id: team.id.clone(),
            name: team.name.clone(),
            status: team.status,
            member_count: team.members.len(),
            active_members: team.active_members().count(),
            members,
            pending_tasks,
            in_progress_tasks,
            completed_tasks: count(TaskStatus::Completed),
            active_tasks: pending_tasks + in_progress_tasks,
            unread_messages: total_unread,
        })
    }
}

impl Default for TeamStore {
    fn default() -> Self {
        Self::from_config(&TeamsConfig::default())
    }
}

/// 返回尚未完成（或不存在）的依赖 ID
fn blocking_dependencies(task: &TeamTask, all: &[TeamTask]) -> Vec<String> {
    task.dependencies
        .iter()
        .filter(|dep| {
            !all.iter()
                .any(|t| t.id == **dep && t.status == TaskStatus::Completed)
        })
        .cloned()
        .collect()
}

/// id 会被用作路径分量
fn is_safe_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

fn check_assignee(task: &TeamTask, by: Option<&str>) -> Result<()> {
    match (by, task.assignee.as_deref()) {
        (Some(member), Some(assignee)) if member != assignee => Err(TeamError::conflict(format!(
            "Task '{}' is assigned to '{}', not '{}'",
            task.id, assignee, member
        ))),
        _ => Ok(()),
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|source| TeamError::Corrupt {
        path: path.to_path_buf(),
        source,
    })
}

/// 先写临时文件再 rename，避免读者看到半写入的记录
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value).map_err(|source| TeamError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    let temp = path.with_extension("json.tmp");
    fs::write(&temp, content)?;
    fs::rename(&temp, path)?;
    Ok(())
}
