//! Team Coordinator - 命令的唯一入口
//!
//! 解析调用者身份、检查权限，再把命令路由到 Store / Broker / Spawner。
//! 领域错误统一转换为 `{success: false, message}`，
//! 只有 I/O 和损坏记录会作为 `Err` 返回。

pub mod command;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::protocol::TOOL_NAMES;
use crate::broker::MessageBroker;
use crate::config::{CallerContext, TeamsConfig};
use crate::error::{Result, TeamError};
use crate::spawner::{TeammateConfig, TeammateSpawner};
use crate::team::model::{
    generate_id, DisplayMode, MemberRole, MemberStatus, MessageType, TaskDraft, TaskPriority,
    TaskStatus, Team, TeamMember, TeamMessage, TeamState, BROADCAST,
};
use crate::team::permissions::MemberPermissions;
use crate::team::store::TeamStore;

pub use command::{required, TaskAction, TaskFilter, TeamCommand};

/// 命令执行结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
}

impl ExecuteResult {
    pub fn ok(message: impl Into<String>, result: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            result: Some(result),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            result: None,
        }
    }
}

/// Team Coordinator
pub struct TeamCoordinator {
    store: Arc<TeamStore>,
    spawner: TeammateSpawner,
    config: TeamsConfig,
    /// 每个 team 一个 broker，首次使用时启动
    brokers: Mutex<HashMap<String, Arc<MessageBroker>>>,
}

impl TeamCoordinator {
    pub fn new(store: Arc<TeamStore>, spawner: TeammateSpawner, config: TeamsConfig) -> Self {
        Self {
            store,
            spawner,
            config,
            brokers: Mutex::new(HashMap::new()),
        }
    }

    /// 按配置构造 Store 和 Spawner
    pub fn from_config(config: TeamsConfig) -> Self {
        let store = Arc::new(TeamStore::from_config(&config));
        let spawner = TeammateSpawner::new(store.clone(), config.clone());
        Self::new(store, spawner, config)
    }

    pub fn store(&self) -> &TeamStore {
        &self.store
    }

    pub fn spawner(&self) -> &TeammateSpawner {
        &self.spawner
    }

    /// 执行命令
    pub async fn execute(
        &self,
        caller: &CallerContext,
        command: TeamCommand,
    ) -> Result<ExecuteResult> {
        let action = command.action_name();
        debug!(action = %action, caller = ?caller.member_id, "Executing team command");

        match self.dispatch(caller, command).await {
            Ok(result) => Ok(result),
            Err(e) if e.is_fatal() => {
                error!(action = %action, error = %e, "Team command failed");
                Err(e)
            }
            Err(e) => {
                info!(action = %action, error = %e, "Team command rejected");
                Ok(ExecuteResult::failure(e.to_string()))
            }
        }
    }

    /// 执行 JSON 形式的命令，无法解析时返回校验失败
    pub async fn execute_json(
        &self,
        caller: &CallerContext,
        params: Value,
    ) -> Result<ExecuteResult> {
        match serde_json::from_value::<TeamCommand>(params) {
            Ok(command) => self.execute(caller, command).await,
            Err(e) => Ok(ExecuteResult::failure(
                TeamError::validation(format!("invalid team command: {}", e)).to_string(),
            )),
        }
    }

    /// 停止所有 broker
    pub async fn shutdown_brokers(&self) {
        let brokers: Vec<Arc<MessageBroker>> =
            self.brokers.lock().await.drain().map(|(_, b)| b).collect();
        for broker in brokers {
            broker.stop().await;
        }
    }

    /// 已启动的 broker（不会触发启动）
    pub async fn broker(&self, team_id: &str) -> Option<Arc<MessageBroker>> {
        self.brokers.lock().await.get(team_id).cloned()
    }

    /// 获取或启动 team 的 broker，并把名册同步为当前 active 成员
    pub async fn broker_for(&self, team: &Team) -> Result<Arc<MessageBroker>> {
        let mut brokers = self.brokers.lock().await;
        let broker = brokers
            .entry(team.id.clone())
            .or_insert_with(|| {
                Arc::new(MessageBroker::new(team.id.clone(), self.config.ack_timeout()))
            })
            .clone();

        // 已运行时直接返回原端口
        broker.start().await?;
        broker.attach_local_member(&team.lead_member_id);
        for member in &team.members {
            if member.is_active() {
                broker.add_member(&member.id);
            } else {
                broker.remove_member(&member.id);
            }
        }
        Ok(broker)
    }

    /// 取出 broker 为 lead 实时接收的消息（同一批消息也保存在 lead 的 inbox 中）
    pub async fn take_lead_messages(&self, team_id: &str) -> Vec<TeamMessage> {
        match self.broker(team_id).await {
            Some(broker) => broker.take_local_messages(),
            None => Vec::new(),
        }
    }

    /// 取出所有运行中 broker 为 lead 接收的消息
    pub async fn take_all_lead_messages(&self) -> Vec<TeamMessage> {
        let brokers = self.brokers.lock().await;
        brokers
            .values()
            .flat_map(|broker| broker.take_local_messages())
            .collect()
    }

    async fn evict_broker(&self, team_id: &str) {
        let broker = self.brokers.lock().await.remove(team_id);
        if let Some(broker) = broker {
            broker.stop().await;
        }
    }

    // ==================== 路由 ====================

    async fn dispatch(
        &self,
        caller: &CallerContext,
        command: TeamCommand,
    ) -> Result<ExecuteResult> {
        match command {
            TeamCommand::Create { name, work_dir } => self.create_team(caller, name, work_dir),
            TeamCommand::ListTeams {} => self.list_teams(),
            command => self.dispatch_team(caller, command).await,
        }
    }

    async fn dispatch_team(
        &self,
        caller: &CallerContext,
        command: TeamCommand,
    ) -> Result<ExecuteResult> {
        let team_id = command
            .team_id()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TeamError::validation("team_id is required"))?
            .to_string();
        let team = self.store.get_team(&team_id)?;
        let actor = resolve_caller(caller, &team)?;
        authorize(&command, &actor)?;

        match command {
            TeamCommand::Spawn {
                teammates,
                display_mode,
                ..
            } => {
                ensure_team_active(&team)?;
                self.spawn(&team, &teammates, display_mode).await
            }
            TeamCommand::Message {
                to,
                content,
                wait_for_ack,
                message_type,
                ..
            } => {
                ensure_team_active(&team)?;
                let content = required(&content, "content")?;
                self.message(&team, &actor, to.as_deref(), content, wait_for_ack, message_type)
                    .await
            }
            TeamCommand::TaskCreate {
                title,
                description,
                dependencies,
                priority,
                ..
            } => {
                ensure_team_active(&team)?;
                let title = required(&title, "title")?;
                self.create_task(&team, &actor, title, description, dependencies, priority)
            }
            TeamCommand::TaskUpdate {
                task_id,
                action,
                assignee,
                result,
                ..
            } => {
                ensure_team_active(&team)?;
                let task_id = required(&task_id, "task_id")?;
                let action = action.ok_or_else(|| {
                    TeamError::validation(
                        "action is required (claim | complete | release | assign)",
                    )
                })?;
                self.update_task(&team, &actor, task_id, action, assignee, result)
            }
            TeamCommand::TaskDelete { task_id, .. } => {
                let task_id = required(&task_id, "task_id")?;
                let task = self.store.delete_task(&team.id, task_id)?;
                Ok(ExecuteResult::ok(
                    format!("Task {} deleted", task.id),
                    json!({ "task": task }),
                ))
            }
            TeamCommand::TaskList { filter, .. } => self.list_tasks(&team, filter),
            TeamCommand::Shutdown { member_id, .. } => {
                let target = member_id
                    .as_deref()
                    .map(str::trim)
                    .filter(|id| !id.is_empty() && *id != actor.id);
                match target {
                    Some(target) => self.shutdown_member(&team, &actor, target).await,
                    None if actor.is_lead() => self.shutdown_team(&team, &actor).await,
                    None => self.shutdown_member(&team, &actor, &actor.id).await,
                }
            }
            TeamCommand::Cleanup { .. } => self.cleanup(&team).await,
            TeamCommand::GetStatus { .. } => self.get_status(&team).await,
            other @ (TeamCommand::Create { .. } | TeamCommand::ListTeams {}) => {
                Err(TeamError::validation(format!(
                    "{} is not a team-scoped action",
                    other.action_name()
                )))
            }
        }
    }

    // ==================== Team ====================

    fn create_team(
        &self,
        caller: &CallerContext,
        name: Option<String>,
        work_dir: Option<PathBuf>,
    ) -> Result<ExecuteResult> {
        let command = TeamCommand::Create {
            name: None,
            work_dir: None,
        };
        let caller_id = caller.member_id.as_deref().unwrap_or_default();
        if let Some(capability) = command.required_capability(caller_id, caller.role) {
            if !MemberPermissions::for_role(caller.role).allows(capability) {
                return Err(TeamError::PermissionDenied(format!(
                    "create requires {} ({} role)",
                    capability, caller.role
                )));
            }
        }

        let name = required(&name, "name")?;
        let work_dir = match work_dir {
            Some(dir) => dir,
            None => std::env::current_dir()?,
        };
        let session_id = caller
            .session_id
            .clone()
            .unwrap_or_else(|| generate_id("session"));

        let team = self.store.create_team(name, &session_id, &work_dir)?;
        Ok(ExecuteResult::ok(
            format!("Team '{}' created", team.name),
            json!({
                "team_id": team.id,
                "name": team.name,
                "lead_member_id": team.lead_member_id,
                "lead_session_id": team.lead_session_id,
                "work_dir": team.work_dir,
            }),
        ))
    }

    fn list_teams(&self) -> Result<ExecuteResult> {
        let teams = self.store.list_teams()?;
        let summaries: Vec<Value> = teams
            .iter()
            .map(|team| {
                json!({
                    "team_id": team.id,
                    "name": team.name,
                    "status": team.status,
                    "created_at": team.created_at,
                    "member_count": team.members.len(),
                    "active_members": team.active_members().count(),
                    "task_count": team.tasks.len(),
                })
            })
            .collect();

        Ok(ExecuteResult::ok(
            format!("{} team(s)", summaries.len()),
            json!({ "teams": summaries }),
        ))
    }

    async fn get_status(&self, team: &Team) -> Result<ExecuteResult> {
        let exited = self.spawner.refresh(&team.id);
        let report = self.store.get_team_status(&team.id)?;
        let broker = match self.broker(&team.id).await {
            Some(broker) => {
                for member_id in &exited {
                    broker.remove_member(member_id);
                }
                json!({
                "running": broker.is_connected(),
                "connected": broker.is_server_connected(),
                "port": broker.port(),
                "tool_names": broker.tool_names(),
                "members": broker.members(),
                "connected_members": broker.connected_members(),
                })
            }
            None => json!({
                "running": false,
                "connected": false,
                "port": null,
                "tool_names": TOOL_NAMES,
                "members": [],
                "connected_members": [],
            }),
        };

        Ok(ExecuteResult::ok(
            format!(
                "Team '{}': {}/{} members active, {} pending, {} in progress, {} completed",
                report.name,
                report.active_members,
                report.member_count,
                report.pending_tasks,
                report.in_progress_tasks,
                report.completed_tasks
            ),
            json!({
                "status": report,
                "broker": broker,
                "handles": self.spawner.handles(&team.id),
            }),
        ))
    }

    async fn spawn(
        &self,
        team: &Team,
        teammates: &[TeammateConfig],
        display_mode: Option<DisplayMode>,
    ) -> Result<ExecuteResult> {
        if teammates.is_empty() {
            return Err(TeamError::validation("teammates must list at least one teammate"));
        }

        let broker = self.broker_for(team).await?;
        let mode = display_mode.unwrap_or(self.config.default_display_mode);
        let outcomes = self
            .spawner
            .spawn_batch(&team.id, teammates, &team.work_dir, mode, &broker)
            .await;

        let total = outcomes.len();
        let mut spawned = 0;
        let mut results = Vec::with_capacity(total);
        for outcome in outcomes {
            match outcome.result {
                Ok(teammate) => {
                    spawned += 1;
                    results.push(json!({
                        "name": outcome.name,
                        "success": true,
                        "member_id": teammate.member.id,
                        "display_mode": teammate.display.effective,
                        "warning": teammate.display.warning,
                        "handle": teammate.handle,
                    }));
                }
                Err(e) => results.push(json!({
                    "name": outcome.name,
                    "success": false,
                    "error": e.to_string(),
                })),
            }
        }

        Ok(ExecuteResult {
            success: spawned > 0,
            message: format!("Spawned {} of {} teammate(s)", spawned, total),
            result: Some(json!({
                "broker_port": broker.port(),
                "teammates": results,
            })),
        })
    }

    // ==================== Messages ====================

    async fn message(
        &self,
        team: &Team,
        actor: &TeamMember,
        to: Option<&str>,
        content: &str,
        wait_for_ack: bool,
        message_type: Option<MessageType>,
    ) -> Result<ExecuteResult> {
        let to = to.map(str::trim).filter(|t| !t.is_empty()).unwrap_or(BROADCAST);
        let message_type = message_type.unwrap_or(if to == BROADCAST {
            MessageType::Broadcast
        } else {
            MessageType::Message
        });

        // 先写入 inbox，broker 只负责实时投递
        let message = self
            .store
            .send_message(&team.id, &actor.id, to, content, message_type)?;
        let broker = self.broker_for(team).await?;

        if !wait_for_ack {
            let deliveries = broker.deliver(&message)?;
            return Ok(ExecuteResult::ok(
                format!("Message sent to {} recipient(s)", deliveries.len()),
                json!({
                    "message_id": message.id,
                    "to": message.to,
                    "deliveries": deliveries,
                }),
            ));
        }

        let outcome = broker.collect_acks(&message, self.config.ack_timeout()).await?;
        let result = json!({
            "message_id": outcome.message_id,
            "to": message.to,
            "timed_out": outcome.timed_out,
            "unacknowledged": outcome.unacknowledged(),
            "deliveries": outcome.deliveries,
        });

        if outcome.is_delivery_timeout() {
            return Ok(ExecuteResult {
                success: false,
                message: format!(
                    "{} (message kept in recipient inboxes)",
                    TeamError::DeliveryTimeout(message.id.clone())
                ),
                result: Some(result),
            });
        }

        Ok(ExecuteResult::ok(
            format!(
                "Message acknowledged by {} of {} recipient(s)",
                outcome.acknowledged(),
                outcome.deliveries.len()
            ),
            result,
        ))
    }

    // ==================== Tasks ====================

    fn create_task(
        &self,
        team: &Team,
        actor: &TeamMember,
        title: &str,
        description: String,
        dependencies: Vec<String>,
        priority: TaskPriority,
    ) -> Result<ExecuteResult> {
        let task = self.store.create_task(
            &team.id,
            TaskDraft {
                title: title.to_string(),
                description,
                dependencies,
                priority,
            },
            &actor.id,
        )?;

        Ok(ExecuteResult::ok(
            format!("Task {} created: {}", task.id, task.title),
            json!({ "task": task }),
        ))
    }

    fn update_task(
        &self,
        team: &Team,
        actor: &TeamMember,
        task_id: &str,
        action: TaskAction,
        assignee: Option<String>,
        result: Option<Value>,
    ) -> Result<ExecuteResult> {
        // lead 可以代替 assignee 完成或释放任务
        let acting_as = (!actor.is_lead()).then_some(actor.id.as_str());

        let (task, verb) = match action {
            TaskAction::Claim => (self.store.claim_task(&team.id, task_id, &actor.id)?, "claimed"),
            TaskAction::Complete => (
                self.store.complete_task(&team.id, task_id, acting_as, result)?,
                "completed",
            ),
            TaskAction::Release => (
                self.store.release_task(&team.id, task_id, acting_as)?,
                "released",
            ),
            TaskAction::Assign => {
                let assignee = required(&assignee, "assignee")?;
                (self.store.assign_task(&team.id, task_id, assignee)?, "assigned")
            }
        };

        Ok(ExecuteResult::ok(
            format!("Task {} {}", task.id, verb),
            json!({ "task": task }),
        ))
    }

    fn list_tasks(&self, team: &Team, filter: TaskFilter) -> Result<ExecuteResult> {
        let tasks = match filter {
            TaskFilter::Available => self.store.get_available_tasks(&team.id)?,
            TaskFilter::All => self.store.get_tasks(&team.id)?,
            TaskFilter::Pending | TaskFilter::InProgress | TaskFilter::Completed => {
                let status = match filter {
                    TaskFilter::Pending => TaskStatus::Pending,
                    TaskFilter::InProgress => TaskStatus::InProgress,
                    _ => TaskStatus::Completed,
                };
                self.store
                    .get_tasks(&team.id)?
                    .into_iter()
                    .filter(|t| t.status == status)
                    .collect()
            }
        };

        Ok(ExecuteResult::ok(
            format!("{} task(s)", tasks.len()),
            json!({ "count": tasks.len(), "tasks": tasks }),
        ))
    }

    // ==================== Shutdown / Cleanup ====================

    async fn shutdown_member(
        &self,
        team: &Team,
        actor: &TeamMember,
        member_id: &str,
    ) -> Result<ExecuteResult> {
        let target = self.store.get_member(&team.id, member_id)?;
        if target.is_lead() {
            return Err(TeamError::validation(
                "the team lead cannot be shut down individually; shut down the team instead",
            ));
        }

        if target.is_active() && actor.id != target.id {
            self.notify_shutdown(team, &actor.id, &target.id).await;
        }

        let member = self.spawner.shutdown_teammate(&team.id, &target.id).await?;
        if let Some(broker) = self.broker(&team.id).await {
            broker.remove_member(&member.id);
        }

        Ok(ExecuteResult::ok(
            format!("Teammate '{}' shut down", member.name),
            json!({ "member": member }),
        ))
    }

    async fn shutdown_team(&self, team: &Team, actor: &TeamMember) -> Result<ExecuteResult> {
        self.notify_shutdown(team, &actor.id, BROADCAST).await;

        let terminated = self.spawner.shutdown_team_members(&team.id).await?;

        // 其他进程启动的成员同样标记为 inactive，包括 lead 自身
        let team_now = self.store.get_team(&team.id)?;
        let mut deactivated = Vec::new();
        for member in team_now.active_members() {
            self.store
                .set_member_status(&team.id, &member.id, MemberStatus::Inactive)?;
            deactivated.push(member.id.clone());
        }
        self.store.set_team_state(&team.id, TeamState::Shutdown)?;
        self.evict_broker(&team.id).await;

        info!(team_id = %team.id, terminated = terminated.len(), "Team shut down");
        Ok(ExecuteResult::ok(
            format!("Team '{}' shut down", team.name),
            json!({
                "terminated": terminated,
                "deactivated": deactivated,
            }),
        ))
    }

    /// 持久化并尽量实时投递 shutdown 消息（只使用已启动的 broker）
    async fn notify_shutdown(&self, team: &Team, from: &str, to: &str) {
        let message = match self
            .store
            .send_message(&team.id, from, to, "shutdown", MessageType::Shutdown)
        {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    team_id = %team.id,
                    to = %to,
                    error = %e,
                    "Failed to record shutdown message"
                );
                return;
            }
        };

        if let Some(broker) = self.broker(&team.id).await {
            if let Err(e) = broker.deliver(&message) {
                debug!(team_id = %team.id, error = %e, "Shutdown message not delivered live");
            }
        }
    }

    async fn cleanup(&self, team: &Team) -> Result<ExecuteResult> {
        // 已退出的 teammate 不应阻止清理
        self.spawner.refresh(&team.id);
        let deleted = self.store.delete_idle_team(&team.id)?;

        self.evict_broker(&team.id).await;
        self.spawner.forget_team(&team.id);

        info!(team_id = %team.id, name = %deleted.name, "Team cleaned up");
        Ok(ExecuteResult::ok(
            format!("Team '{}' cleaned up", deleted.name),
            json!({ "team_id": deleted.id }),
        ))
    }
}

/// 把调用者解析为 team 中的成员，权限只取自存储的成员记录
fn resolve_caller(caller: &CallerContext, team: &Team) -> Result<TeamMember> {
    let member = match caller.member_id.as_deref() {
        Some(member_id) => team.member(member_id).cloned().ok_or_else(|| {
            TeamError::PermissionDenied(format!(
                "'{}' is not a member of team '{}'",
                member_id, team.id
            ))
        })?,
        None => match caller.session_id.as_deref() {
            Some(session) if caller.role == MemberRole::Lead && session == team.lead_session_id => {
                team.lead()
                    .cloned()
                    .ok_or_else(|| TeamError::not_found("Member", team.lead_member_id.clone()))?
            }
            _ => {
                return Err(TeamError::PermissionDenied(format!(
                    "caller is not identified as a member of team '{}'",
                    team.id
                )))
            }
        },
    };

    if member.role != caller.role {
        debug!(
            member_id = %member.id,
            claimed = %caller.role,
            stored = %member.role,
            "Ignoring claimed role"
        );
    }
    Ok(member)
}

fn authorize(command: &TeamCommand, actor: &TeamMember) -> Result<()> {
    if !actor.is_active() && !command.allows_inactive_caller() {
        return Err(TeamError::PermissionDenied(format!(
            "member '{}' is inactive",
            actor.name
        )));
    }

    match command.required_capability(&actor.id, actor.role) {
        Some(capability) if !actor.permissions.allows(capability) => {
            Err(TeamError::PermissionDenied(format!(
                "{} requires {} ({} '{}')",
                command.action_name(),
                capability,
                actor.role,
                actor.name
            )))
        }
        _ => Ok(()),
    }
}

fn ensure_team_active(team: &Team) -> Result<()> {
    match team.status {
        TeamState::Active => Ok(()),
        TeamState::Shutdown => Err(TeamError::conflict(format!(
            "team '{}' has been shut down",
            team.name
        ))),
    }
}
