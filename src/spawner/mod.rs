//! Teammate Spawner - teammate 执行上下文的创建与终止
//!
//! - `display` - 显示模式协商
//! - `tmux` - 独立终端显示面
//!
//! 启动分两步：`prepare` 生成成员 id（调用方可先登记到 broker 名册），
//! `launch` 写入 Store 并按显示模式启动进程/任务。

pub mod display;
pub mod tmux;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{MessageBroker, TeammateClient};
use crate::config::{
    TeamsConfig, ENV_BROKER_PORT, ENV_MEMBER_ID, ENV_ROLE, ENV_TEAM_ID, ENV_WORK_DIR,
};
use crate::error::{Result, TeamError};
use crate::team::model::{
    generate_id, DisplayMode, MemberDraft, MemberRole, MemberStatus, TeamMember,
};
use crate::team::store::TeamStore;

pub use display::DisplayNegotiation;
pub use tmux::TmuxManager;

/// 单个 teammate 的启动参数
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeammateConfig {
    pub name: String,
    /// 描述性角色标签（如 "reviewer"）
    #[serde(default, alias = "role")]
    pub role_label: Option<String>,
    /// 覆盖本次 spawn 的显示模式
    #[serde(default)]
    pub display_mode: Option<DisplayMode>,
}

impl TeammateConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// 执行上下文生命周期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnState {
    Spawning,
    Active,
    Terminated,
    Failed,
}

/// teammate 执行上下文句柄
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeammateHandle {
    pub team_id: String,
    pub member_id: String,
    pub name: String,
    pub display_mode: DisplayMode,
    pub state: SpawnState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tmux_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// 已生成 id、尚未启动的 teammate
#[derive(Debug, Clone)]
pub struct PreparedTeammate {
    pub team_id: String,
    pub member_id: String,
    pub config: TeammateConfig,
}

/// spawn 成功的结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnedTeammate {
    pub member: TeamMember,
    pub handle: TeammateHandle,
    pub display: DisplayNegotiation,
}

/// 批量 spawn 中单个 teammate 的结果
#[derive(Debug)]
pub struct SpawnOutcome {
    pub name: String,
    pub result: Result<SpawnedTeammate>,
}

enum Runtime {
    Tmux { session: String },
    Process(Child),
    InProcess(JoinHandle<()>),
}

struct Entry {
    handle: TeammateHandle,
    runtime: Option<Runtime>,
}

/// Teammate Spawner
pub struct TeammateSpawner {
    store: Arc<TeamStore>,
    config: TeamsConfig,
    tmux: TmuxManager,
    entries: Mutex<HashMap<String, Entry>>,
}

impl TeammateSpawner {
    pub fn new(store: Arc<TeamStore>, config: TeamsConfig) -> Self {
        let tmux = TmuxManager::new(config.tmux_program.clone());
        Self {
            store,
            config,
            tmux,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 探测显示模式是否可用
    pub fn is_display_mode_available(&self, mode: DisplayMode) -> bool {
        match mode {
            DisplayMode::Tmux => self.tmux.is_available(),
            DisplayMode::Process => {
                let program = self.config.teammate_program();
                program.is_file() || which::which(&program).is_ok()
            }
            DisplayMode::InProcess => true,
        }
    }

    /// 协商实际使用的显示模式，不可用时回退到 in_process
    pub fn negotiate_display_mode(&self, requested: DisplayMode) -> DisplayNegotiation {
        display::negotiate(requested, |mode| self.is_display_mode_available(mode))
    }

    /// 校验参数并生成成员 id
    pub fn prepare(&self, team_id: &str, config: &TeammateConfig) -> Result<PreparedTeammate> {
        let mut config = config.clone();
        config.name = config.name.trim().to_string();
        if config.name.is_empty() {
            return Err(TeamError::validation("teammate name is required"));
        }
        if !self.store.team_exists(team_id) {
            return Err(TeamError::not_found("Team", team_id));
        }

        Ok(PreparedTeammate {
            team_id: team_id.to_string(),
            member_id: generate_id("member"),
            config,
        })
    }

    /// 启动一个 teammate 并登记为 active 成员
    pub async fn spawn_teammate(
        &self,
        team_id: &str,
        config: &TeammateConfig,
        work_dir: &Path,
        display_mode: DisplayMode,
        broker_port: u16,
    ) -> Result<SpawnedTeammate> {
        let prepared = self.prepare(team_id, config)?;
        self.launch(prepared, work_dir, display_mode, broker_port).await
    }

    /// 写入 Store 后按显示模式启动；启动失败时成员被标记为 inactive
    pub async fn launch(
        &self,
        prepared: PreparedTeammate,
        work_dir: &Path,
        display_mode: DisplayMode,
        broker_port: u16,
    ) -> Result<SpawnedTeammate> {
        let PreparedTeammate {
            team_id,
            member_id,
            config,
        } = prepared;

        let requested = config.display_mode.unwrap_or(display_mode);
        let display = self.negotiate_display_mode(requested);
        let mode = display.effective;

        let member = self.store.add_member(
            &team_id,
            MemberDraft {
                id: Some(member_id.clone()),
                name: config.name.clone(),
                role_label: config.role_label.clone(),
                display_mode: Some(mode),
            },
        )?;

        let mut handle = TeammateHandle {
            team_id: team_id.clone(),
            member_id: member_id.clone(),
            name: config.name.clone(),
            display_mode: mode,
            state: SpawnState::Spawning,
            tmux_session: None,
            pid: None,
        };
        self.track(&handle, None);

        let env = launch_env(&team_id, &member_id, broker_port, work_dir);
        let launched = match mode {
            DisplayMode::Tmux => self.launch_tmux(&handle, work_dir, &env),
            DisplayMode::Process => self.launch_process(&member_id, work_dir, &env),
            DisplayMode::InProcess => Ok(launch_in_process(&member_id, broker_port)),
        };

        match launched {
            Ok(runtime) => {
                match &runtime {
                    Runtime::Tmux { session } => handle.tmux_session = Some(session.clone()),
                    Runtime::Process(child) => handle.pid = child.id(),
                    Runtime::InProcess(_) => {}
                }
                handle.state = SpawnState::Active;
                self.track(&handle, Some(runtime));

                info!(
                    team_id = %team_id,
                    member_id = %member_id,
                    name = %handle.name,
                    display_mode = %mode,
                    "Teammate spawned"
                );
                Ok(SpawnedTeammate {
                    member,
                    handle,
                    display,
                })
            }
            Err(e) => {
                error!(
                    team_id = %team_id,
                    member_id = %member_id,
                    error = %e,
                    "Teammate launch failed"
                );
                handle.state = SpawnState::Failed;
                self.track(&handle, None);
                if let Err(mark_err) =
                    self.store
                        .set_member_status(&team_id, &member_id, MemberStatus::Inactive)
                {
                    warn!(
                        member_id = %member_id,
                        error = %mark_err,
                        "Failed to mark unlaunched member inactive"
                    );
                }
                Err(match e {
                    TeamError::ProcessSpawn { reason, .. } => TeamError::ProcessSpawn {
                        member: config.name,
                        reason,
                    },
                    other => TeamError::ProcessSpawn {
                        member: config.name,
                        reason: other.to_string(),
                    },
                })
            }
        }
    }

    /// 逐个独立 spawn，单个失败不影响其他 teammate
    ///
    /// 每个成员 id 在启动前登记到 broker 名册，启动失败时移除。
    pub async fn spawn_batch(
        &self,
        team_id: &str,
        configs: &[TeammateConfig],
        work_dir: &Path,
        display_mode: DisplayMode,
        broker: &MessageBroker,
    ) -> Vec<SpawnOutcome> {
        let mut outcomes = Vec::with_capacity(configs.len());
        for config in configs {
            let result = self
                .spawn_with_broker(team_id, config, work_dir, display_mode, broker)
                .await;
            if let Err(e) = &result {
                warn!(team_id = %team_id, name = %config.name, error = %e, "Teammate spawn failed");
            }
            outcomes.push(SpawnOutcome {
                name: config.name.clone(),
                result,
            });
        }
        outcomes
    }

    async fn spawn_with_broker(
        &self,
        team_id: &str,
        config: &TeammateConfig,
        work_dir: &Path,
        display_mode: DisplayMode,
        broker: &MessageBroker,
    ) -> Result<SpawnedTeammate> {
        let port = broker.port().ok_or_else(|| {
            TeamError::Broker(format!("Broker for team '{}' is not running", team_id))
        })?;
        let prepared = self.prepare(team_id, config)?;
        let member_id = prepared.member_id.clone();

        broker.add_member(&member_id);
        let result = self.launch(prepared, work_dir, display_mode, port).await;
        if result.is_err() {
            broker.remove_member(&member_id);
        }
        result
    }

    /// 终止 teammate 的执行上下文并标记成员为 inactive
    pub async fn shutdown_teammate(&self, team_id: &str, member_id: &str) -> Result<TeamMember> {
        let existing = self.store.get_member(team_id, member_id)?;
        if existing.role == MemberRole::Lead {
            return Err(TeamError::validation(
                "the team lead has no spawned context; shut down the team instead",
            ));
        }

        self.terminate(member_id).await;
        let member = self
            .store
            .set_member_status(team_id, member_id, MemberStatus::Inactive)?;

        info!(team_id = %team_id, member_id = %member_id, "Teammate shut down");
        Ok(member)
    }

    /// 终止 team 下所有已跟踪的执行上下文，返回被终止的成员 id
    pub async fn shutdown_team_members(&self, team_id: &str) -> Result<Vec<String>> {
        let member_ids: Vec<String> = self
            .handles(team_id)
            .into_iter()
            .filter(|h| h.state == SpawnState::Active || h.state == SpawnState::Spawning)
            .map(|h| h.member_id)
            .collect();

        for member_id in &member_ids {
            self.terminate(member_id).await;
            self.mark_inactive(team_id, member_id)?;
        }

        info!(team_id = %team_id, count = member_ids.len(), "Team members shut down");
        Ok(member_ids)
    }

    /// 检查 team 下 active 的执行上下文是否仍在运行
    ///
    /// 已退出的（进程结束、tmux session 消失、in-process 任务完成）标记为 `Terminated`，
    /// 成员置为 inactive。返回本次发现退出的成员 id。
    pub fn refresh(&self, team_id: &str) -> Vec<String> {
        let exited: Vec<String> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            let exited: Vec<String> = entries
                .values_mut()
                .filter(|e| e.handle.team_id == team_id && e.handle.state == SpawnState::Active)
                .filter_map(|entry| {
                    let alive = match entry.runtime.as_mut() {
                        Some(Runtime::Tmux { session }) => self.tmux.session_exists(session),
                        Some(Runtime::Process(child)) => matches!(child.try_wait(), Ok(None)),
                        Some(Runtime::InProcess(task)) => !task.is_finished(),
                        None => false,
                    };
                    if alive {
                        return None;
                    }
                    entry.handle.state = SpawnState::Terminated;
                    entry.runtime = None;
                    Some(entry.handle.member_id.clone())
                })
                .collect();
            exited
        };

        for member_id in &exited {
            info!(team_id = %team_id, member_id = %member_id, "Teammate context exited");
            if let Err(e) = self.mark_inactive(team_id, member_id) {
                warn!(
                    team_id = %team_id,
                    member_id = %member_id,
                    error = %e,
                    "Failed to mark exited teammate inactive"
                );
            }
        }
        exited
    }

    /// 列出 team 的所有句柄（按成员 id 排序），先刷新运行状态
    pub fn handles(&self, team_id: &str) -> Vec<TeammateHandle> {
        self.refresh(team_id);
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut handles: Vec<TeammateHandle> = entries
            .values()
            .filter(|e| e.handle.team_id == team_id)
            .map(|e| e.handle.clone())
            .collect();
        handles.sort_by(|a, b| a.member_id.cmp(&b.member_id));
        handles
    }

    pub fn handle(&self, member_id: &str) -> Option<TeammateHandle> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.get(member_id).map(|e| e.handle.clone())
    }

    /// 丢弃 team 的句柄记录（team 删除后调用）
    pub fn forget_team(&self, team_id: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, e| e.handle.team_id != team_id);
    }

    /// 成员置为 inactive，成员或 team 已不存在时忽略
    fn mark_inactive(&self, team_id: &str, member_id: &str) -> Result<()> {
        match self
            .store
            .set_member_status(team_id, member_id, MemberStatus::Inactive)
        {
            Ok(_) | Err(TeamError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn track(&self, handle: &TeammateHandle, runtime: Option<Runtime>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            handle.member_id.clone(),
            Entry {
                handle: handle.clone(),
                runtime,
            },
        );
    }

    async fn terminate(&self, member_id: &str) {
        let runtime = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            match entries.get_mut(member_id) {
                Some(entry) => {
                    if entry.handle.state != SpawnState::Failed {
                        entry.handle.state = SpawnState::Terminated;
                    }
                    entry.runtime.take()
                }
                None => None,
            }
        };

        match runtime {
            Some(Runtime::Tmux { session }) => {
                if self.tmux.session_exists(&session) {
                    if let Err(e) = self.tmux.kill_session(&session) {
                        warn!(session = %session, error = %e, "Failed to kill teammate session");
                    }
                }
            }
            Some(Runtime::Process(mut child)) => {
                if let Err(e) = child.kill().await {
                    debug!(member_id = %member_id, error = %e, "Teammate process already exited");
                }
            }
            Some(Runtime::InProcess(task)) => task.abort(),
            None => debug!(member_id = %member_id, "No running context to terminate"),
        }
    }

    fn launch_tmux(
        &self,
        handle: &TeammateHandle,
        work_dir: &Path,
        env: &[(String, String)],
    ) -> Result<Runtime> {
        let session = session_name(&handle.name, &handle.member_id);
        let command = self.teammate_command_line();
        self.tmux
            .create_session(&session, &work_dir.to_string_lossy(), &command, env)?;
        Ok(Runtime::Tmux { session })
    }

    fn launch_process(
        &self,
        member_id: &str,
        work_dir: &Path,
        env: &[(String, String)],
    ) -> Result<Runtime> {
        let program = self.config.teammate_program();
        let child = tokio::process::Command::new(&program)
            .args(&self.config.teammate_args)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TeamError::ProcessSpawn {
                member: member_id.to_string(),
                reason: format!("failed to start {}: {}", program.display(), e),
            })?;
        Ok(Runtime::Process(child))
    }

    fn teammate_command_line(&self) -> String {
        let program = self.config.teammate_program();
        std::iter::once(program.to_string_lossy().into_owned())
            .chain(self.config.teammate_args.iter().cloned())
            .map(|arg| tmux::shell_quote(&arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// 在 lead 进程内运行自动确认的 teammate 客户端
fn launch_in_process(member_id: &str, broker_port: u16) -> Runtime {
    let member_id = member_id.to_string();
    let task = tokio::spawn(async move {
        let result = match TeammateClient::connect(broker_port, &member_id).await {
            Ok(client) => client.run_auto_ack().await,
            Err(e) => Err(e),
        };
        match result {
            Ok(handled) => debug!(member_id = %member_id, handled, "In-process teammate finished"),
            Err(e) => warn!(member_id = %member_id, error = %e, "In-process teammate stopped"),
        }
    });
    Runtime::InProcess(task)
}

fn launch_env(
    team_id: &str,
    member_id: &str,
    broker_port: u16,
    work_dir: &Path,
) -> Vec<(String, String)> {
    vec![
        (ENV_TEAM_ID.to_string(), team_id.to_string()),
        (ENV_MEMBER_ID.to_string(), member_id.to_string()),
        (ENV_ROLE.to_string(), MemberRole::Teammate.to_string()),
        (ENV_BROKER_PORT.to_string(), broker_port.to_string()),
        (ENV_WORK_DIR.to_string(), work_dir.to_string_lossy().into_owned()),
    ]
}

/// tmux session 名：`teams-{name}-{id 尾部}`，只保留 tmux 安全字符
fn session_name(name: &str, member_id: &str) -> String {
    let clean: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect();
    let suffix: String = member_id
        .rsplit('-')
        .take(2)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("-");
    format!("teams-{}-{}", clean, suffix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_spawner() -> (TeammateSpawner, Arc<TeamStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(TeamStore::new(temp_dir.path().join("teams")));
        let config = TeamsConfig {
            data_dir: temp_dir.path().join("teams"),
            tmux_program: "definitely-not-tmux-xyz".to_string(),
            teammate_program: Some(temp_dir.path().join("missing-teammate-binary")),
            ..Default::default()
        };
        let spawner = TeammateSpawner::new(store.clone(), config);
        (spawner, store, temp_dir)
    }

    #[test]
    fn test_display_availability_check() {
        let (spawner, _store, _temp) = create_test_spawner();
        assert!(!spawner.is_display_mode_available(DisplayMode::Tmux));
        assert!(!spawner.is_display_mode_available(DisplayMode::Process));
        assert!(spawner.is_display_mode_available(DisplayMode::InProcess));
    }

    #[tokio::test]
    async fn test_spawn_falls_back_to_in_process_with_warning() {
        let (spawner, store, temp) = create_test_spawner();
        let team = store.create_team("alpha", "session-1", temp.path()).unwrap();
        let broker = MessageBroker::new(&team.id, Duration::from_millis(200));
        let port = broker.start().await.unwrap();

        let prepared = spawner.prepare(&team.id, &TeammateConfig::new("worker")).unwrap();
        broker.add_member(&prepared.member_id);
        let spawned = spawner
            .launch(prepared, temp.path(), DisplayMode::Tmux, port)
            .await
            .unwrap();

        assert_eq!(spawned.display.requested, DisplayMode::Tmux);
        assert_eq!(spawned.display.effective, DisplayMode::InProcess);
        assert!(spawned.display.warning.is_some());
        assert_eq!(spawned.handle.state, SpawnState::Active);
        assert_eq!(spawned.member.display_mode, DisplayMode::InProcess);
        assert!(store.get_member(&team.id, &spawned.member.id).unwrap().is_active());

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_batch_failures_are_independent() {
        let (spawner, store, temp) = create_test_spawner();
        let team = store.create_team("alpha", "session-1", temp.path()).unwrap();
        let broker = MessageBroker::new(&team.id, Duration::from_millis(200));
        broker.add_member(&team.lead_member_id);
        broker.start().await.unwrap();

        // Given: 中间一个配置没有名字
        let configs = vec![
            TeammateConfig::new("first"),
            TeammateConfig::new("   "),
            TeammateConfig::new("third"),
        ];

        // When
        let outcomes = spawner
            .spawn_batch(&team.id, &configs, temp.path(), DisplayMode::InProcess, &broker)
            .await;

        // Then: 其余两个照常启动并进入 broker 名册
        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(TeamError::Validation(_))));
        assert!(outcomes[2].result.is_ok());

        let team = store.get_team(&team.id).unwrap();
        assert_eq!(team.members.len(), 3);
        assert_eq!(spawner.handles(&team.id).len(), 2);
        assert_eq!(broker.members().len(), 3);

        broker.stop().await;
    }

    #[tokio::test]
    async fn test_spawn_batch_requires_running_broker() {
        let (spawner, store, temp) = create_test_spawner();
        let team = store.create_team("alpha", "session-1", temp.path()).unwrap();
        let broker = MessageBroker::new(&team.id, Duration::from_millis(200));

        let outcomes = spawner
            .spawn_batch(
                &team.id,
                &[TeammateConfig::new("a")],
                temp.path(),
                DisplayMode::InProcess,
                &broker,
            )
            .await;
        assert!(matches!(outcomes[0].result, Err(TeamError::Broker(_))));
        assert_eq!(store.get_team(&team.id).unwrap().members.len(), 1);
    }

    #[tokio::test]
    async fn test_spawn_unknown_team() {
        let (spawner, _store, temp) = create_test_spawner();
        let result = spawner
            .spawn_teammate(
                "nope",
                &TeammateConfig::new("x"),
                temp.path(),
                DisplayMode::InProcess,
                1,
            )
            .await;
        assert!(matches!(result, Err(TeamError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_shutdown_teammate_marks_inactive() {
        let (spawner, store, temp) = create_test_spawner();
        let team = store.create_team("alpha", "session-1", temp.path()).unwrap();
        let spawned = spawner
            .spawn_teammate(
                &team.id,
                &TeammateConfig::new("worker"),
                temp.path(),
                DisplayMode::InProcess,
                1,
            )
            .await
            .unwrap();

        let member = spawner.shutdown_teammate(&team.id, &spawned.member.id).await.unwrap();
        assert_eq!(member.status, MemberStatus::Inactive);
        assert_eq!(
            spawner.handle(&spawned.member.id).unwrap().state,
            SpawnState::Terminated
        );

        let lead = spawner.shutdown_teammate(&team.id, &team.lead_member_id).await;
        assert!(matches!(lead, Err(TeamError::Validation(_))));
    }

    #[tokio::test]
    async fn test_shutdown_team_members() {
        let (spawner, store, temp) = create_test_spawner();
        let team = store.create_team("alpha", "session-1", temp.path()).unwrap();
        let broker = MessageBroker::new(&team.id, Duration::from_millis(200));
        broker.start().await.unwrap();
        let configs = [TeammateConfig::new("a"), TeammateConfig::new("b")];
        let outcomes = spawner
            .spawn_batch(&team.id, &configs, temp.path(), DisplayMode::InProcess, &broker)
            .await;
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        let stopped = spawner.shutdown_team_members(&team.id).await.unwrap();
        assert_eq!(stopped.len(), 2);
        let team = store.get_team(&team.id).unwrap();
        assert_eq!(team.active_members().count(), 1);
        assert!(spawner
            .handles(&team.id)
            .iter()
            .all(|h| h.state == SpawnState::Terminated));

        broker.stop().await;
    }

    /// 轮询 refresh 直到成员被发现已退出
    async fn wait_for_exit(spawner: &TeammateSpawner, team_id: &str, member_id: &str) -> bool {
        for _ in 0..200 {
            if spawner.refresh(team_id).iter().any(|id| id == member_id) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_finished_in_process_teammate_is_terminated() {
        // Given: 连接不到 broker 的 in-process teammate 会立即结束
        let (spawner, store, temp) = create_test_spawner();
        let team = store.create_team("alpha", "session-1", temp.path()).unwrap();
        let spawned = spawner
            .spawn_teammate(
                &team.id,
                &TeammateConfig::new("worker"),
                temp.path(),
                DisplayMode::InProcess,
                1,
            )
            .await
            .unwrap();

        // When
        assert!(wait_for_exit(&spawner, &team.id, &spawned.member.id).await);

        // Then
        assert_eq!(spawner.handle(&spawned.member.id).unwrap().state, SpawnState::Terminated);
        let member = store.get_member(&team.id, &spawned.member.id).unwrap();
        assert_eq!(member.status, MemberStatus::Inactive);
        assert!(spawner.refresh(&team.id).is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_process_teammate_is_terminated() {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(TeamStore::new(temp.path().join("teams")));
        let config = TeamsConfig {
            data_dir: temp.path().join("teams"),
            tmux_program: "definitely-not-tmux-xyz".to_string(),
            teammate_program: Some(PathBuf::from("/bin/sh")),
            teammate_args: vec!["-c".to_string(), "exit 0".to_string()],
            ..Default::default()
        };
        let spawner = TeammateSpawner::new(store.clone(), config);
        let team = store.create_team("alpha", "session-1", temp.path()).unwrap();

        let spawned = spawner
            .spawn_teammate(
                &team.id,
                &TeammateConfig::new("short"),
                temp.path(),
                DisplayMode::Process,
                1,
            )
            .await
            .unwrap();
        assert_eq!(spawned.display.effective, DisplayMode::Process);
        assert!(spawned.handle.pid.is_some());

        assert!(wait_for_exit(&spawner, &team.id, &spawned.member.id).await);
        let handles = spawner.handles(&team.id);
        assert_eq!(handles[0].state, SpawnState::Terminated);
        assert_eq!(store.get_team(&team.id).unwrap().active_members().count(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_launch_failure_is_reported_per_teammate() {
        // Given: teammate 程序存在但不可执行
        let temp = TempDir::new().unwrap();
        let program = temp.path().join("not-executable");
        std::fs::write(&program, "#!/bin/sh\n").unwrap();
        let store = Arc::new(TeamStore::new(temp.path().join("teams")));
        let config = TeamsConfig {
            data_dir: temp.path().join("teams"),
            tmux_program: "definitely-not-tmux-xyz".to_string(),
            teammate_program: Some(program),
            ..Default::default()
        };
        let spawner = TeammateSpawner::new(store.clone(), config);
        let team = store.create_team("alpha", "session-1", temp.path()).unwrap();
        let broker = MessageBroker::new(&team.id, Duration::from_millis(200));
        broker.add_member(&team.lead_member_id);
        broker.start().await.unwrap();

        let configs = vec![
            TeammateConfig {
                display_mode: Some(DisplayMode::Process),
                ..TeammateConfig::new("p1")
            },
            TeammateConfig::new("ok"),
        ];

        // When
        let outcomes = spawner
            .spawn_batch(&team.id, &configs, temp.path(), DisplayMode::InProcess, &broker)
            .await;

        // Then: p1 启动失败不影响 ok
        assert!(matches!(
            &outcomes[0].result,
            Err(TeamError::ProcessSpawn { member, .. }) if member == "p1"
        ));
        let ok = outcomes[1].result.as_ref().unwrap();
        assert_eq!(ok.handle.state, SpawnState::Active);

        let team_now = store.get_team(&team.id).unwrap();
        let status_of = |name: &str| {
            team_now
                .members
                .iter()
                .find(|m| m.name == name)
                .map(|m| m.status)
                .unwrap()
        };
        assert_eq!(status_of("p1"), MemberStatus::Inactive);
        assert_eq!(status_of("ok"), MemberStatus::Active);

        let roster = broker.members();
        assert_eq!(roster.len(), 2);
        assert!(roster.contains(&ok.member.id));

        let failed: Vec<SpawnState> = spawner
            .handles(&team.id)
            .into_iter()
            .filter(|h| h.name == "p1")
            .map(|h| h.state)
            .collect();
        assert_eq!(failed, vec![SpawnState::Failed]);

        broker.stop().await;
    }

    #[test]
    fn test_session_name_is_tmux_safe() {
        let name = session_name("code reviewer", "member-1700000000000-42-7");
        assert_eq!(name, "teams-code-reviewer-42-7");
    }

    #[test]
    fn test_launch_env_contains_connection_parameters() {
        let env = launch_env("t1", "m1", 4242, Path::new("/work"));
        let lookup = |k: &str| env.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());
        assert_eq!(lookup(ENV_TEAM_ID), Some("t1"));
        assert_eq!(lookup(ENV_MEMBER_ID), Some("m1"));
        assert_eq!(lookup(ENV_ROLE), Some("teammate"));
        assert_eq!(lookup(ENV_BROKER_PORT), Some("4242"));
        assert_eq!(lookup(ENV_WORK_DIR), Some("/work"));
    }
}
