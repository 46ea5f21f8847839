//! 配置模块 - 数据目录、确认超时、teammate 启动方式
//!
//! 加载顺序：默认值 → `~/.config/agent-teams/config.json` → 环境变量

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::team::model::{DisplayMode, MemberRole};

/// 全局配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TeamsConfig {
    /// Team 数据根目录
    pub data_dir: PathBuf,
    /// sendMessageWithAck 的等待上限（毫秒）
    pub ack_timeout_ms: u64,
    /// 未指定时使用的 teammate 显示模式
    pub default_display_mode: DisplayMode,
    /// tmux 可执行文件
    pub tmux_program: String,
    /// teammate 进程的可执行文件（为空时使用当前可执行文件）
    pub teammate_program: Option<PathBuf>,
    pub teammate_args: Vec<String>,
}

impl Default for TeamsConfig {
    fn default() -> Self {
        Self {
            data_dir: config_dir().join("teams"),
            ack_timeout_ms: 5_000,
            default_display_mode: DisplayMode::Tmux,
            tmux_program: "tmux".to_string(),
            teammate_program: None,
            teammate_args: vec!["teammate".to_string()],
        }
    }
}

impl TeamsConfig {
    /// 加载配置（文件 + 环境变量覆盖）
    pub fn load() -> Self {
        let mut config = Self::load_from_file(&config_dir().join("config.json"));
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config
    }

    /// 从指定文件加载，文件不存在或格式错误时回退到默认值
    pub fn load_from_file(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Malformed config file, using defaults"
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to read config file, using defaults"
                );
                Self::default()
            }
        }
    }

    fn apply_env_overrides<F>(&mut self, get: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = get("AGENT_TEAMS_DATA_DIR").filter(|d| !d.is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(ms) = get("AGENT_TEAMS_ACK_TIMEOUT_MS") {
            match ms.parse() {
                Ok(ms) => self.ack_timeout_ms = ms,
                Err(_) => warn!(value = %ms, "Ignoring invalid AGENT_TEAMS_ACK_TIMEOUT_MS"),
            }
        }
        if let Some(mode) = get("AGENT_TEAMS_DISPLAY_MODE") {
            match mode.parse() {
                Ok(mode) => self.default_display_mode = mode,
                Err(_) => warn!(value = %mode, "Ignoring invalid AGENT_TEAMS_DISPLAY_MODE"),
            }
        }
        if let Some(tmux) = get("AGENT_TEAMS_TMUX").filter(|t| !t.is_empty()) {
            self.tmux_program = tmux;
        }
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// teammate 进程的可执行文件路径
    pub fn teammate_program(&self) -> PathBuf {
        self.teammate_program
            .clone()
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from("teams"))
    }
}

fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("agent-teams")
}

/// 调用者身份（来自调用进程的环境，视为不可信输入）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub member_id: Option<String>,
    pub role: MemberRole,
    pub team_id: Option<String>,
    pub session_id: Option<String>,
}

impl CallerContext {
    /// Team lead 身份（用于创建 team 的会话）
    pub fn lead(session_id: impl Into<String>) -> Self {
        Self {
            member_id: None,
            role: MemberRole::Lead,
            team_id: None,
            session_id: Some(session_id.into()),
        }
    }

    /// 以指定成员身份调用
    pub fn member(
        team_id: impl Into<String>,
        member_id: impl Into<String>,
        role: MemberRole,
    ) -> Self {
        Self {
            member_id: Some(member_id.into()),
            role,
            team_id: Some(team_id.into()),
            session_id: None,
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(get: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| get(key).filter(|v| !v.is_empty());
        let role = non_empty(ENV_ROLE)
            .and_then(|r| r.parse().ok())
            .unwrap_or(MemberRole::Lead);

        Self {
            member_id: non_empty(ENV_MEMBER_ID),
            role,
            team_id: non_empty(ENV_TEAM_ID),
            session_id: non_empty(ENV_SESSION_ID),
        }
    }
}

pub const ENV_TEAM_ID: &str = "AGENT_TEAMS_TEAM_ID";
pub const ENV_MEMBER_ID: &str = "AGENT_TEAMS_MEMBER_ID";
pub const ENV_ROLE: &str = "AGENT_TEAMS_ROLE";
pub const ENV_SESSION_ID: &str = "AGENT_TEAMS_SESSION_ID";
pub const ENV_BROKER_PORT: &str = "AGENT_TEAMS_BROKER_PORT";
pub const ENV_WORK_DIR: &str = "AGENT_TEAMS_WORK_DIR";

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let temp = tempdir().unwrap();
        let config = TeamsConfig::load_from_file(&temp.path().join("nope.json"));
        assert_eq!(config.ack_timeout_ms, 5_000);
        assert_eq!(config.default_display_mode, DisplayMode::Tmux);
        assert_eq!(config.teammate_args, vec!["teammate"]);
    }

    #[test]
    fn test_load_partial_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"ack_timeout_ms": 250, "default_display_mode": "in_process"}"#,
        )
        .unwrap();

        let config = TeamsConfig::load_from_file(&path);
        assert_eq!(config.ack_timeout(), Duration::from_millis(250));
        assert_eq!(config.default_display_mode, DisplayMode::InProcess);
        assert_eq!(config.tmux_program, "tmux");
    }

    #[test]
    fn test_malformed_file_falls_back() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        let config = TeamsConfig::load_from_file(&path);
        assert_eq!(config.ack_timeout_ms, 5_000);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("AGENT_TEAMS_DATA_DIR", "/tmp/teams-data"),
            ("AGENT_TEAMS_ACK_TIMEOUT_MS", "not-a-number"),
            ("AGENT_TEAMS_DISPLAY_MODE", "process"),
        ]
        .into_iter()
        .collect();

        let mut config = TeamsConfig::default();
        config.apply_env_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.data_dir, PathBuf::from("/tmp/teams-data"));
        assert_eq!(config.ack_timeout_ms, 5_000);
        assert_eq!(config.default_display_mode, DisplayMode::Process);
    }

    #[test]
    fn test_caller_context_from_lookup() {
        let env: HashMap<&str, &str> = [
            (ENV_TEAM_ID, "team-1"),
            (ENV_MEMBER_ID, "member-2"),
            (ENV_ROLE, "teammate"),
        ]
        .into_iter()
        .collect();

        let ctx = CallerContext::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(ctx.team_id.as_deref(), Some("team-1"));
        assert_eq!(ctx.member_id.as_deref(), Some("member-2"));
        assert_eq!(ctx.role, MemberRole::Teammate);
        assert!(ctx.session_id.is_none());
    }
}
