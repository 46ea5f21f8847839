//! tmux 管理 - teammate 的独立终端显示面

use std::process::Command;
use tracing::{debug, error, info};

use crate::error::{Result, TeamError};

/// tmux 管理器
#[derive(Debug, Clone)]
pub struct TmuxManager {
    program: String,
}

impl TmuxManager {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// tmux 是否可用（在 PATH 中能找到）
    pub fn is_available(&self) -> bool {
        which::which(&self.program).is_ok()
    }

    /// 创建 detached session 并运行命令，`env` 通过 `-e` 传入 session
    pub fn create_session(
        &self,
        session_name: &str,
        working_dir: &str,
        command: &str,
        env: &[(String, String)],
    ) -> Result<()> {
        debug!(session = %session_name, working_dir = %working_dir, "Creating tmux session");

        let mut cmd = Command::new(&self.program);
        cmd.args(["new-session", "-d", "-s", session_name, "-c", working_dir]);
        for (key, value) in env {
            cmd.arg("-e").arg(format!("{}={}", key, value));
        }
        cmd.arg(command);

        let status = cmd.status().map_err(|e| TeamError::ProcessSpawn {
            member: session_name.to_string(),
            reason: format!("failed to run {}: {}", self.program, e),
        })?;

        if status.success() {
            info!(session = %session_name, "Tmux session created");
            Ok(())
        } else {
            error!(session = %session_name, "Failed to create tmux session");
            Err(TeamError::ProcessSpawn {
                member: session_name.to_string(),
                reason: format!("tmux new-session exited with {}", status),
            })
        }
    }

    /// 检查 session 是否存在
    pub fn session_exists(&self, session_name: &str) -> bool {
        Command::new(&self.program)
            .args(["has-session", "-t", session_name])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// 终止 session
    pub fn kill_session(&self, session_name: &str) -> Result<()> {
        debug!(session = %session_name, "Killing tmux session");

        let status = Command::new(&self.program)
            .args(["kill-session", "-t", session_name])
            .status()
            .map_err(|e| TeamError::Terminate {
                context: session_name.to_string(),
                reason: format!("failed to run {}: {}", self.program, e),
            })?;

        if status.success() {
            info!(session = %session_name, "Tmux session killed");
            Ok(())
        } else {
            Err(TeamError::Terminate {
                context: session_name.to_string(),
                reason: format!("tmux kill-session exited with {}", status),
            })
        }
    }
}

impl Default for TmuxManager {
    fn default() -> Self {
        Self::new("tmux")
    }
}

/// 为 shell 命令行加单引号
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
