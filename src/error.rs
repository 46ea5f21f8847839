//! 错误类型 - Team 编排子系统的错误分类

use std::path::PathBuf;
use thiserror::Error;

/// Team 编排错误
#[derive(Error, Debug)]
pub enum TeamError {
    /// 缺少必填字段或参数不合法
    #[error("Validation error: {0}")]
    Validation(String),

    /// 调用者缺少所需能力
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// team / task / member / message 不存在
    #[error("{kind} '{id}' not found")]
    NotFound { kind: &'static str, id: String },

    /// 状态冲突（重复 claim、依赖未完成等）
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 等待确认超时且没有任何接收者确认
    #[error("Delivery timed out waiting for acknowledgment of message '{0}'")]
    DeliveryTimeout(String),

    /// 单个 teammate 启动失败
    #[error("Failed to spawn teammate '{member}': {reason}")]
    ProcessSpawn { member: String, reason: String },

    /// 终止 teammate 执行上下文失败（如 tmux kill-session）
    #[error("Failed to terminate '{context}': {reason}")]
    Terminate { context: String, reason: String },

    /// Broker 端口绑定失败
    #[error("Failed to start broker for team '{team_id}': {reason}")]
    BrokerStart { team_id: String, reason: String },

    /// Broker 未运行或连接异常
    #[error("Broker error: {0}")]
    Broker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// 持久化记录损坏
    #[error("Corrupted record at {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl TeamError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// 是否为致命错误（磁盘 I/O 或记录损坏），这类错误会穿透 Coordinator
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Corrupt { .. })
    }
}

pub type Result<T> = std::result::Result<T, TeamError>;
