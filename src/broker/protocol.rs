//! Broker 线协议 - 每行一个 JSON 帧

use serde::{Deserialize, Serialize};

use crate::error::{Result, TeamError};
use crate::team::model::{MessageType, TeamMessage};

/// teammate → broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// 连接后第一帧，声明成员身份
    Register { member_id: String },
    /// 确认收到消息
    Ack { message_id: String },
    /// 经 broker 转发消息（`to` 可为 `broadcast`）
    Send {
        to: String,
        content: String,
        #[serde(default)]
        message_type: MessageType,
    },
}

/// broker → teammate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Registered { team_id: String, member_id: String },
    Deliver { message: TeamMessage },
    Error { message: String },
}

/// broker 接受的操作名（供状态查询展示）
pub const TOOL_NAMES: [&str; 3] = ["register", "ack", "send"];

/// 编码为一行（含换行符）
pub fn encode<T: Serialize>(frame: &T) -> Result<String> {
    let mut line = serde_json::to_string(frame)
        .map_err(|e| TeamError::Broker(format!("Failed to encode frame: {}", e)))?;
    line.push('\n');
    Ok(line)
}

pub fn decode<T: for<'de> Deserialize<'de>>(line: &str) -> Result<T> {
    serde_json::from_str(line.trim())
        .map_err(|e| TeamError::Broker(format!("Invalid frame: {}", e)))
}
