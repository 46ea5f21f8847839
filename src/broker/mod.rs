//! Broker 模块 - team 内进程间消息传递
//!
//! - `protocol` - 行分隔 JSON 帧
//! - `server` - lead 侧 broker（投递 / 确认跟踪）
//! - `client` - teammate 侧连接

pub mod client;
pub mod protocol;
pub mod server;

pub use client::TeammateClient;
pub use server::{AckOutcome, MessageBroker};
