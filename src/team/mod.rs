//! Team 模块 - team / 成员 / 任务 / 消息的持久化状态
//!
//! ## 子模块
//!
//! - `model` - 数据模型
//! - `permissions` - 成员能力集（LEAD / TEAMMATE）
//! - `store` - 文件存储（team 级锁 + 原子写入）
//!
//! ## 数据存储
//!
//! 每个 team 一个目录：
//! - `team.json` - Team 记录（成员列表 + 任务列表）
//! - `tasks/{task-id}.json` - 单个任务
//! - `inboxes/{member-id}/{message-id}.json` - 成员 inbox 消息

pub mod model;
pub mod permissions;
pub mod store;

pub use model::{
    DeliveryInfo, DeliveryStatus, DisplayMode, MemberDraft, MemberRole, MemberStatus, MessageType,
    TaskDraft, TaskPriority, TaskStatus, Team, TeamMember, TeamMessage, TeamState, TeamTask,
    BROADCAST,
};
pub use permissions::{Capability, MemberPermissions};
pub use store::{MemberStatusSummary, TeamStatusReport, TeamStore};
