//! Agent Teams - lead 与 teammate 进程的团队编排
//!
//! - `team` - team / 成员 / 任务 / 消息的持久化
//! - `broker` - team 内的实时消息投递与确认
//! - `spawner` - teammate 执行上下文的生命周期
//! - `coordinator` - 权限检查后的统一命令入口

pub mod broker;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod spawner;
pub mod team;

pub use broker::{AckOutcome, MessageBroker, TeammateClient};
pub use config::{CallerContext, TeamsConfig};
pub use coordinator::{ExecuteResult, TaskAction, TaskFilter, TeamCommand, TeamCoordinator};
pub use error::{Result, TeamError};
pub use spawner::{
    DisplayNegotiation, SpawnState, SpawnedTeammate, TeammateConfig, TeammateHandle,
    TeammateSpawner,
};
pub use team::{
    Capability, DeliveryInfo, DeliveryStatus, DisplayMode, MemberPermissions, MemberRole,
    MemberStatus, MessageType, TaskPriority, TaskStatus, Team, TeamMember, TeamMessage, TeamStore,
    TeamTask, BROADCAST,
};
