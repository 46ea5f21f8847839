//! 成员权限 - 固定能力集合
//!
//! 权限在成员创建时按角色分配，之后不再变更。

use serde::{Deserialize, Serialize};

use super::model::MemberRole;

/// 单项能力
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    CreateTask,
    AssignTask,
    ClaimTask,
    CompleteTask,
    DeleteTask,
    MessageAll,
    MessageDirect,
    ShutdownTeam,
    ShutdownMember,
    InviteMembers,
}

impl Capability {
    pub const ALL: [Capability; 10] = [
        Capability::CreateTask,
        Capability::AssignTask,
        Capability::ClaimTask,
        Capability::CompleteTask,
        Capability::DeleteTask,
        Capability::MessageAll,
        Capability::MessageDirect,
        Capability::ShutdownTeam,
        Capability::ShutdownMember,
        Capability::InviteMembers,
    ];

    /// 权限字段名（与持久化字段一致）
    pub fn field_name(&self) -> &'static str {
        match self {
            Capability::CreateTask => "canCreateTask",
            Capability::AssignTask => "canAssignTask",
            Capability::ClaimTask => "canClaimTask",
            Capability::CompleteTask => "canCompleteTask",
            Capability::DeleteTask => "canDeleteTask",
            Capability::MessageAll => "canMessageAll",
            Capability::MessageDirect => "canMessageDirect",
            Capability::ShutdownTeam => "canShutdownTeam",
            Capability::ShutdownMember => "canShutdownMember",
            Capability::InviteMembers => "canInviteMembers",
        }
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.field_name())
    }
}

/// 成员能力集合
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberPermissions {
    pub can_create_task: bool,
    pub can_assign_task: bool,
    pub can_claim_task: bool,
    pub can_complete_task: bool,
    pub can_delete_task: bool,
    pub can_message_all: bool,
    pub can_message_direct: bool,
    pub can_shutdown_team: bool,
    pub can_shutdown_member: bool,
    pub can_invite_members: bool,
}

impl MemberPermissions {
    /// Lead 拥有全部能力
    pub const LEAD: MemberPermissions = MemberPermissions {
        can_create_task: true,
        can_assign_task: true,
        can_claim_task: true,
        can_complete_task: true,
        can_delete_task: true,
        can_message_all: true,
        can_message_direct: true,
        can_shutdown_team: true,
        can_shutdown_member: true,
        can_invite_members: true,
    };

    /// Teammate 只能处理任务和发消息
    pub const TEAMMATE: MemberPermissions = MemberPermissions {
        can_create_task: true,
        can_assign_task: false,
        can_claim_task: true,
        can_complete_task: true,
        can_delete_task: false,
        can_message_all: true,
        can_message_direct: true,
        can_shutdown_team: false,
        can_shutdown_member: false,
        can_invite_members: false,
    };

    pub fn for_role(role: MemberRole) -> Self {
        match role {
            MemberRole::Lead => Self::LEAD,
            MemberRole::Teammate => Self::TEAMMATE,
        }
    }

    pub fn allows(&self, capability: Capability) -> bool {
        match capability {
            Capability::CreateTask => self.can_create_task,
            Capability::AssignTask => self.can_assign_task,
            Capability::ClaimTask => self.can_claim_task,
            Capability::CompleteTask => self.can_complete_task,
            Capability::DeleteTask => self.can_delete_task,
            Capability::MessageAll => self.can_message_all,
            Capability::MessageDirect => self.can_message_direct,
            Capability::ShutdownTeam => self.can_shutdown_team,
            Capability::ShutdownMember => self.can_shutdown_member,
            Capability::InviteMembers => self.can_invite_members,
        }
    }

    pub fn granted(&self) -> Vec<Capability> {
        Capability::ALL
            .into_iter()
            .filter(|c| self.allows(*c))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lead_is_superset_of_teammate() {
        for cap in Capability::ALL {
            if MemberPermissions::TEAMMATE.allows(cap) {
                assert!(MemberPermissions::LEAD.allows(cap), "lead lacks {}", cap);
            }
        }
        assert_eq!(MemberPermissions::LEAD.granted().len(), Capability::ALL.len());
    }

    #[test]
    fn test_teammate_restrictions() {
        let perms = MemberPermissions::for_role(MemberRole::Teammate);
        assert!(!perms.allows(Capability::InviteMembers));
        assert!(!perms.allows(Capability::ShutdownMember));
        assert!(!perms.allows(Capability::DeleteTask));
        assert!(perms.allows(Capability::ClaimTask));
    }

    #[test]
    fn test_serialized_field_names_match() {
        let json = serde_json::to_value(MemberPermissions::LEAD).unwrap();
        for cap in Capability::ALL {
            assert_eq!(json[cap.field_name()], true, "missing field {}", cap.field_name());
        }
    }
}
