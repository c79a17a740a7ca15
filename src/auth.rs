//! Moderation authorization: enforced above the coordinator, but the
//! coordinator still consumes the resulting role decision. JWT
//! verification itself stays an external collaborator — this module only
//! covers the owner/role check, split apart from token verification the
//! way an upstream auth middleware splits `AuthUser` resolution from the
//! authorization decision that follows it.

use crate::coordinator::ModeratorRole;

/// Resolved actor identity for a single request.
#[derive(Debug, Clone)]
pub struct ActorContext {
    pub actor_id: String,
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Admin,
    Moderator,
    Member,
}

/// Decide the moderator role the coordinator should apply for a given
/// actor against a given event: admin/moderator roles bypass the owner
/// check, otherwise the actor must equal the event's owner.
pub fn authorize_moderation(actor: &ActorContext, event_owner_id: &str) -> ModeratorRole {
    match actor.role {
        Role::Admin => ModeratorRole::Admin,
        Role::Moderator => ModeratorRole::Moderator,
        Role::Member if actor.actor_id == event_owner_id => ModeratorRole::Owner,
        Role::Member => ModeratorRole::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admin_bypasses_owner_check() {
        let actor = ActorContext {
            actor_id: "u1".into(),
            role: Role::Admin,
        };
        assert_eq!(authorize_moderation(&actor, "someone-else"), ModeratorRole::Admin);
    }

    #[test]
    fn member_must_match_owner() {
        let owner = ActorContext {
            actor_id: "owner-1".into(),
            role: Role::Member,
        };
        assert_eq!(authorize_moderation(&owner, "owner-1"), ModeratorRole::Owner);

        let stranger = ActorContext {
            actor_id: "stranger".into(),
            role: Role::Member,
        };
        assert_eq!(authorize_moderation(&stranger, "owner-1"), ModeratorRole::Other);
    }
}
