use serde::{Deserialize, Serialize};
use std::fmt;

/// Every entity type mirrored in the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityKind {
    Elevator,
    ServiceRecord,
    RepairRecord,
    ChatRoom,
    ChatMessage,
    User,
    SimCard,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Elevator,
        EntityKind::ServiceRecord,
        EntityKind::RepairRecord,
        EntityKind::ChatRoom,
        EntityKind::ChatMessage,
        EntityKind::User,
        EntityKind::SimCard,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Elevator => "elevator",
            EntityKind::ServiceRecord => "service-record",
            EntityKind::RepairRecord => "repair-record",
            EntityKind::ChatRoom => "chat-room",
            EntityKind::ChatMessage => "chat-message",
            EntityKind::User => "user",
            EntityKind::SimCard => "sim-card",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == value)
    }

    /// Local SQLite table holding this kind.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Elevator => "elevators",
            EntityKind::ServiceRecord => "service_records",
            EntityKind::RepairRecord => "repair_records",
            EntityKind::ChatRoom => "chat_rooms",
            EntityKind::ChatMessage => "chat_messages",
            EntityKind::User => "users",
            EntityKind::SimCard => "sim_cards",
        }
    }

    /// Remote collection name.
    pub fn collection(self) -> &'static str {
        match self {
            EntityKind::Elevator => "elevators",
            EntityKind::ServiceRecord => "services",
            EntityKind::RepairRecord => "repairs",
            EntityKind::ChatRoom => "chat-rooms",
            EntityKind::ChatMessage => "chat-messages",
            EntityKind::User => "users",
            EntityKind::SimCard => "sim-cards",
        }
    }

    pub fn from_collection(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.collection() == value)
    }

    /// Owning kind and the payload field that references it.
    pub fn parent(self) -> Option<(EntityKind, &'static str)> {
        match self {
            EntityKind::ServiceRecord | EntityKind::RepairRecord | EntityKind::SimCard => {
                Some((EntityKind::Elevator, "elevator"))
            }
            EntityKind::ChatMessage => Some((EntityKind::ChatRoom, "room")),
            EntityKind::Elevator | EntityKind::ChatRoom | EntityKind::User => None,
        }
    }

    pub fn parent_field(self) -> Option<&'static str> {
        self.parent().map(|(_, field)| field)
    }

    /// Kinds owned by this one; deleted along with it.
    pub fn children(self) -> Vec<EntityKind> {
        Self::ALL
            .into_iter()
            .filter(|kind| kind.parent().map(|(owner, _)| owner) == Some(self))
            .collect()
    }

    /// Reference data only privileged roles may download.
    pub fn is_privileged(self) -> bool {
        matches!(self, EntityKind::User | EntityKind::SimCard)
    }

    /// Key of the pull checkpoint in the sync state table.
    pub fn checkpoint_key(self) -> String {
        format!("lastSync:{}", self.as_str())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_parse_back() {
        for kind in EntityKind::ALL {
            assert_eq!(EntityKind::parse(kind.as_str()), Some(kind));
            assert_eq!(EntityKind::from_collection(kind.collection()), Some(kind));
        }
    }

    #[test]
    fn elevator_owns_services_repairs_and_sim_cards() {
        assert_eq!(
            EntityKind::Elevator.children(),
            vec![
                EntityKind::ServiceRecord,
                EntityKind::RepairRecord,
                EntityKind::SimCard
            ]
        );
        assert_eq!(EntityKind::ChatRoom.children(), vec![EntityKind::ChatMessage]);
        assert!(EntityKind::User.children().is_empty());
    }

    #[test]
    fn checkpoint_keys_are_namespaced() {
        assert_eq!(EntityKind::RepairRecord.checkpoint_key(), "lastSync:repair-record");
    }
}
