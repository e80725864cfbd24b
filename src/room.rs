//! Room struct definition
//!
//! A named set of locally connected clients. Membership has its own lock,
//! separate from the registry lock in [`RoomManager`](crate::manager::RoomManager),
//! so traffic in one room never waits on another.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::client::Client;
use crate::types::ClientId;

/// Outcome of removing a client from a room
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Removal {
    /// The client was a member before the call
    pub was_member: bool,
    /// The room has no members left
    pub now_empty: bool,
}

/// Chat room with its local members
#[derive(Debug)]
pub struct Room {
    /// Room name, unique within the registry
    pub name: String,
    members: RwLock<HashMap<ClientId, Arc<Client>>>,
}

impl Room {
    /// Create an empty room
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Add a client, replacing any entry with the same id
    pub async fn insert(&self, client: Arc<Client>) {
        self.members.write().await.insert(client.id.clone(), client);
    }

    /// Remove a client from the room
    pub async fn remove(&self, client_id: &ClientId) -> Removal {
        let mut members = self.members.write().await;
        let was_member = members.remove(client_id).is_some();
        Removal {
            was_member,
            now_empty: members.is_empty(),
        }
    }

    /// Check if a client is in this room
    pub async fn contains(&self, client_id: &ClientId) -> bool {
        self.members.read().await.contains_key(client_id)
    }

    /// Get the number of members in the room
    pub async fn member_count(&self) -> usize {
        self.members.read().await.len()
    }

    /// Snapshot of the current members
    pub async fn members(&self) -> Vec<Arc<Client>> {
        self.members.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::recording_client;

    #[tokio::test]
    async fn test_room_creation() {
        let room = Room::new("general");

        assert_eq!(room.name, "general");
        assert_eq!(room.member_count().await, 0);
        assert!(room.members().await.is_empty());
    }

    #[tokio::test]
    async fn test_room_insert_and_contains() {
        let room = Room::new("general");
        let (alice, _) = recording_client("10.0.0.1:1");
        let (bob, _) = recording_client("10.0.0.2:1");

        room.insert(alice.clone()).await;

        assert!(room.contains(&alice.id).await);
        assert!(!room.contains(&bob.id).await);
        assert_eq!(room.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_rejoin_overwrites_entry() {
        let room = Room::new("general");
        let (alice, _) = recording_client("10.0.0.1:1");

        room.insert(alice.clone()).await;
        room.insert(alice.clone()).await;

        assert_eq!(room.member_count().await, 1);
    }

    #[tokio::test]
    async fn test_room_remove_reports_emptiness() {
        let room = Room::new("general");
        let (alice, _) = recording_client("10.0.0.1:1");
        let (bob, _) = recording_client("10.0.0.2:1");
        room.insert(alice.clone()).await;
        room.insert(bob.clone()).await;

        let removal = room.remove(&alice.id).await;
        assert_eq!(
            removal,
            Removal {
                was_member: true,
                now_empty: false
            }
        );

        let removal = room.remove(&bob.id).await;
        assert!(removal.was_member);
        assert!(removal.now_empty);
    }

    #[tokio::test]
    async fn test_room_remove_non_member() {
        let room = Room::new("general");
        let (alice, _) = recording_client("10.0.0.1:1");

        let removal = room.remove(&alice.id).await;
        assert!(!removal.was_member);
        assert!(removal.now_empty);
    }
}
