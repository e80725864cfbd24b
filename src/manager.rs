//! Room manager
//!
//! The authoritative in-process view of room membership, and the bridge
//! between local membership and the relay. Each room with at least one
//! local member has exactly one relay subscription; everything published
//! on the room's topic (by this instance or any other) is fanned out to
//! the local members from that subscription.
//!
//! # Locking
//! Two levels: the registry lock (`rooms`) guards which rooms exist, each
//! [`Room`] guards its own membership. Acquisition order is always
//! registry, then room. A room lock is never held while calling the relay.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::client::Client;
use crate::error::RelayError;
use crate::message::{joined_notice, left_notice, RelayPayload};
use crate::relay::{PayloadHandler, PubSub};
use crate::room::Room;
use crate::types::{room_topic, ClientId};

/// Result of one local fanout
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Process-local room registry and relay bridge
pub struct RoomManager {
    pubsub: PubSub,
    /// All rooms with local members: name -> Room
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    /// Handed to subscription callbacks so they never keep the manager alive
    me: Weak<RoomManager>,
}

impl RoomManager {
    /// Create a manager publishing and subscribing through `pubsub`
    pub fn new(pubsub: PubSub) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            pubsub,
            rooms: RwLock::new(HashMap::new()),
            me: me.clone(),
        })
    }

    /// Add a client to a room, creating the room on first join
    ///
    /// Room creation and its relay subscription happen under the registry
    /// lock, so concurrent first joins start exactly one subscription.
    pub async fn join_room(&self, client: Arc<Client>, room_name: &str) {
        {
            let mut rooms = self.rooms.write().await;
            let room = match rooms.get(room_name) {
                Some(room) => room.clone(),
                None => {
                    let room = Arc::new(Room::new(room_name));
                    rooms.insert(room_name.to_string(), room.clone());
                    self.pubsub
                        .subscribe(&room_topic(room_name), self.fanout_handler(room_name))
                        .await;
                    debug!("Room {} created", room_name);
                    room
                }
            };
            room.insert(client.clone()).await;
        }

        info!("Client {} joined room {}", client.id, room_name);
        self.publish_notice(room_name, &joined_notice(&client.id)).await;
    }

    /// Remove a client from one room
    ///
    /// Deletes the room and stops its subscription if it becomes empty.
    /// The "left" notice goes out whenever the room exists.
    pub async fn leave_room(&self, client_id: &ClientId, room_name: &str) {
        {
            let mut rooms = self.rooms.write().await;
            let Some(room) = rooms.get(room_name).cloned() else {
                info!("Room {} does not exist", room_name);
                return;
            };

            let removal = room.remove(client_id).await;
            if !removal.was_member {
                debug!("Client {} was not in room {}", client_id, room_name);
            }
            if removal.now_empty {
                self.delete_room(&mut rooms, room_name).await;
            }
        }

        info!("Client {} left room {}", client_id, room_name);
        self.publish_notice(room_name, &left_notice(client_id)).await;
    }

    /// Remove a client from every room it belongs to
    ///
    /// Called once per connection on disconnect. Safe when the client
    /// joined nothing.
    pub async fn remove_client(&self, client_id: &ClientId) {
        let left = {
            let mut rooms = self.rooms.write().await;
            let mut left = Vec::new();
            let mut emptied = Vec::new();

            for (name, room) in rooms.iter() {
                let removal = room.remove(client_id).await;
                if removal.was_member {
                    debug!("Client {} removed from room {}", client_id, name);
                    left.push(name.clone());
                    if removal.now_empty {
                        emptied.push(name.clone());
                    }
                }
            }

            for name in &emptied {
                self.delete_room(&mut rooms, name).await;
            }
            left
        };

        for room_name in &left {
            self.publish_notice(room_name, &left_notice(client_id)).await;
        }
        info!("Client {} removed from {} room(s)", client_id, left.len());
    }

    /// Publish content to every instance's members of a room
    ///
    /// Local members receive it through this instance's own subscription.
    pub async fn broadcast_message(&self, room_name: &str, content: &str) -> Result<(), RelayError> {
        let payload = RelayPayload::new(room_name, content).encode();
        if let Err(e) = self.pubsub.publish(&room_topic(room_name), &payload).await {
            error!("Failed to broadcast message to room {}: {}", room_name, e);
            return Err(e);
        }
        Ok(())
    }

    /// Write content to every local member of a room
    ///
    /// Each member's frame goes onto that member's own outbound queue, so
    /// a slow or stalled member never holds up the others or the caller.
    /// A full or closed queue is logged and counted as a failure.
    pub async fn broadcast_to_local_room(&self, room_name: &str, content: &str) -> FanoutReport {
        let room = self.rooms.read().await.get(room_name).cloned();
        let Some(room) = room else {
            debug!("Room {} does not exist for local broadcast", room_name);
            return FanoutReport::default();
        };

        let mut report = FanoutReport::default();
        for client in room.members().await {
            match client.send_text(content) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Failed to send message to client {}: {}", client.id, e);
                    report.failed += 1;
                }
            }
        }
        debug!(
            "Room {}: delivered {}, failed {}",
            room_name, report.delivered, report.failed
        );
        report
    }

    /// Handle one raw relay payload received on `room_name`'s topic
    ///
    /// Malformed payloads, and payloads naming another room, are dropped.
    pub async fn deliver_relay_payload(&self, room_name: &str, raw: &str) -> Option<FanoutReport> {
        let Some(payload) = RelayPayload::decode(raw) else {
            warn!("Invalid broadcast for room {}: {}", room_name, raw);
            return None;
        };
        if payload.room != room_name {
            warn!(
                "Broadcast for room {} arrived on topic of room {}",
                payload.room, room_name
            );
            return None;
        }
        Some(self.broadcast_to_local_room(room_name, &payload.content).await)
    }

    /// Names of all rooms with local members, sorted
    pub async fn room_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of local members, or None if the room does not exist
    pub async fn member_count(&self, room_name: &str) -> Option<usize> {
        let room = self.rooms.read().await.get(room_name).cloned()?;
        Some(room.member_count().await)
    }

    /// Check if a client is a member of a room
    pub async fn contains_client(&self, room_name: &str, client_id: &ClientId) -> bool {
        let room = self.rooms.read().await.get(room_name).cloned();
        match room {
            Some(room) => room.contains(client_id).await,
            None => false,
        }
    }

    /// Hold the registry write lock, stalling every membership change
    #[cfg(test)]
    pub(crate) async fn lock_registry(
        &self,
    ) -> tokio::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Room>>> {
        self.rooms.write().await
    }

    /// The subscription adapter used by this manager
    pub fn pubsub(&self) -> &PubSub {
        &self.pubsub
    }

    /// Helper: drop a room from the registry and stop its subscription
    ///
    /// Caller holds the registry write lock, so no delivery can find the
    /// room after this returns.
    async fn delete_room(&self, rooms: &mut HashMap<String, Arc<Room>>, room_name: &str) {
        rooms.remove(room_name);
        self.pubsub.unsubscribe(&room_topic(room_name)).await;
        debug!("Room {} deleted (empty)", room_name);
    }

    /// Helper: publish a presence notice, logging failure
    async fn publish_notice(&self, room_name: &str, notice: &str) {
        let payload = RelayPayload::new(room_name, notice).encode();
        if let Err(e) = self.pubsub.publish(&room_topic(room_name), &payload).await {
            warn!("Failed to publish presence notice to room {}: {}", room_name, e);
        }
    }

    /// Helper: subscription callback fanning a room's payloads out locally
    fn fanout_handler(&self, room_name: &str) -> PayloadHandler {
        let manager = self.me.clone();
        let room_name = room_name.to_string();
        Arc::new(move |raw: String| {
            let manager = manager.clone();
            let room_name = room_name.clone();
            async move {
                if let Some(manager) = manager.upgrade() {
                    manager.deliver_relay_payload(&room_name, &raw).await;
                }
            }
            .boxed()
        })
    }
}

impl std::fmt::Debug for RoomManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::relay::{BackoffConfig, LocalRelay, Relay, SubscriptionState};
    use crate::testutil::{eventually, failing_client, recording_client, stalled_client, FlakyRelay};
    use tokio::task::JoinSet;

    fn manager_on(relay: Arc<dyn Relay>) -> Arc<RoomManager> {
        RoomManager::new(PubSub::new(
            relay,
            BackoffConfig {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(40),
            },
        ))
    }

    /// Relay whose publishes fail, so presence notices never reach members
    fn silent_relay() -> Arc<dyn Relay> {
        Arc::new(FlakyRelay::failing_publishes())
    }

    async fn wait_subscribed(manager: &RoomManager, room: &str) {
        let mut state = manager.pubsub().watch_state(&room_topic(room)).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(2),
            state.wait_for(|s| *s == SubscriptionState::Subscribed),
        )
        .await
        .unwrap()
        .unwrap();
    }

    async fn next_frame(frames: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> String {
        tokio::time::timeout(Duration::from_secs(2), frames.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_join_creates_room_and_subscription() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let (alice, _) = recording_client("10.0.0.1:1");

        manager.join_room(alice.clone(), "general").await;

        assert_eq!(manager.room_names().await, vec!["general".to_string()]);
        assert_eq!(manager.member_count("general").await, Some(1));
        assert!(manager.contains_client("general", &alice.id).await);
        assert_eq!(
            manager.pubsub().active_topics().await,
            vec!["room:general".to_string()]
        );
    }

    #[tokio::test]
    async fn test_room_exists_iff_members() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let (alice, _) = recording_client("10.0.0.1:1");
        let (bob, _) = recording_client("10.0.0.2:1");

        manager.join_room(alice.clone(), "r").await;
        manager.join_room(bob.clone(), "r").await;
        assert_eq!(manager.member_count("r").await, Some(2));

        manager.leave_room(&alice.id, "r").await;
        assert_eq!(manager.member_count("r").await, Some(1));

        manager.leave_room(&bob.id, "r").await;
        assert_eq!(manager.member_count("r").await, None);
        assert!(manager.room_names().await.is_empty());
        assert!(manager.pubsub().active_topics().await.is_empty());

        manager.join_room(alice.clone(), "r").await;
        assert_eq!(manager.member_count("r").await, Some(1));
    }

    #[tokio::test]
    async fn test_leave_by_non_member_still_announced() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let (alice, mut frames) = recording_client("10.0.0.1:1");
        let (stranger, _) = recording_client("10.0.0.7:1");
        manager.join_room(alice, "r").await;
        assert_eq!(next_frame(&mut frames).await, "10.0.0.1:1 joined the room");

        manager.leave_room(&stranger.id, "r").await;

        assert_eq!(next_frame(&mut frames).await, "10.0.0.7:1 left the room");
        assert_eq!(manager.member_count("r").await, Some(1));
    }

    #[tokio::test]
    async fn test_leave_missing_room_is_noop() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let (alice, _) = recording_client("10.0.0.1:1");

        manager.leave_room(&alice.id, "nowhere").await;

        assert!(manager.room_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_overwrites_membership() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let (alice, _) = recording_client("10.0.0.1:1");

        manager.join_room(alice.clone(), "r").await;
        manager.join_room(alice.clone(), "r").await;

        assert_eq!(manager.member_count("r").await, Some(1));
        assert_eq!(manager.pubsub().active_topics().await.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_joins_start_one_subscription() {
        let relay = Arc::new(FlakyRelay::failing_opens(0));
        let manager = manager_on(relay.clone());

        let mut joins = JoinSet::new();
        for i in 0..16 {
            let manager = manager.clone();
            joins.spawn(async move {
                let (client, _) = recording_client(&format!("10.0.0.{}:1", i));
                manager.join_room(client, "busy").await;
            });
        }
        while let Some(result) = joins.join_next().await {
            result.unwrap();
        }

        wait_subscribed(&manager, "busy").await;
        assert_eq!(manager.member_count("busy").await, Some(16));
        assert_eq!(relay.open_attempts(), 1);
        assert_eq!(
            manager.pubsub().active_topics().await,
            vec!["room:busy".to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_client_from_all_rooms() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let (alice, _) = recording_client("10.0.0.1:1");
        let (bob, _) = recording_client("10.0.0.2:1");

        for room in ["a", "b", "c"] {
            manager.join_room(alice.clone(), room).await;
        }
        manager.join_room(bob.clone(), "b").await;

        manager.remove_client(&alice.id).await;

        for room in ["a", "b", "c"] {
            assert!(!manager.contains_client(room, &alice.id).await);
        }
        assert_eq!(manager.room_names().await, vec!["b".to_string()]);
        assert_eq!(
            manager.pubsub().active_topics().await,
            vec!["room:b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_remove_client_without_rooms() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let (alice, _) = recording_client("10.0.0.1:1");
        let (bob, _) = recording_client("10.0.0.2:1");
        manager.join_room(bob.clone(), "r").await;

        manager.remove_client(&alice.id).await;

        assert_eq!(manager.member_count("r").await, Some(1));
    }

    #[tokio::test]
    async fn test_local_fanout_delivers_once_per_member() {
        let manager = manager_on(silent_relay());
        let (alice, mut alice_frames) = recording_client("10.0.0.1:1");
        let (bob, mut bob_frames) = recording_client("10.0.0.2:1");
        manager.join_room(alice, "r").await;
        manager.join_room(bob, "r").await;

        let report = manager.broadcast_to_local_room("r", "hello").await;

        assert_eq!(report, FanoutReport { delivered: 2, failed: 0 });
        assert_eq!(alice_frames.recv().await.as_deref(), Some("hello"));
        assert_eq!(bob_frames.recv().await.as_deref(), Some("hello"));
        assert!(alice_frames.try_recv().is_err());
        assert!(bob_frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_local_fanout_isolates_write_failures() {
        let manager = manager_on(silent_relay());
        let (alice, mut alice_frames) = recording_client("10.0.0.1:1");
        let broken = failing_client("10.0.0.9:1");
        let (bob, mut bob_frames) = recording_client("10.0.0.2:1");
        manager.join_room(alice, "r").await;
        manager.join_room(broken.clone(), "r").await;
        manager.join_room(bob, "r").await;

        manager.broadcast_to_local_room("r", "still here").await;
        assert_eq!(alice_frames.recv().await.as_deref(), Some("still here"));
        assert_eq!(bob_frames.recv().await.as_deref(), Some("still here"));

        // The broken member's writer has given up; later fanouts skip it
        let broken = &broken;
        eventually(move || async move { broken.is_closed() }).await;
        let report = manager.broadcast_to_local_room("r", "again").await;
        assert_eq!(report, FanoutReport { delivered: 2, failed: 1 });
        assert_eq!(alice_frames.recv().await.as_deref(), Some("again"));
        assert_eq!(bob_frames.recv().await.as_deref(), Some("again"));
    }

    #[tokio::test]
    async fn test_stalled_member_does_not_block_room() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let (alice, mut alice_frames) = recording_client("10.0.0.1:1");
        let stuck = stalled_client("10.0.0.9:1");
        manager.join_room(alice, "r").await;
        wait_subscribed(&manager, "r").await;
        assert_eq!(next_frame(&mut alice_frames).await, "10.0.0.1:1 joined the room");
        manager.join_room(stuck.clone(), "r").await;
        assert_eq!(next_frame(&mut alice_frames).await, "10.0.0.9:1 joined the room");

        for content in ["m1", "m2", "m3"] {
            manager.broadcast_message("r", content).await.unwrap();
        }
        assert_eq!(next_frame(&mut alice_frames).await, "m1");
        assert_eq!(next_frame(&mut alice_frames).await, "m2");
        assert_eq!(next_frame(&mut alice_frames).await, "m3");

        tokio::time::timeout(Duration::from_secs(1), manager.remove_client(&stuck.id))
            .await
            .unwrap();
        assert!(!manager.contains_client("r", &stuck.id).await);
        assert_eq!(next_frame(&mut alice_frames).await, "10.0.0.9:1 left the room");
    }

    #[tokio::test]
    async fn test_local_fanout_to_missing_room() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let report = manager.broadcast_to_local_room("ghost", "x").await;
        assert_eq!(report, FanoutReport::default());
    }

    #[tokio::test]
    async fn test_relay_payload_routing() {
        let manager = manager_on(silent_relay());
        let (alice, mut frames) = recording_client("10.0.0.1:1");
        manager.join_room(alice, "general").await;

        let report = manager
            .deliver_relay_payload("general", "general|hello world")
            .await;
        assert_eq!(report, Some(FanoutReport { delivered: 1, failed: 0 }));
        assert_eq!(frames.recv().await.as_deref(), Some("hello world"));

        assert!(manager.deliver_relay_payload("general", "malformed").await.is_none());
        assert!(manager.deliver_relay_payload("general", "other|x").await.is_none());
        assert!(frames.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_members_through_relay() {
        let manager = manager_on(Arc::new(LocalRelay::default()));
        let (alice, mut alice_frames) = recording_client("10.0.0.1:1");
        manager.join_room(alice.clone(), "r1").await;
        wait_subscribed(&manager, "r1").await;
        assert_eq!(next_frame(&mut alice_frames).await, "10.0.0.1:1 joined the room");

        manager.broadcast_message("r1", "hi").await.unwrap();

        assert_eq!(next_frame(&mut alice_frames).await, "hi");
    }

    #[tokio::test]
    async fn test_presence_notices_cross_instances() {
        let relay: Arc<dyn Relay> = Arc::new(LocalRelay::default());
        let east = manager_on(relay.clone());
        let west = manager_on(relay.clone());
        let (watcher, mut frames) = recording_client("10.0.0.1:1");
        let (newcomer, _) = recording_client("10.0.0.2:1");

        west.join_room(watcher, "lobby").await;
        wait_subscribed(&west, "lobby").await;
        assert_eq!(next_frame(&mut frames).await, "10.0.0.1:1 joined the room");

        east.join_room(newcomer.clone(), "lobby").await;
        assert_eq!(next_frame(&mut frames).await, "10.0.0.2:1 joined the room");

        east.leave_room(&newcomer.id, "lobby").await;
        assert_eq!(next_frame(&mut frames).await, "10.0.0.2:1 left the room");
        assert!(east.room_names().await.is_empty());
    }

    #[tokio::test]
    async fn test_deleted_room_receives_nothing() {
        let relay = Arc::new(LocalRelay::default());
        let manager = manager_on(relay.clone());
        let (alice, mut frames) = recording_client("10.0.0.1:1");
        manager.join_room(alice.clone(), "r").await;
        wait_subscribed(&manager, "r").await;
        // Drain own join notice
        assert_eq!(next_frame(&mut frames).await, "10.0.0.1:1 joined the room");

        manager.leave_room(&alice.id, "r").await;
        let relay_ref = &relay;
        eventually(move || async move { relay_ref.subscriber_count("room:r").await == 0 }).await;

        manager.broadcast_message("r", "anyone?").await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), frames.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reports_publish_failure() {
        let manager = manager_on(Arc::new(FlakyRelay::failing_publishes()));
        let result = manager.broadcast_message("r", "x").await;
        assert!(matches!(result, Err(RelayError::Transport(_))));
    }
}
