//! Chat room registry and broadcaster.
//!
//! Tracks which live subscriptions belong to which chat and fans completed
//! messages out to them. Delivery is fire-and-forget: no acknowledgement,
//! no retry, no backlog. A subscriber that joins after a publish never sees
//! it; reconnecting clients recover state through message history instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::model::MessageView;

/// Per-room broadcast channel capacity. A slow subscriber that falls this
/// far behind starts losing events (it can refetch history).
const ROOM_CHANNEL_CAPACITY: usize = 128;

/// Server events delivered to room subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum RoomEvent {
    /// A message completed ingestion in this room
    NewMessage(MessageView),
}

/// Registry of live chat rooms.
///
/// The one genuinely mutable shared structure in the crate: joined and left
/// concurrently by connection handlers while the pipeline publishes.
#[derive(Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<Uuid, broadcast::Sender<RoomEvent>>>>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join a chat room, returning a live subscription handle.
    ///
    /// Always succeeds; joining the same room repeatedly just hands back
    /// another handle. Dropping the handle leaves the room.
    pub async fn join(&self, chat_id: Uuid) -> RoomSubscription {
        let mut rooms = self.rooms.write().await;
        let sender = rooms
            .entry(chat_id)
            .or_insert_with(|| broadcast::channel(ROOM_CHANNEL_CAPACITY).0);
        RoomSubscription {
            chat_id,
            receiver: sender.subscribe(),
        }
    }

    /// Deliver an event to everyone currently joined to `chat_id`.
    ///
    /// Returns the number of subscriptions the event was handed to. Rooms
    /// with no remaining subscribers are pruned on the way through.
    pub async fn publish(&self, chat_id: Uuid, event: RoomEvent) -> usize {
        let mut rooms = self.rooms.write().await;
        match rooms.get(&chat_id) {
            Some(sender) if sender.receiver_count() > 0 => sender.send(event).unwrap_or(0),
            Some(_) => {
                rooms.remove(&chat_id);
                0
            }
            None => 0,
        }
    }

    /// Number of rooms with a live channel (pruned lazily on publish).
    pub async fn active_rooms(&self) -> usize {
        self.rooms.read().await.len()
    }
}

/// A live subscription to one chat room. Dropping it leaves the room.
pub struct RoomSubscription {
    chat_id: Uuid,
    receiver: broadcast::Receiver<RoomEvent>,
}

impl RoomSubscription {
    pub fn chat_id(&self) -> Uuid {
        self.chat_id
    }

    /// Wait for the next event in this room.
    ///
    /// Returns `None` once the room channel is gone. A subscriber that
    /// lagged past the channel capacity skips ahead to the oldest retained
    /// event rather than erroring out.
    pub async fn recv(&mut self) -> Option<RoomEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "Room {} subscriber lagged, {} events dropped",
                        self.chat_id,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
