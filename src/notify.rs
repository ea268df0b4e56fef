use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Ms, UserId};

const CHANNEL_CAPACITY: usize = 256;

/// An accepted change to a slot's occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    Booked {
        slot_id: Ulid,
        reservation_id: Ulid,
        user_id: UserId,
        booked_count: u32,
        version: u64,
        at: Ms,
    },
    Cancelled {
        slot_id: Ulid,
        reservation_id: Ulid,
        user_id: UserId,
        booked_count: u32,
        version: u64,
        at: Ms,
    },
}

impl Notification {
    pub fn slot_id(&self) -> Ulid {
        match self {
            Notification::Booked { slot_id, .. } | Notification::Cancelled { slot_id, .. } => {
                *slot_id
            }
        }
    }
}

/// Broadcast hub for per-slot change notifications.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a slot. Creates the channel if needed.
    pub fn subscribe(&self, slot_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(slot_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, notification: Notification) {
        let slot_id = notification.slot_id();
        if let Some(sender) = self.channels.get(&slot_id)
            && sender.send(notification).is_err()
        {
            // Every receiver is gone; drop the channel once the guard is released.
            drop(sender);
            self.channels
                .remove_if(&slot_id, |_, s| s.receiver_count() == 0);
        }
    }

    pub fn subscriber_count(&self, slot_id: &Ulid) -> usize {
        self.channels
            .get(slot_id)
            .map_or(0, |s| s.receiver_count())
    }
}
