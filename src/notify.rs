use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::{Event, ResourceKey};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for committed series changes, per room or instructor.
pub struct NotifyHub {
    channels: DashMap<ResourceKey, broadcast::Sender<Event>>,
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

    /// Subscribe to changes on a resource. Creates the channel if needed.
    pub fn subscribe(&self, key: ResourceKey) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(key)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening; a channel whose
    /// last subscriber is gone is dropped here.
    pub fn send(&self, key: ResourceKey, event: &Event) {
        let abandoned = match self.channels.get(&key) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => false,
        };
        if abandoned {
            self.channels.remove_if(&key, |_, sender| sender.receiver_count() == 0);
        }
    }

    /// Number of resources with a live channel.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
