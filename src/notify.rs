use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-teacher broadcast of committed schedule events, for dashboard
/// refresh. Advisory only — validation never consults it.
pub struct ChangeFeed {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a teacher's schedule changes. Creates the channel if
    /// needed.
    pub fn subscribe(&self, teacher_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(teacher_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish a committed event. No-op if nobody is listening.
    pub fn publish(&self, teacher_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&teacher_id) {
            let _ = sender.send(event.clone());
        }
    }

    /// Drop a teacher's channel (e.g. after the teacher is removed).
    pub fn remove(&self, teacher_id: &Ulid) {
        self.channels.remove(teacher_id);
    }
}
