use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::StatusNotice;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking status notices, one channel per dock.
/// Delivery is best-effort: slow listeners lag and lose old notices.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<StatusNotice>>,
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

    /// Subscribe to notices for a dock. Creates the channel if needed.
    pub fn subscribe(&self, dock_id: Ulid) -> broadcast::Receiver<StatusNotice> {
        let sender = self
            .channels
            .entry(dock_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notice. No-op if nobody is listening.
    pub fn send(&self, dock_id: Ulid, notice: &StatusNotice) {
        if let Some(sender) = self.channels.get(&dock_id) {
            let _ = sender.send(notice.clone());
        }
    }

    /// Drop a dock's channel once its last listener is gone.
    pub fn release(&self, dock_id: &Ulid) {
        self.channels
            .remove_if(dock_id, |_, sender| sender.receiver_count() == 0);
    }
}
