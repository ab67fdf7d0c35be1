//! Status events and the broadcast bus that carries them.
//!
//! Subscribers may lag or disappear without affecting a running turn:
//! sends never block and a send with no receivers is not an error.

pub mod events;

use tokio::sync::broadcast;
use tracing::trace;

pub use events::TurnStatusEvent;

const BROADCAST_CAP: usize = 256;

/// Cloneable sender side of the status channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<TurnStatusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAP);
        Self { tx }
    }

    /// Subscribe to status events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TurnStatusEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: TurnStatusEvent) {
        if self.tx.send(event).is_err() {
            trace!("status event dropped: no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
