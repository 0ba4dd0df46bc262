//! Broadcast transport seam.
//!
//! In the browser this is the native broadcast channel; here the trait
//! keeps sync testable and portable. Message loss is tolerated — the
//! protocol reconciles through full sync.

use tokio::sync::broadcast;
use tracing::trace;

use crate::sync::messages::SyncMessage;

/// Fire-and-forget fan-out to every peer on the channel.
pub trait BroadcastTransport: Send + Sync {
    fn post(&self, message: SyncMessage) -> anyhow::Result<()>;
    fn subscribe(&self) -> broadcast::Receiver<SyncMessage>;
}

/// Process-local transport over a tokio broadcast channel. Every
/// subscriber (including the sender's own listener) sees every message;
/// senders filter their own tab id on receipt.
#[derive(Clone)]
pub struct InMemoryBroadcast {
    tx: broadcast::Sender<SyncMessage>,
}

impl Default for InMemoryBroadcast {
    fn default() -> Self {
        Self::new(256)
    }
}

impl InMemoryBroadcast {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl BroadcastTransport for InMemoryBroadcast {
    fn post(&self, message: SyncMessage) -> anyhow::Result<()> {
        trace!(kind = message.body.kind(), from = %message.tab_id, "broadcast");
        // No receivers is not an error: a lone tab simply talks to nobody.
        let _ = self.tx.send(message);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<SyncMessage> {
        self.tx.subscribe()
    }
}
