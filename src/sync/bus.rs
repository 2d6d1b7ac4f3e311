//! Process-local sync bus
//!
//! Thin wrapper around [`tokio::sync::broadcast`] for workers that live in
//! the same OS process. Each attached worker gets its own [`SyncInbox`]; a
//! published event reaches every attached inbox, the publisher's included,
//! so listeners must filter their own origin.
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::{sync_channel, SyncEvent, SyncInbox, SyncTransport, SYNC_CHANNEL_CAPACITY};

#[derive(Clone, Debug)]
pub struct LocalBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(SYNC_CHANNEL_CAPACITY)
    }
}

impl LocalBus {
    /// `capacity` is the number of events a slow subscriber may fall
    /// behind by; it is at least 1.
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe a worker. Must be called from within a tokio runtime.
    pub fn attach(&self) -> SyncInbox {
        let mut rx = self.tx.subscribe();
        let (inbox_tx, inbox) = sync_channel();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if inbox_tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("sync bus subscriber lagged, dropped {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
        inbox
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl SyncTransport for LocalBus {
    fn publish(&self, event: SyncEvent) {
        if self.tx.send(event).is_err() {
            debug!("sync bus has no subscribers, event dropped");
        }
    }

    fn name(&self) -> &'static str {
        "local-bus"
    }
}
