//! Cross-worker counter synchronization
//!
//! Every transport has the same two halves:
//!
//! - an outbound [`SyncTransport::publish`] that returns immediately and
//!   never reports failure (fire-and-forget), and
//! - an inbound [`SyncInbox`] drained by [`spawn_listener`], which applies
//!   peer increments to the worker's [`CounterStore`].
//!
//! Transports: [`LocalBus`] (workers sharing one OS process), [`UdpBus`]
//! (workers in separate processes, peer to peer), [`RelayLink`] (worker end
//! of the supervisor relay) and [`Isolated`] (no synchronization).
pub mod bus;
pub mod event;
pub mod relay;
pub mod udp_bus;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::counter::CounterStore;
pub use bus::LocalBus;
pub use event::{SyncAction, SyncEvent, WorkerId};
pub use relay::RelayLink;
pub use udp_bus::UdpBus;

/// Bound on every in-process sync queue. Events beyond it are dropped.
pub const SYNC_CHANNEL_CAPACITY: usize = 4096;

/// Receiving side of a transport
pub type SyncInbox = mpsc::Receiver<SyncEvent>;

pub fn sync_channel() -> (mpsc::Sender<SyncEvent>, SyncInbox) {
    mpsc::channel(SYNC_CHANNEL_CAPACITY)
}

/// Outbound half of a sync transport
pub trait SyncTransport: Send + Sync {
    /// Hand an event to the transport without waiting for delivery.
    /// If the transport is down the event is dropped.
    fn publish(&self, event: SyncEvent);

    /// Short name for logs
    fn name(&self) -> &'static str;
}

/// Apply one received event to `store`, unless it is our own echo.
/// Returns whether the event was counted.
pub fn apply_event(worker_id: WorkerId, store: &CounterStore, event: &SyncEvent) -> bool {
    if event.origin == worker_id {
        trace!("[Worker<{}>] skipping own echo for '{}'", worker_id, event.id);
        return false;
    }
    match event.action {
        SyncAction::SyncRequest => {
            let count = store.apply_remote(&event.id, event.epoch);
            trace!(
                "[Worker<{}>] applied increment for '{}' from {} -> {}",
                worker_id,
                event.id,
                event.origin,
                count
            );
            true
        }
    }
}

/// Spawn the task that drains `inbox` into `store` for the lifetime of the
/// transport. The task ends when every sender feeding the inbox is gone.
pub fn spawn_listener(
    worker_id: WorkerId,
    store: Arc<CounterStore>,
    mut inbox: SyncInbox,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = inbox.recv().await {
            apply_event(worker_id, &store, &event);
        }
        debug!("[Worker<{}>] sync inbox closed", worker_id);
    })
}

/// A transport that goes nowhere: every worker limits on its own counts.
#[derive(Clone, Debug, Default)]
pub struct Isolated;

impl Isolated {
    /// The inbox is already closed: nothing will ever arrive.
    pub fn connect() -> (Self, SyncInbox) {
        let (_tx, inbox) = sync_channel();
        (Self, inbox)
    }
}

impl SyncTransport for Isolated {
    fn publish(&self, event: SyncEvent) {
        trace!("isolated worker, not publishing '{}'", event.id);
    }

    fn name(&self) -> &'static str {
        "isolated"
    }
}
