//! Relay routing table
//!
//! The supervisor's view of which workers can receive relay traffic. Only
//! the supervisor mutates it, on spawn and on exit.
use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::sync::{SyncEvent, WorkerId};

#[derive(Debug, Default)]
pub struct RelayHub {
    routes: HashMap<WorkerId, mpsc::Sender<SyncEvent>>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, worker_id: WorkerId, tx: mpsc::Sender<SyncEvent>) {
        self.routes.insert(worker_id, tx);
    }

    pub fn remove(&mut self, worker_id: WorkerId) -> bool {
        self.routes.remove(&worker_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn contains(&self, worker_id: WorkerId) -> bool {
        self.routes.contains_key(&worker_id)
    }

    /// Forward an event received from `from` to every other registered
    /// worker. The event is re-attributed to `from`, whatever origin it
    /// claimed. Broken or saturated routes are skipped. Returns how many
    /// workers it was handed to.
    pub fn fan_out(&self, from: WorkerId, event: SyncEvent) -> usize {
        let event = event.with_origin(from);
        let mut delivered = 0;
        for (worker_id, tx) in self.routes.iter() {
            if *worker_id == from {
                continue;
            }
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!("relay route to worker {} is full, skipping", worker_id)
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("relay route to worker {} is closed, skipping", worker_id)
                }
            }
        }
        trace!(
            "relayed '{}' from worker {} to {} workers",
            event.id,
            from,
            delivered
        );
        delivered
    }
}
