//! Process supervisor
//!
//! Keeps a fixed-size pool of workers alive, relays sync traffic between
//! them when running the relay topology, and stops them on shutdown.
//! Workers that exit on their own are replaced in the same slot under a
//! fresh id; workers stopped by the supervisor are not.
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::settings::Settings;
use crate::supervisor_error;
use crate::sync::{SyncEvent, WorkerId, SYNC_CHANNEL_CAPACITY};

pub mod hub;
pub mod spawner;

pub use hub::RelayHub;
pub use spawner::{attach_relay, ProcessSpawner, WorkerSpawner};

/// How long stopped workers get to exit before the supervisor gives up
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bound on the supervisor's event queue. Relay traffic beyond it is
/// dropped; exits and respawns wait for room.
pub const EVENT_CHANNEL_CAPACITY: usize = SYNC_CHANNEL_CAPACITY;

/// Everything the supervisor reacts to arrives on one channel
#[derive(Debug)]
pub enum SupervisorEvent {
    /// A worker published an increment over its relay pipe
    Sync { from: WorkerId, event: SyncEvent },
    /// A worker process is gone
    Exited {
        worker_id: WorkerId,
        code: Option<i32>,
        signal: Option<i32>,
    },
    /// A slot is due for a replacement worker
    Respawn { slot: usize },
}

pub type EventSender = mpsc::Sender<SupervisorEvent>;

/// Supervisor's side of a running worker
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub slot: usize,
    pub pid: Option<u32>,
    /// Relay route into the worker, when it has one
    pub relay: Option<mpsc::Sender<SyncEvent>>,
    pub stop: Option<oneshot::Sender<()>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerExit {
    pub worker_id: WorkerId,
    pub slot: usize,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// Stopped by the supervisor rather than on its own
    pub planned: bool,
}

pub struct Supervisor<S: WorkerSpawner> {
    pool_size: usize,
    respawn_delay: Duration,
    shutdown_grace: Duration,
    spawner: S,
    hub: RelayHub,
    workers: HashMap<WorkerId, WorkerHandle>,
    retiring: HashSet<WorkerId>,
    next_id: u32,
    events_tx: EventSender,
    events_rx: mpsc::Receiver<SupervisorEvent>,
    exit_watchers: Vec<mpsc::UnboundedSender<WorkerExit>>,
}

impl<S: WorkerSpawner> Supervisor<S> {
    pub fn new(pool_size: usize, respawn_delay: Duration, spawner: S) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            pool_size,
            respawn_delay,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            spawner,
            hub: RelayHub::new(),
            workers: HashMap::new(),
            retiring: HashSet::new(),
            next_id: 1,
            events_tx,
            events_rx,
            exit_watchers: Vec::new(),
        }
    }

    pub fn from_settings(settings: &Settings, spawner: S) -> Self {
        Self::new(settings.workers, settings.respawn_delay(), spawner)
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Receive a copy of every worker exit the supervisor handles
    pub fn subscribe_exits(&mut self) -> mpsc::UnboundedReceiver<WorkerExit> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.exit_watchers.push(tx);
        rx
    }

    /// Start the pool and supervise it until `shutdown` resolves, then
    /// stop every worker. Failing to start the initial pool is fatal.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        for slot in 0..self.pool_size {
            if let Err(err) = self.spawn_worker(slot).await {
                self.stop_all().await;
                return Err(err);
            }
        }
        info!(
            "Supervisor (pid {}) running {} workers",
            std::process::id(),
            self.workers.len()
        );

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(event) = self.events_rx.recv() => self.handle_event(event).await,
            }
        }

        info!("Supervisor shutting down {} workers", self.workers.len());
        if self.stop_all().await {
            Ok(())
        } else {
            Err(supervisor_error!(
                "{} workers did not exit within {:?}",
                self.workers.len(),
                self.shutdown_grace
            ))
        }
    }

    async fn handle_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Sync { from, event } => {
                self.hub.fan_out(from, event);
            }
            SupervisorEvent::Exited {
                worker_id,
                code,
                signal,
            } => {
                if let Some(exit) = self.record_exit(worker_id, code, signal) {
                    if !exit.planned {
                        self.schedule_respawn(exit.slot);
                    }
                }
            }
            SupervisorEvent::Respawn { slot } => {
                if let Err(err) = self.spawn_worker(slot).await {
                    error!("Could not replace worker in slot {}: {}", slot, err);
                    self.schedule_respawn(slot);
                }
            }
        }
    }

    async fn spawn_worker(&mut self, slot: usize) -> Result<WorkerId> {
        let worker_id = WorkerId::new(self.next_id);
        self.next_id += 1;
        let handle = self
            .spawner
            .spawn(worker_id, slot, self.events_tx.clone())
            .await?;
        if let Some(relay) = handle.relay.clone() {
            self.hub.register(worker_id, relay);
        }
        debug!("Worker {} assigned to slot {}", worker_id, slot);
        self.workers.insert(worker_id, handle);
        Ok(worker_id)
    }

    fn record_exit(
        &mut self,
        worker_id: WorkerId,
        code: Option<i32>,
        signal: Option<i32>,
    ) -> Option<WorkerExit> {
        let handle = self.workers.remove(&worker_id)?;
        self.hub.remove(worker_id);
        let planned = self.retiring.remove(&worker_id);
        let exit = WorkerExit {
            worker_id,
            slot: handle.slot,
            code,
            signal,
            planned,
        };
        if planned {
            info!("Worker {} stopped", worker_id);
        } else {
            warn!(
                "Worker {} (pid {:?}) died (code {:?}, signal {:?})",
                worker_id, handle.pid, code, signal
            );
        }
        self.exit_watchers.retain(|tx| tx.send(exit.clone()).is_ok());
        Some(exit)
    }

    fn schedule_respawn(&self, slot: usize) {
        let events = self.events_tx.clone();
        let delay = self.respawn_delay;
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = events.send(SupervisorEvent::Respawn { slot }).await;
        });
    }

    /// Stop every worker and wait for their exits. Returns whether all of
    /// them exited within the grace period. Only workers that were still
    /// listening for the stop signal count as planned exits.
    async fn stop_all(&mut self) -> bool {
        for (worker_id, handle) in self.workers.iter_mut() {
            if let Some(stop) = handle.stop.take() {
                if stop.send(()).is_ok() {
                    self.retiring.insert(*worker_id);
                }
            }
        }

        let deadline = tokio::time::Instant::now() + self.shutdown_grace;
        while !self.workers.is_empty() {
            match tokio::time::timeout_at(deadline, self.events_rx.recv()).await {
                Ok(Some(SupervisorEvent::Exited {
                    worker_id,
                    code,
                    signal,
                })) => {
                    self.record_exit(worker_id, code, signal);
                }
                // relay traffic and respawns no longer matter
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => break,
            }
        }
        if !self.workers.is_empty() {
            warn!(
                "Abandoning workers {:?}",
                self.workers.keys().collect::<Vec<_>>()
            );
        }
        self.workers.is_empty()
    }
}
