//! Worker runtime
//!
//! One worker process: its counter store, its end of the sync transport,
//! the listener applying peer increments, window expiry, and the HTTP
//! server. The store is created here and handed to everything else by
//! `Arc`; there is no process-wide state.
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::admission::AdmissionController;
use crate::api;
use crate::counter::CounterStore;
use crate::error::Result;
use crate::settings::{Settings, SyncTopology};
use crate::sync::{
    spawn_listener, Isolated, RelayLink, SyncInbox, SyncTransport, UdpBus, WorkerId,
};
use crate::transport_error;

pub struct Worker {
    id: WorkerId,
    slot: usize,
    store: Arc<CounterStore>,
    controller: AdmissionController,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("slot", &self.slot)
            .field("store", &self.store)
            .finish()
    }
}

impl Worker {
    pub fn new(
        id: WorkerId,
        slot: usize,
        settings: &Settings,
        transport: Arc<dyn SyncTransport>,
    ) -> Result<Self> {
        let store = Arc::new(CounterStore::new(settings.window()));
        let controller =
            AdmissionController::new(id, store.clone(), transport, settings.admission_policy()?);
        Ok(Self {
            id,
            slot,
            store,
            controller,
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    pub fn controller(&self) -> &AdmissionController {
        &self.controller
    }

    pub fn router(&self) -> Router {
        api::api(self.controller.clone())
    }

    /// Apply peer increments from `inbox` until the transport closes
    pub fn start_sync(&self, inbox: SyncInbox) -> JoinHandle<()> {
        spawn_listener(self.id, self.store.clone(), inbox)
    }

    /// Periodically drop counts from finished windows. Nothing to do when
    /// counts never reset.
    pub fn start_expiry(&self) -> Option<JoinHandle<()>> {
        let window = self.store.window();
        if window.is_unbounded() {
            return None;
        }
        let store = self.store.clone();
        let id = self.id;
        Some(tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_millis(window.length_ms()));
            // first tick fires immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                let expired = store.expire_stale();
                debug!(
                    "[Worker<{}>] expired {} identifiers, {} tracked",
                    id,
                    expired,
                    store.len()
                );
            }
        }))
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        axum::serve(
            listener,
            self.router().into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;
        Ok(())
    }
}

/// Connect this worker's end of the configured sync topology
pub async fn connect_transport(
    settings: &Settings,
    slot: usize,
) -> Result<(Arc<dyn SyncTransport>, SyncInbox)> {
    match settings.topology {
        SyncTopology::Relay => {
            let (link, inbox) = RelayLink::stdio();
            Ok((Arc::new(link), inbox))
        }
        SyncTopology::Bus => {
            let (bus, inbox) =
                UdpBus::bind(settings.bus_slot_addr(slot)?, settings.bus_slots()?).await?;
            Ok((Arc::new(bus), inbox))
        }
        SyncTopology::Isolated => {
            let (isolated, inbox) = Isolated::connect();
            Ok((Arc::new(isolated), inbox))
        }
    }
}

/// Listener that every worker can bind at the same time; the kernel
/// spreads incoming connections across them.
pub fn bind_shared(addr: SocketAddr) -> Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket
        .bind(addr)
        .map_err(|e| transport_error!("HTTP bind on {} failed: {}", addr, e))?;
    Ok(socket.listen(1024)?)
}

// Interrupts reach the whole process group. The supervisor decides when
// workers stop, so a worker only notes them.
fn ignore_interrupts(id: WorkerId) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            debug!("[Worker<{}>] interrupt ignored, waiting for supervisor", id);
        }
    });
}

/// Entry point of a worker process
pub async fn run(settings: Settings, id: WorkerId, slot: usize) -> Result<()> {
    let (transport, inbox) = connect_transport(&settings, slot).await?;
    let sync_name = transport.name();
    let worker = Worker::new(id, slot, &settings, transport)?;
    let listener = bind_shared(settings.listen_socket_addr())?;
    ignore_interrupts(id);

    info!(
        "[Worker<{}>] slot {} serving on {} (pid {}, sync: {})",
        id,
        slot,
        settings.listen_socket_addr(),
        std::process::id(),
        sync_name
    );

    let sync = worker.start_sync(inbox);
    let _expiry = worker.start_expiry();

    match settings.topology {
        // relay pipes close when the supervisor is gone
        SyncTopology::Relay => {
            tokio::select! {
                served = worker.serve(listener) => served,
                _ = sync => {
                    info!("[Worker<{}>] supervisor channel closed, exiting", id);
                    Ok(())
                }
            }
        }
        SyncTopology::Bus | SyncTopology::Isolated => worker.serve(listener).await,
    }
}
