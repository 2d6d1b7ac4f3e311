use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::time::timeout;

use ratesync::error::Result;
use ratesync::settings::{Settings, SyncTopology};
use ratesync::supervisor::{
    attach_relay, EventSender, Supervisor, SupervisorEvent, WorkerHandle, WorkerSpawner,
};
use ratesync::sync::{Isolated, LocalBus, RelayLink, SyncTransport, UdpBus, WorkerId};
use ratesync::worker::Worker;

const CLIENT: &str = "10.0.0.1";

fn settings(topology: SyncTopology) -> Settings {
    Settings {
        workers: 2,
        topology,
        window_seconds: 0,
        respawn_delay_ms: 0,
        ..Settings::default()
    }
}

async fn eventually<F: Fn() -> bool>(check: F) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// W1 serves two requests, then W2 serves two. The fourth overall is
/// rejected and both workers end up agreeing on the count.
async fn two_workers_share_one_quota(first: &Worker, second: &Worker) {
    assert!(first.controller().admit_id(CLIENT.to_string()).is_accepted());
    eventually(|| second.store().get(CLIENT) == 1).await;
    assert!(first.controller().admit_id(CLIENT.to_string()).is_accepted());
    eventually(|| second.store().get(CLIENT) == 2).await;

    assert!(second.controller().admit_id(CLIENT.to_string()).is_accepted());
    eventually(|| first.store().get(CLIENT) == 3).await;
    let fourth = second.controller().admit_id(CLIENT.to_string());
    assert!(!fourth.is_accepted());
    assert_eq!(fourth.count, 4);

    eventually(|| first.store().get(CLIENT) == 4).await;
    // give stray echoes a chance to arrive before checking nothing doubled
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first.store().get(CLIENT), 4);
    assert_eq!(second.store().get(CLIENT), 4);
}

#[tokio::test]
async fn test_local_bus_workers_share_one_quota() {
    let settings = settings(SyncTopology::Bus);
    let bus = LocalBus::default();

    let mut workers = Vec::new();
    for (slot, id) in [1, 2].into_iter().enumerate() {
        let inbox = bus.attach();
        let worker =
            Worker::new(WorkerId::new(id), slot, &settings, Arc::new(bus.clone())).unwrap();
        worker.start_sync(inbox);
        workers.push(worker);
    }
    assert_eq!(bus.subscriber_count(), 2);

    two_workers_share_one_quota(&workers[0], &workers[1]).await;
}

#[tokio::test]
async fn test_udp_bus_ignores_own_echo() {
    let settings = settings(SyncTopology::Bus);
    let first_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let second_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let slots = vec![
        first_socket.local_addr().unwrap(),
        second_socket.local_addr().unwrap(),
    ];

    let mut workers = Vec::new();
    for (slot, socket) in [first_socket, second_socket].into_iter().enumerate() {
        let (bus, inbox) = UdpBus::from_socket(socket, slots.clone()).unwrap();
        assert_eq!(bus.name(), "udp-bus");
        let worker = Worker::new(
            WorkerId::new(slot as u32 + 1),
            slot,
            &settings,
            Arc::new(bus),
        )
        .unwrap();
        worker.start_sync(inbox);
        workers.push(worker);
    }

    two_workers_share_one_quota(&workers[0], &workers[1]).await;
}

#[tokio::test]
async fn test_isolated_workers_limit_independently() {
    let settings = settings(SyncTopology::Isolated);
    let mut workers = Vec::new();
    for id in 1..=2 {
        let (isolated, inbox) = Isolated::connect();
        let worker = Worker::new(WorkerId::new(id), 0, &settings, Arc::new(isolated)).unwrap();
        worker.start_sync(inbox).await.unwrap();
        workers.push(worker);
    }

    for worker in workers.iter() {
        for _ in 0..3 {
            assert!(worker.controller().admit_id(CLIENT.to_string()).is_accepted());
        }
    }
    for worker in workers.iter() {
        assert!(!worker.controller().admit_id(CLIENT.to_string()).is_accepted());
        assert_eq!(worker.store().get(CLIENT), 4);
    }
}

/// Runs workers as tasks connected to the supervisor by in-memory pipes
#[derive(Clone, Default)]
struct InProcessSpawner {
    workers: Arc<Mutex<Vec<Arc<Worker>>>>,
}

impl InProcessSpawner {
    fn worker(&self, index: usize) -> Option<Arc<Worker>> {
        self.workers.lock().unwrap().get(index).cloned()
    }
}

#[async_trait]
impl WorkerSpawner for InProcessSpawner {
    async fn spawn(
        &self,
        worker_id: WorkerId,
        slot: usize,
        events: EventSender,
    ) -> Result<WorkerHandle> {
        let (worker_end, hub_end) = tokio::io::duplex(64 * 1024);
        let (worker_reader, worker_writer) = tokio::io::split(worker_end);
        let (hub_reader, hub_writer) = tokio::io::split(hub_end);

        let (link, inbox) = RelayLink::new(worker_reader, worker_writer);
        let worker = Worker::new(
            worker_id,
            slot,
            &settings(SyncTopology::Relay),
            Arc::new(link),
        )?;
        worker.start_sync(inbox);
        self.workers.lock().unwrap().push(Arc::new(worker));

        let relay = attach_relay(worker_id, hub_reader, hub_writer, events.clone());
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let _ = stop_rx.await;
            let _ = events
                .send(SupervisorEvent::Exited {
                    worker_id,
                    code: Some(0),
                    signal: None,
                })
                .await;
        });
        Ok(WorkerHandle {
            id: worker_id,
            slot,
            pid: None,
            relay: Some(relay),
            stop: Some(stop_tx),
        })
    }
}

#[tokio::test]
async fn test_relay_workers_share_one_quota() {
    let spawner = InProcessSpawner::default();
    let supervisor = Supervisor::from_settings(&settings(SyncTopology::Relay), spawner.clone());
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let running = tokio::spawn(supervisor.run(async move {
        let _ = shutdown_rx.await;
    }));

    eventually(|| spawner.worker(1).is_some()).await;
    let first = spawner.worker(0).unwrap();
    let second = spawner.worker(1).unwrap();
    assert_eq!(first.id(), WorkerId::new(1));
    assert_eq!(second.id(), WorkerId::new(2));

    two_workers_share_one_quota(&first, &second).await;

    shutdown_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
}
