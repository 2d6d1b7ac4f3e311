//! Starting worker processes
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{EventSender, SupervisorEvent, WorkerHandle};
use crate::error::Result;
use crate::settings::{Settings, SyncTopology, WORKERS_ENV, WORKER_ID_ENV, WORKER_SLOT_ENV};
use crate::supervisor_error;
use crate::sync::relay::{read_events, write_events};
use crate::sync::{sync_channel, SyncEvent, WorkerId};

/// Starts one worker and reports back through `events`: relay traffic as
/// [`SupervisorEvent::Sync`], termination as exactly one
/// [`SupervisorEvent::Exited`].
#[async_trait]
pub trait WorkerSpawner: Send + Sync {
    async fn spawn(
        &self,
        worker_id: WorkerId,
        slot: usize,
        events: EventSender,
    ) -> Result<WorkerHandle>;
}

/// Connect the supervisor end of a relay pipe pair. Lines read from
/// `reader` are reported as coming from `worker_id`; events sent on the
/// returned channel are written to `writer`.
pub fn attach_relay<R, W>(
    worker_id: WorkerId,
    reader: R,
    writer: W,
    events: EventSender,
) -> mpsc::Sender<SyncEvent>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = sync_channel();
    tokio::spawn(write_events(writer, rx));
    tokio::spawn(async move {
        read_events(reader, |event| {
            match events.try_send(SupervisorEvent::Sync {
                from: worker_id,
                event,
            }) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    debug!("supervisor queue full, dropping relay event from {}", worker_id);
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        })
        .await;
    });
    tx
}

/// Re-executes a program (normally the running binary) as a worker
#[derive(Clone, Debug)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
    topology: SyncTopology,
    pool_size: usize,
}

impl ProcessSpawner {
    pub fn new(
        program: PathBuf,
        args: Vec<OsString>,
        topology: SyncTopology,
        pool_size: usize,
    ) -> Self {
        Self {
            program,
            args,
            topology,
            pool_size,
        }
    }

    /// Workers run this very binary with this process's arguments
    pub fn current_exe(settings: &Settings) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| supervisor_error!("Cannot locate own executable: {}", e))?;
        Ok(Self::new(
            program,
            std::env::args_os().skip(1).collect(),
            settings.topology,
            settings.workers,
        ))
    }
}

#[async_trait]
impl WorkerSpawner for ProcessSpawner {
    async fn spawn(
        &self,
        worker_id: WorkerId,
        slot: usize,
        events: EventSender,
    ) -> Result<WorkerHandle> {
        let relay = self.topology == SyncTopology::Relay;
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env(WORKER_ID_ENV, worker_id.to_string())
            .env(WORKER_SLOT_ENV, slot.to_string())
            .env(WORKERS_ENV, self.pool_size.to_string())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if relay {
            cmd.stdin(Stdio::piped()).stdout(Stdio::piped());
        } else {
            cmd.stdin(Stdio::null()).stdout(Stdio::inherit());
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| supervisor_error!("Failed to spawn worker {}: {}", worker_id, e))?;
        let pid = child.id();

        let relay_tx = if relay {
            let stdin = child
                .stdin
                .take()
                .ok_or_else(|| supervisor_error!("Worker {} has no stdin pipe", worker_id))?;
            let stdout = child
                .stdout
                .take()
                .ok_or_else(|| supervisor_error!("Worker {} has no stdout pipe", worker_id))?;
            Some(attach_relay(worker_id, stdout, stdin, events.clone()))
        } else {
            None
        };

        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(watch_child(worker_id, child, stop_rx, events));

        info!(
            "Worker {} (pid {:?}) started in slot {}",
            worker_id, pid, slot
        );
        Ok(WorkerHandle {
            id: worker_id,
            slot,
            pid,
            relay: relay_tx,
            stop: Some(stop_tx),
        })
    }
}

/// Wait for the child to exit on its own or be stopped, then report it
async fn watch_child(
    worker_id: WorkerId,
    mut child: Child,
    stop_rx: oneshot::Receiver<()>,
    events: EventSender,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop_rx => {
            if let Err(err) = child.start_kill() {
                warn!("Failed to kill worker {}: {}", worker_id, err);
            }
            child.wait().await
        }
    };
    let (code, signal) = match status {
        Ok(status) => (status.code(), exit_signal(&status)),
        Err(err) => {
            warn!("Lost track of worker {}: {}", worker_id, err);
            (None, None)
        }
    };
    let _ = events
        .send(SupervisorEvent::Exited {
            worker_id,
            code,
            signal,
        })
        .await;
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    #[tokio::test]
    async fn test_crashing_process_is_reported() {
        let spawner = ProcessSpawner::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), "exit 3".into()],
            SyncTopology::Isolated,
            1,
        );
        let (events, mut rx) = mpsc::channel(16);
        let handle = spawner.spawn(WorkerId::new(1), 0, events).await.unwrap();
        assert!(handle.relay.is_none());

        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Some(SupervisorEvent::Exited {
                worker_id, code, ..
            }) => {
                assert_eq!(worker_id, WorkerId::new(1));
                assert_eq!(code, Some(3));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stopped_process_is_killed() {
        let spawner = ProcessSpawner::new(
            PathBuf::from("/bin/sh"),
            vec!["-c".into(), "sleep 30".into()],
            SyncTopology::Isolated,
            1,
        );
        let (events, mut rx) = mpsc::channel(16);
        let mut handle = spawner.spawn(WorkerId::new(2), 0, events).await.unwrap();
        handle.stop.take().unwrap().send(()).unwrap();

        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Some(SupervisorEvent::Exited { code, signal, .. }) => {
                assert_eq!(code, None);
                assert_eq!(signal, Some(9));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_relay_pipes_carry_events_both_ways() {
        // `cat` echoes whatever the supervisor writes back as worker output
        let spawner = ProcessSpawner::new(
            PathBuf::from("/bin/cat"),
            Vec::new(),
            SyncTopology::Relay,
            1,
        );
        let (events, mut rx) = mpsc::channel(16);
        let handle = spawner.spawn(WorkerId::new(4), 0, events).await.unwrap();
        let relay = handle.relay.clone().unwrap();

        relay
            .send(SyncEvent::increment("10.0.0.1", WorkerId::new(9), 0))
            .await
            .unwrap();
        match timeout(Duration::from_secs(5), rx.recv()).await.unwrap() {
            Some(SupervisorEvent::Sync { from, event }) => {
                assert_eq!(from, WorkerId::new(4));
                assert_eq!(event.id, "10.0.0.1");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
