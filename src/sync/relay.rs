//! Relay link: the worker end of the hub-and-spoke topology
//!
//! A worker talks to exactly one peer, its supervisor, over a pair of byte
//! streams (the child's stdin and stdout in production). Events travel as
//! newline-delimited JSON in both directions. The supervisor end reuses
//! [`read_events`] and [`write_events`] from this module.
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::{sync_channel, SyncEvent, SyncInbox, SyncTransport};

/// Worker → supervisor half of the relay ("send to hub")
#[derive(Clone, Debug)]
pub struct RelayLink {
    outbound: mpsc::Sender<SyncEvent>,
}

impl RelayLink {
    /// Start the pipe tasks. Events arriving on `reader` land in the
    /// returned inbox; published events are written to `writer`.
    pub fn new<R, W>(reader: R, writer: W) -> (Self, SyncInbox)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = sync_channel();
        let (inbox_tx, inbox) = sync_channel();

        tokio::spawn(write_events(writer, outbound_rx));
        tokio::spawn(async move {
            let received = read_events(reader, |event| forward(&inbox_tx, event)).await;
            debug!("relay channel closed after {} events", received);
        });

        (Self { outbound }, inbox)
    }

    /// Relay over this process's stdin/stdout
    pub fn stdio() -> (Self, SyncInbox) {
        Self::new(tokio::io::stdin(), tokio::io::stdout())
    }
}

impl SyncTransport for RelayLink {
    fn publish(&self, event: SyncEvent) {
        if let Err(err) = self.outbound.try_send(event) {
            debug!("relay publish dropped: {}", err);
        }
    }

    fn name(&self) -> &'static str {
        "relay"
    }
}

/// Non-blocking hand-off into a sync queue. A full queue drops the event,
/// a closed one tells the caller to stop reading.
pub fn forward(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            debug!("sync queue full, dropping event for '{}'", event.id);
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Decode JSON lines from `reader` until EOF, an I/O error, or `deliver`
/// returns false. Malformed lines are skipped. Returns the number of events
/// decoded.
pub async fn read_events<R, F>(reader: R, mut deliver: F) -> usize
where
    R: AsyncRead + Unpin,
    F: FnMut(SyncEvent) -> bool,
{
    let mut lines = BufReader::new(reader).lines();
    let mut received = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match SyncEvent::from_line(&line) {
                    Ok(event) => {
                        received += 1;
                        if !deliver(event) {
                            break;
                        }
                    }
                    Err(err) => warn!("skipping malformed relay message: {}", err),
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!("relay read failed: {}", err);
                break;
            }
        }
    }
    received
}

/// Encode every event from `rx` as a JSON line on `writer` until the queue
/// closes or the stream breaks.
pub async fn write_events<W>(mut writer: W, mut rx: mpsc::Receiver<SyncEvent>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = rx.recv().await {
        let line = match event.to_line() {
            Ok(line) => line,
            Err(err) => {
                warn!("could not encode sync event: {}", err);
                continue;
            }
        };
        if let Err(err) = writer.write_all(line.as_bytes()).await {
            debug!("relay write failed, closing: {}", err);
            break;
        }
        if let Err(err) = writer.flush().await {
            debug!("relay flush failed, closing: {}", err);
            break;
        }
    }
}
