//! UDP sync bus
//!
//! Many-to-many bus for workers running as separate processes. Each worker
//! binds one datagram socket (one per pool slot) and sends every event to
//! every slot address, its own included. Nothing sits in the data path, so
//! each listener filters its own echo by origin.
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::relay::forward;
use super::{sync_channel, SyncEvent, SyncInbox, SyncTransport};
use crate::error::Result;
use crate::transport_error;

/// Sync events are tiny; anything bigger than this is not ours.
const MAX_DATAGRAM: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct UdpBus {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    peers: Arc<Vec<SocketAddr>>,
}

impl UdpBus {
    /// Bind `local` and start receiving. `peers` is the whole pool's slot
    /// table; it may include `local`.
    pub async fn bind(local: SocketAddr, peers: Vec<SocketAddr>) -> Result<(Self, SyncInbox)> {
        let socket = UdpSocket::bind(local)
            .await
            .map_err(|e| transport_error!("Bus socket bind on {} failed: {}", local, e))?;
        Self::from_socket(socket, peers)
    }

    /// Use an already bound socket
    pub fn from_socket(socket: UdpSocket, peers: Vec<SocketAddr>) -> Result<(Self, SyncInbox)> {
        let local_addr = socket
            .local_addr()
            .map_err(|e| transport_error!("Bus socket has no local address: {}", e))?;
        let socket = Arc::new(socket);
        info!(
            "Sync bus listening on {} with {} slots",
            local_addr,
            peers.len()
        );

        let (inbox_tx, inbox) = sync_channel();
        let receiver = socket.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                match receiver.recv_from(&mut buf).await {
                    Ok((len, from)) => match SyncEvent::from_bytes(&buf[..len]) {
                        Ok(event) => {
                            if !forward(&inbox_tx, event) {
                                break;
                            }
                        }
                        Err(err) => warn!("dropping malformed datagram from {}: {}", from, err),
                    },
                    Err(err) => {
                        // peers that went away surface here on some platforms
                        debug!("bus receive error: {}", err);
                    }
                }
            }
        });

        Ok((
            Self {
                socket,
                local_addr,
                peers: Arc::new(peers),
            },
            inbox,
        ))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &[SocketAddr] {
        &self.peers
    }
}

impl SyncTransport for UdpBus {
    fn publish(&self, event: SyncEvent) {
        let data = match event.to_bytes() {
            Ok(data) => data,
            Err(err) => {
                warn!("could not encode sync event: {}", err);
                return;
            }
        };
        for peer in self.peers.iter() {
            if let Err(err) = self.socket.try_send_to(&data, *peer) {
                debug!("bus send to {} dropped: {}", peer, err);
            }
        }
    }

    fn name(&self) -> &'static str {
        "udp-bus"
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::sync::WorkerId;

    async fn loopback_socket() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_events_reach_every_slot_including_the_sender() {
        let first = loopback_socket().await;
        let second = loopback_socket().await;
        let slots = vec![first.local_addr().unwrap(), second.local_addr().unwrap()];

        let (bus_one, mut inbox_one) = UdpBus::from_socket(first, slots.clone()).unwrap();
        let (_bus_two, mut inbox_two) = UdpBus::from_socket(second, slots.clone()).unwrap();
        assert_eq!(bus_one.peers(), slots.as_slice());
        assert_eq!(bus_one.local_addr(), slots[0]);

        let event = SyncEvent::increment("10.0.0.1", WorkerId::new(1), 0);
        bus_one.publish(event.clone());

        let wait = Duration::from_secs(2);
        assert_eq!(timeout(wait, inbox_two.recv()).await.unwrap().unwrap(), event);
        // loops back to the publisher as well
        assert_eq!(timeout(wait, inbox_one.recv()).await.unwrap().unwrap(), event);
    }

    #[tokio::test]
    async fn test_malformed_datagrams_are_skipped() {
        let socket = loopback_socket().await;
        let addr = socket.local_addr().unwrap();
        let (_bus, mut inbox) = UdpBus::from_socket(socket, vec![addr]).unwrap();

        let sender = loopback_socket().await;
        sender.send_to(b"{not json", addr).await.unwrap();
        let event = SyncEvent::increment("x", WorkerId::new(9), 0);
        sender
            .send_to(&event.to_bytes().unwrap(), addr)
            .await
            .unwrap();

        let got = timeout(Duration::from_secs(2), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, event);
    }
}
