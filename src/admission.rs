//! Admission decisions
//!
//! For every inbound request: work out who sent it, count it locally, tell
//! the other workers, then compare the (possibly stale) aggregate count with
//! the threshold. Nothing here waits on the sync transport.
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName, StatusCode};
use tracing::warn;

use crate::config_error;
use crate::counter::{now_millis, CounterStore};
use crate::error::Result;
use crate::sync::{SyncEvent, SyncTransport, WorkerId};

pub const ACCEPT_BODY: &str = "hello world\n";
pub const REJECT_BODY: &str = "Too many requests!";
pub const DEFAULT_IDENTITY_HEADER: &str = "x-forwarded-for";

/// Where the source identifier of a request comes from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdentifySource {
    /// Identity header first, then the peer address
    #[default]
    HeaderOrPeer,
    /// Identity header only
    Header,
    /// Peer address only
    Peer,
}

impl std::fmt::Display for IdentifySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentifySource::HeaderOrPeer => write!(f, "header-or-peer"),
            IdentifySource::Header => write!(f, "header"),
            IdentifySource::Peer => write!(f, "peer"),
        }
    }
}

impl std::str::FromStr for IdentifySource {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "header-or-peer" => Ok(IdentifySource::HeaderOrPeer),
            "header" => Ok(IdentifySource::Header),
            "peer" => Ok(IdentifySource::Peer),
            _ => Err(format!("Invalid identify-by: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IdentifierPolicy {
    pub source: IdentifySource,
    pub header: HeaderName,
}

impl Default for IdentifierPolicy {
    fn default() -> Self {
        Self {
            source: IdentifySource::HeaderOrPeer,
            header: HeaderName::from_static(DEFAULT_IDENTITY_HEADER),
        }
    }
}

impl IdentifierPolicy {
    pub fn new(source: IdentifySource, header: &str) -> Result<Self> {
        let header = HeaderName::try_from(header)
            .map_err(|e| config_error!("Invalid identity header '{}': {}", header, e))?;
        Ok(Self { source, header })
    }

    /// Source identifier for a request, if one can be found
    pub fn identify(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
        match self.source {
            IdentifySource::HeaderOrPeer => {
                self.from_header(headers).or_else(|| peer_identity(peer))
            }
            IdentifySource::Header => self.from_header(headers),
            IdentifySource::Peer => peer_identity(peer),
        }
    }

    // Forwarding proxies append; the left-most entry is the original client.
    fn from_header(&self, headers: &HeaderMap) -> Option<String> {
        let value = headers.get(&self.header)?.to_str().ok()?;
        let first = value.split(',').next()?.trim();
        if first.is_empty() {
            None
        } else {
            Some(first.to_string())
        }
    }
}

fn peer_identity(peer: Option<SocketAddr>) -> Option<String> {
    peer.map(|addr| addr.ip().to_string())
}

#[derive(Clone, Debug)]
pub struct AdmissionPolicy {
    /// Requests allowed per identifier and window; the next one is rejected
    pub threshold: u64,
    pub identifier: IdentifierPolicy,
    pub reject_status: StatusCode,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            threshold: 3,
            identifier: IdentifierPolicy::default(),
            reject_status: StatusCode::BAD_REQUEST,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// Outcome of one admission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Admission {
    /// `None` when the client could not be identified and was let through
    pub id: Option<String>,
    /// Count seen when deciding
    pub count: u64,
    pub decision: Decision,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        self.decision == Decision::Accept
    }
}

/// Per-worker admission controller. Cheap to clone: the counter store and
/// transport are shared handles owned by the worker.
#[derive(Clone)]
pub struct AdmissionController {
    worker_id: WorkerId,
    store: Arc<CounterStore>,
    transport: Arc<dyn SyncTransport>,
    policy: Arc<AdmissionPolicy>,
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController")
            .field("worker_id", &self.worker_id)
            .field("transport", &self.transport.name())
            .field("threshold", &self.policy.threshold)
            .finish()
    }
}

impl AdmissionController {
    pub fn new(
        worker_id: WorkerId,
        store: Arc<CounterStore>,
        transport: Arc<dyn SyncTransport>,
        policy: AdmissionPolicy,
    ) -> Self {
        Self {
            worker_id,
            store,
            transport,
            policy: Arc::new(policy),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    pub fn store(&self) -> &Arc<CounterStore> {
        &self.store
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    /// Admit a request given its headers and peer address
    pub fn admit(&self, headers: &HeaderMap, peer: Option<SocketAddr>) -> Admission {
        match self.policy.identifier.identify(headers, peer) {
            Some(id) => self.admit_id(id),
            None => {
                warn!(
                    "[Worker<{}>] could not identify client, skipping rate limit",
                    self.worker_id
                );
                Admission {
                    id: None,
                    count: 0,
                    decision: Decision::Accept,
                }
            }
        }
    }

    /// Count, propagate and decide for an already identified client
    pub fn admit_id(&self, id: String) -> Admission {
        let now = now_millis();
        self.store.increment_at(&id, now);
        let epoch = self.store.window().epoch_at(now);
        self.transport
            .publish(SyncEvent::increment(id.clone(), self.worker_id, epoch));

        let count = self.store.get_at(&id, now);
        let decision = if count > self.policy.threshold {
            warn!(
                "[Worker<{}>] IP: {} exceeded the maximum request quantity ({} > {})",
                self.worker_id, id, count, self.policy.threshold
            );
            Decision::Reject
        } else {
            Decision::Accept
        };
        Admission {
            id: Some(id),
            count,
            decision,
        }
    }

    /// HTTP status and fixed body for an admission
    pub fn respond(&self, admission: &Admission) -> (StatusCode, &'static str) {
        match admission.decision {
            Decision::Accept => (StatusCode::OK, ACCEPT_BODY),
            Decision::Reject => (self.policy.reject_status, REJECT_BODY),
        }
    }
}
