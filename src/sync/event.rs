//! Sync event wire format
//!
//! The same JSON object travels over every transport: one per line on the
//! relay pipes, one per datagram on the UDP bus.
//!
//! ```json
//! {"action":"SYNC_REQUEST","id":"10.0.0.1","origin":2,"epoch":29000001}
//! ```
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identity of one worker process, assigned by the supervisor at spawn time.
/// `WorkerId(0)` is never handed out; it stands for "origin unknown".
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, PartialOrd, Ord, Eq, Hash,
)]
#[serde(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    pub const UNKNOWN: WorkerId = WorkerId(0);

    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u32 {
        self.0
    }

    pub fn is_unknown(&self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for WorkerId {
    fn from(id: u32) -> Self {
        WorkerId::new(id)
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kinds of sync event. There is only one.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncAction {
    /// One more request was observed for an identifier
    SyncRequest,
}

/// "One more request observed for `id`", broadcast to peers
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct SyncEvent {
    pub action: SyncAction,
    pub id: String,
    #[serde(default)]
    pub origin: WorkerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<u64>,
}

impl SyncEvent {
    pub fn increment(id: impl Into<String>, origin: WorkerId, epoch: u64) -> Self {
        Self {
            action: SyncAction::SyncRequest,
            id: id.into(),
            origin,
            epoch: Some(epoch),
        }
    }

    /// Same event, attributed to a different worker
    pub fn with_origin(mut self, origin: WorkerId) -> Self {
        self.origin = origin;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Encode as a single newline-terminated line
    pub fn to_line(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    pub fn from_line(line: &str) -> Result<Self> {
        Ok(serde_json::from_str(line.trim_end())?)
    }
}
