//! ratesync application settings
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use axum::http::StatusCode;

use crate::admission::{AdmissionPolicy, IdentifierPolicy, IdentifySource, DEFAULT_IDENTITY_HEADER};
use crate::config_error;
use crate::counter::FixedWindow;
use crate::error::Result;

pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const STANDARD_PORT_HTTP: u16 = 8000;
pub const DEFAULT_PORT_HTTP: &str = "8000";
pub const STANDARD_PORT_BUS: u16 = 8420;
pub const DEFAULT_PORT_BUS: &str = "8420";

/// Environment handed to spawned workers
pub const WORKER_ID_ENV: &str = "RATESYNC_WORKER_ID";
pub const WORKER_SLOT_ENV: &str = "RATESYNC_WORKER_SLOT";
pub const WORKERS_ENV: &str = "RATESYNC_WORKERS";

/// How workers share their counts
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncTopology {
    /// Through the supervisor, which forwards to every other worker
    #[default]
    Relay,
    /// Directly between workers over a UDP bus
    Bus,
    /// Not at all
    Isolated,
}

impl std::fmt::Display for SyncTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncTopology::Relay => write!(f, "relay"),
            SyncTopology::Bus => write!(f, "bus"),
            SyncTopology::Isolated => write!(f, "isolated"),
        }
    }
}

impl std::str::FromStr for SyncTopology {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "relay" => Ok(SyncTopology::Relay),
            "bus" => Ok(SyncTopology::Bus),
            "isolated" => Ok(SyncTopology::Isolated),
            _ => Err(format!("Invalid topology: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    // HTTP listen address, shared by every worker
    pub listen_address: IpAddr,

    // HTTP listen port, shared by every worker
    pub listen_port: u16,

    // Number of worker processes
    pub workers: usize,

    // How workers synchronize counts
    pub topology: SyncTopology,

    // Bus variant: address every worker's bus socket binds to
    pub bus_address: IpAddr,

    // Bus variant: slot N listens on bus_port + N
    pub bus_port: u16,

    // Requests allowed per client per window
    pub max_requests: u64,

    // Window length; 0 never resets counts
    pub window_seconds: u64,

    // Where client identity comes from
    pub identify_by: IdentifySource,
    pub identity_header: String,

    // Status code for rejected requests
    pub reject_status: u16,

    // Pause before replacing a crashed worker
    pub respawn_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_address: IpAddr::from([0, 0, 0, 0]),
            listen_port: STANDARD_PORT_HTTP,
            workers: num_cpus::get(),
            topology: SyncTopology::Relay,
            bus_address: IpAddr::from([127, 0, 0, 1]),
            bus_port: STANDARD_PORT_BUS,
            max_requests: 3,
            window_seconds: 60,
            identify_by: IdentifySource::HeaderOrPeer,
            identity_header: DEFAULT_IDENTITY_HEADER.to_string(),
            reject_status: 400,
            respawn_delay_ms: 100,
        }
    }
}

impl Settings {
    /// Check everything that can be checked before any socket is opened
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(config_error!("At least one worker is required"));
        }
        if self.topology == SyncTopology::Bus {
            let last_slot = u16::try_from(self.workers - 1)
                .ok()
                .and_then(|offset| self.bus_port.checked_add(offset));
            if last_slot.is_none() {
                return Err(config_error!(
                    "Bus ports {}+{} do not fit in the port range",
                    self.bus_port,
                    self.workers
                ));
            }
        }
        self.admission_policy()?;
        Ok(())
    }

    pub fn listen_socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_address, self.listen_port)
    }

    /// Bus socket address for one pool slot
    pub fn bus_slot_addr(&self, slot: usize) -> Result<SocketAddr> {
        let port = u16::try_from(slot)
            .ok()
            .and_then(|offset| self.bus_port.checked_add(offset))
            .ok_or_else(|| config_error!("No bus port for slot {}", slot))?;
        Ok(SocketAddr::new(self.bus_address, port))
    }

    /// Every slot's bus address
    pub fn bus_slots(&self) -> Result<Vec<SocketAddr>> {
        (0..self.workers).map(|slot| self.bus_slot_addr(slot)).collect()
    }

    pub fn window(&self) -> FixedWindow {
        FixedWindow::from_seconds(self.window_seconds)
    }

    pub fn respawn_delay(&self) -> Duration {
        Duration::from_millis(self.respawn_delay_ms)
    }

    pub fn admission_policy(&self) -> Result<AdmissionPolicy> {
        let reject_status = StatusCode::from_u16(self.reject_status)
            .map_err(|_| config_error!("Invalid reject status: {}", self.reject_status))?;
        Ok(AdmissionPolicy {
            threshold: self.max_requests,
            identifier: IdentifierPolicy::new(self.identify_by, &self.identity_header)?,
            reject_status,
        })
    }
}
