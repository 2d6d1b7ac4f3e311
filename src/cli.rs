//! CLI for this application
//!
//! The same binary runs as supervisor or worker. Workers are started by the
//! supervisor with the supervisor's own arguments plus the worker identity
//! in the environment.
use std::net::IpAddr;

use crate::admission::IdentifySource;
use crate::error::Result;
use crate::settings::{self, SyncTopology};
use crate::sync::WorkerId;

pub use crate::settings::{APP_NAME, APP_VERSION};

#[derive(Clone, Debug, clap::Parser)]
#[command(name = "ratesync", version, about)]
pub struct Cli {
    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("RATESYNC_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: IpAddr,

    // HTTP listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("RATESYNC_LISTEN_PORT"),
        help = "Port every worker serves HTTP on"
    )]
    pub listen_port: u16,

    // Pool size
    #[clap(
        long,
        env("RATESYNC_WORKERS"),
        help = "Number of worker processes (default: one per CPU)"
    )]
    pub workers: Option<usize>,

    // Sync topology
    #[clap(
        long,
        default_value = "relay",
        env("RATESYNC_TOPOLOGY"),
        help = "topology: 'relay', 'bus', or 'isolated'"
    )]
    pub topology: SyncTopology,

    // Bus socket address
    #[clap(
        long,
        default_value = "127.0.0.1",
        env("RATESYNC_BUS_ADDRESS"),
        help = "Address worker bus sockets bind to (bus topology)"
    )]
    pub bus_address: IpAddr,

    // First bus port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_BUS,
        env("RATESYNC_BUS_PORT"),
        help = "First bus port; worker slot N uses this port + N (bus topology)"
    )]
    pub bus_port: u16,

    // Rate limit settings: max requests per window
    #[clap(
        long,
        default_value = "3",
        env("RATESYNC_MAX_REQUESTS"),
        help = "Requests allowed per client and window"
    )]
    pub max_requests: u64,

    // Rate limit settings: window length
    #[clap(
        long,
        default_value = "60",
        env("RATESYNC_WINDOW_SECONDS"),
        help = "Window length in seconds (0: counts never reset)"
    )]
    pub window_seconds: u64,

    #[clap(
        long,
        default_value = "header-or-peer",
        env("RATESYNC_IDENTIFY_BY"),
        help = "identify-by: 'header-or-peer', 'header', or 'peer'"
    )]
    pub identify_by: IdentifySource,

    #[clap(
        long,
        default_value = crate::admission::DEFAULT_IDENTITY_HEADER,
        env("RATESYNC_IDENTITY_HEADER"),
        help = "Header carrying the client identity"
    )]
    pub identity_header: String,

    #[clap(
        long,
        default_value = "400",
        env("RATESYNC_REJECT_STATUS"),
        help = "HTTP status for rejected requests"
    )]
    pub reject_status: u16,

    #[clap(
        long,
        default_value = "100",
        env("RATESYNC_RESPAWN_DELAY_MS"),
        help = "Delay before replacing a crashed worker"
    )]
    pub respawn_delay_ms: u64,

    // Set by the supervisor for its children
    // 0 marks an unknown origin on the wire, so worker ids start at 1
    #[clap(
        long,
        hide = true,
        env(settings::WORKER_ID_ENV),
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub worker_id: Option<u32>,

    #[clap(long, hide = true, default_value = "0", env(settings::WORKER_SLOT_ENV))]
    pub worker_slot: usize,
}

/// What this process is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Worker { id: WorkerId, slot: usize },
}

impl Cli {
    pub fn role(&self) -> Role {
        match self.worker_id {
            Some(id) => Role::Worker {
                id: WorkerId::new(id),
                slot: self.worker_slot,
            },
            None => Role::Supervisor,
        }
    }

    pub fn into_settings(self) -> Result<settings::Settings> {
        let settings = settings::Settings {
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            workers: self.workers.unwrap_or_else(num_cpus::get),
            topology: self.topology,
            bus_address: self.bus_address,
            bus_port: self.bus_port,
            max_requests: self.max_requests,
            window_seconds: self.window_seconds,
            identify_by: self.identify_by,
            identity_header: self.identity_header,
            reject_status: self.reject_status,
            respawn_delay_ms: self.respawn_delay_ms,
        };
        settings.validate()?;
        Ok(settings)
    }
}
