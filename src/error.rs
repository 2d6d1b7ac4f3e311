use std::fmt;

/// Main error type for ratesync workers and their supervisor
#[derive(Debug)]
pub enum RateSyncError {
    /// Configuration or CLI argument errors
    Config(String),

    /// System I/O errors
    Io(std::io::Error),

    /// Sync transport errors (bus sockets, relay pipes)
    Transport(String),

    /// Sync event encoding/decoding errors
    Serialization(serde_json::Error),

    /// Worker spawning and lifecycle errors
    Supervisor(String),
}

impl fmt::Display for RateSyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateSyncError::Config(msg) => write!(f, "Configuration error: {}", msg),
            RateSyncError::Io(err) => write!(f, "I/O error: {}", err),
            RateSyncError::Transport(msg) => write!(f, "Transport error: {}", msg),
            RateSyncError::Serialization(err) => write!(f, "Serialization error: {}", err),
            RateSyncError::Supervisor(msg) => write!(f, "Supervisor error: {}", msg),
        }
    }
}

impl std::error::Error for RateSyncError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RateSyncError::Io(err) => Some(err),
            RateSyncError::Serialization(err) => Some(err),
            _ => None,
        }
    }
}

// Convenient type alias for Results using our error type
pub type Result<T> = std::result::Result<T, RateSyncError>;

impl RateSyncError {
    /// Get the error type identifier
    pub fn error_type(&self) -> &'static str {
        match self {
            RateSyncError::Config(_) => "configuration_error",
            RateSyncError::Io(_) => "io_error",
            RateSyncError::Transport(_) => "transport_error",
            RateSyncError::Serialization(_) => "serialization_error",
            RateSyncError::Supervisor(_) => "supervisor_error",
        }
    }
}

impl From<std::io::Error> for RateSyncError {
    fn from(err: std::io::Error) -> Self {
        RateSyncError::Io(err)
    }
}

impl From<serde_json::Error> for RateSyncError {
    fn from(err: serde_json::Error) -> Self {
        RateSyncError::Serialization(err)
    }
}

impl From<std::net::AddrParseError> for RateSyncError {
    fn from(err: std::net::AddrParseError) -> Self {
        RateSyncError::Config(format!("Invalid address: {}", err))
    }
}

// Helper macros for common error construction patterns
#[macro_export]
macro_rules! config_error {
    ($msg:expr) => {
        $crate::error::RateSyncError::Config($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RateSyncError::Config(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! transport_error {
    ($msg:expr) => {
        $crate::error::RateSyncError::Transport($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RateSyncError::Transport(format!($fmt, $($arg)*))
    };
}

#[macro_export]
macro_rules! supervisor_error {
    ($msg:expr) => {
        $crate::error::RateSyncError::Supervisor($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::RateSyncError::Supervisor(format!($fmt, $($arg)*))
    };
}
