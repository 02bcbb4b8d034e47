//! Error types for consul-dns.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur in the DNS bridge.
#[derive(Debug, Error)]
pub enum DnsError {
    /// IO error (network, file, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be read or deserialized.
    #[error("Error loading config: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A listener could not be bound at startup.
    #[error("Failed to bind {listener} listener on {addr}: {source}")]
    Bind {
        /// Which listener failed ("dns" or "metrics").
        listener: &'static str,
        /// Address the bind was attempted on.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// A listener stopped while the server was running.
    #[error("{listener} listener stopped unexpectedly: {reason}")]
    ListenerFailed {
        /// Which listener stopped ("dns" or "metrics").
        listener: &'static str,
        /// What the listener reported when it stopped.
        reason: String,
    },

    /// HTTP client error talking to the registry
    #[error("Registry HTTP error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Registry answered with a non-success status.
    #[error("Registry returned status {status} for service {service}")]
    RegistryStatus {
        /// Service being fetched.
        service: String,
        /// HTTP status code returned.
        status: u16,
    },

    /// Failed to parse address
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Listeners did not drain before the shutdown deadline.
    #[error("Timeout while shutting down server (deadline {0:?})")]
    ShutdownTimeout(Duration),
}
