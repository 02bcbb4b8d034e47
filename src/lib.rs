//! Consul DNS - An authoritative DNS bridge publishing one healthy address per service.
//!
//! This crate answers A queries for `<service>.<zone>.` with exactly one address
//! taken from the nodes Consul currently reports as passing their health checks.
//!
//! ## Features
//!
//! - One watcher per configured service, polling Consul with blocking queries
//! - Sticky failover: the published address only changes when it stops being healthy
//! - Zero-TTL answers so clients always see the current selection
//! - Prometheus metrics endpoint
//! - Graceful shutdown with a bounded deadline
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                          consul-dns                           │
//! │                                                               │
//! │  ┌───────────┐  AddressEvent  ┌────────────────┐              │
//! │  │ Watcher   │───┐            │ Reconciliation │              │
//! │  │ (svc1)    │   ├──channel──▶│ loop (writer)  │              │
//! │  ├───────────┤   │            └───────┬────────┘              │
//! │  │ Watcher   │───┘                    │ reconcile             │
//! │  │ (svc2)    │                        ▼                       │
//! │  └───────────┘               ┌────────────────┐               │
//! │        ▲                     │  RecordStore   │               │
//! │        │ /v1/health/service  │  fqdn -> addr  │               │
//! │     Consul                   └───────┬────────┘               │
//! │                                      │ lookup                 │
//! │                              ┌───────▼────────┐               │
//! │                              │ QueryResponder │◀── UDP        │
//! │                              └────────────────┘               │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Selection
//!
//! ```text
//! healthy = []                 → keep publishing the previous address
//! current ∈ healthy            → keep current
//! otherwise                    → publish min(healthy) (string order)
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use consul_dns::{telemetry, Config, ConsulHealthSource, DnsServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), consul_dns::DnsError> {
//!     let config = Config::load("consul-dns.yaml".as_ref())?;
//!     let source = Arc::new(ConsulHealthSource::new(&config.consul)?);
//!     let (metrics, exporter) = telemetry::prometheus();
//!
//!     let server = DnsServer::bind(config, source, metrics, exporter).await?;
//!     server.run(CancellationToken::new()).await
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod metrics;
pub mod reconcile;
pub mod responder;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod watcher;

// Re-export main types
pub use config::{Config, ConsulConfig, TelemetryConfig};
pub use error::DnsError;
pub use metrics::Metrics;
pub use responder::QueryResponder;
pub use server::DnsServer;
pub use state::{AddressEvent, RecordStore};
pub use watcher::{ConsulHealthSource, HealthSnapshot, HealthSource, Watcher};
