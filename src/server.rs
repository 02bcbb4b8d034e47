//! DNS server setup and lifecycle management.
//!
//! [`DnsServer::bind`] binds both listeners (startup fails fast if either
//! bind fails). [`DnsServer::run`] starts the watchers, the reconciliation
//! loop and both listeners, then drains everything under one shutdown
//! deadline once the cancellation token fires or a listener stops on its
//! own.

use hickory_proto::ProtoError;
use hickory_server::ServerFuture;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::error::DnsError;
use crate::metrics::Metrics;
use crate::reconcile;
use crate::responder::QueryResponder;
use crate::state::RecordStore;
use crate::telemetry;
use crate::watcher::{HealthSource, Watcher};

/// Deadline shared by all listeners and background tasks when draining.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// DNS server with both listeners bound, ready to run.
pub struct DnsServer {
    config: Config,
    store: RecordStore,
    source: Arc<dyn HealthSource>,
    metrics: Metrics,
    exporter: PrometheusHandle,
    udp_socket: UdpSocket,
    metrics_listener: TcpListener,
    shutdown_timeout: Duration,
}

impl DnsServer {
    /// Bind the DNS and metrics listeners for `config`.
    pub async fn bind(
        config: Config,
        source: Arc<dyn HealthSource>,
        metrics: Metrics,
        exporter: PrometheusHandle,
    ) -> Result<Self, DnsError> {
        let dns_addr = config.bind_addr()?;
        let metrics_addr = config.metrics_addr()?;

        let udp_socket = UdpSocket::bind(dns_addr)
            .await
            .map_err(|source| DnsError::Bind {
                listener: "dns",
                addr: dns_addr,
                source,
            })?;
        info!(addr = %udp_socket.local_addr()?, "DNS UDP listening");

        let metrics_listener =
            TcpListener::bind(metrics_addr)
                .await
                .map_err(|source| DnsError::Bind {
                    listener: "metrics",
                    addr: metrics_addr,
                    source,
                })?;
        info!(addr = %metrics_listener.local_addr()?, "Metrics server listening");

        Ok(Self {
            store: RecordStore::new(&config.zone),
            config,
            source,
            metrics,
            exporter,
            udp_socket,
            metrics_listener,
            shutdown_timeout: SHUTDOWN_TIMEOUT,
        })
    }

    /// Override the drain deadline (defaults to [`SHUTDOWN_TIMEOUT`]).
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Address the DNS listener is bound to.
    pub fn dns_addr(&self) -> Result<SocketAddr, DnsError> {
        Ok(self.udp_socket.local_addr()?)
    }

    /// Address the metrics listener is bound to.
    pub fn metrics_addr(&self) -> Result<SocketAddr, DnsError> {
        Ok(self.metrics_listener.local_addr()?)
    }

    /// Get a reference to the record table.
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Serve until `shutdown` is cancelled or a listener fails, then drain
    /// within the shutdown deadline.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), DnsError> {
        let Self {
            config,
            store,
            source,
            metrics,
            exporter,
            udp_socket,
            metrics_listener,
            shutdown_timeout,
        } = self;

        // Child token so a failed listener can stop everything without
        // cancelling the caller's token.
        let cancel = shutdown.child_token();
        let mut background = JoinSet::new();

        let (events_tx, events_rx) = reconcile::event_channel();
        background.spawn(reconcile::run(
            events_rx,
            store.clone(),
            metrics.clone(),
            cancel.clone(),
        ));

        for service in &config.services {
            let watcher = Watcher::new(
                service.clone(),
                source.clone(),
                events_tx.clone(),
                metrics.clone(),
            )
            .with_min_interval(config.consul.min_interval());
            background.spawn(watcher.run(cancel.clone()));
        }
        // The loop ends once every watcher has dropped its sender.
        drop(events_tx);

        background.spawn(telemetry::upkeep_loop(
            exporter.clone(),
            store.clone(),
            metrics.clone(),
            cancel.clone(),
        ));

        info!(
            services = %config.services.join(","),
            "Beginning monitoring of Consul services"
        );

        let mut dns = ServerFuture::new(QueryResponder::new(store, metrics));
        dns.register_socket(udp_socket);

        let mut metrics_server = tokio::spawn(telemetry::serve_metrics(
            metrics_listener,
            exporter,
            cancel.clone(),
        ));

        info!(zone = %config.zone, "Answer queries for zone");

        let running =
            wait_for_stop(&cancel, dns.block_until_done(), &mut metrics_server).await;
        let metrics_stopped = matches!(
            running,
            Err(DnsError::ListenerFailed {
                listener: "metrics",
                ..
            })
        );
        match &running {
            Ok(()) => info!("Shutting down..."),
            Err(e) => error!("{}, shutting down", e),
        }
        cancel.cancel();

        let drain = async {
            let metrics_drain = async {
                if metrics_stopped {
                    Ok(Ok(()))
                } else {
                    metrics_server.await
                }
            };
            let (dns_result, metrics_result) =
                tokio::join!(dns.shutdown_gracefully(), metrics_drain);

            if let Err(e) = dns_result {
                error!("Error shutting down DNS server: {}", e);
            }
            match metrics_result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Error shutting down metrics server: {}", e),
                Err(e) => error!("Metrics server task failed: {}", e),
            }

            while let Some(result) = background.join_next().await {
                if let Err(e) = result {
                    error!("Background task failed: {}", e);
                }
            }
        };

        tokio::time::timeout(shutdown_timeout, drain)
            .await
            .map_err(|_| DnsError::ShutdownTimeout(shutdown_timeout))?;

        info!("DNS server stopped");
        running
    }
}

/// Wait until `cancel` fires or one of the listeners stops on its own.
/// A listener stopping before cancellation is an error even if it
/// reported success.
async fn wait_for_stop<D, M>(
    cancel: &CancellationToken,
    dns: D,
    metrics: M,
) -> Result<(), DnsError>
where
    D: Future<Output = Result<(), ProtoError>>,
    M: Future<Output = Result<io::Result<()>, JoinError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(()),
        result = dns => Err(DnsError::ListenerFailed {
            listener: "dns",
            reason: match result {
                Ok(()) => "server exited".to_string(),
                Err(e) => e.to_string(),
            },
        }),
        result = metrics => Err(DnsError::ListenerFailed {
            listener: "metrics",
            reason: match result {
                Ok(Ok(())) => "server exited".to_string(),
                Ok(Err(e)) => e.to_string(),
                Err(e) => e.to_string(),
            },
        }),
    }
}
