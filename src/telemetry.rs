//! Telemetry setup for consul-dns.
//!
//! Supports:
//! - Tracing with configurable log levels
//! - A Prometheus recorder handed to components as a [`Metrics`] handle
//! - The HTTP endpoint exposing it

use axum::extract::State;
use axum::http::header;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;
use crate::metrics::Metrics;
use crate::state::RecordStore;

/// Interval for exporter upkeep and state gauges.
pub const UPKEEP_INTERVAL: Duration = Duration::from_secs(10);

const INDEX_PAGE: &str = r#"<html>
<head><title>consul-dns metrics</title></head>
<body>
<h1>consul-dns metrics</h1>
<p><a href="/metrics">Metrics</a></p>
</body>
</html>"#;

/// Initialize logging.
pub fn init(config: &TelemetryConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()?;

    Ok(())
}

/// Build a Prometheus-backed metrics handle and the handle used to render it.
pub fn prometheus() -> (Metrics, PrometheusHandle) {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    (Metrics::new(recorder), handle)
}

/// Router for the metrics listener.
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new()
        .route("/", get(|| async { Html(INDEX_PAGE) }))
        .route("/metrics", get(render_metrics))
        .with_state(handle)
}

async fn render_metrics(State(handle): State<PrometheusHandle>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        handle.render(),
    )
}

/// Serve the metrics endpoint until `cancel` fires, then finish in-flight
/// requests.
pub async fn serve_metrics(
    listener: TcpListener,
    handle: PrometheusHandle,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, metrics_router(handle))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}

/// Periodically run exporter upkeep and refresh state gauges.
pub async fn upkeep_loop(
    handle: PrometheusHandle,
    store: RecordStore,
    metrics: Metrics,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(UPKEEP_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                handle.run_upkeep();
                metrics.record_state_counts(store.len());
                debug!(records = store.len(), "emitted state metrics");
            }
            _ = cancel.cancelled() => {
                debug!("upkeep loop shutting down");
                return;
            }
        }
    }
}
