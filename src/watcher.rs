//! Per-service watchers polling the registry for healthy nodes.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConsulConfig;
use crate::error::DnsError;
use crate::metrics::Metrics;
use crate::state::AddressEvent;

const MAX_BACKOFF_SECS: u64 = 30;

/// Healthy node addresses of a service as reported by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSnapshot {
    /// Addresses of nodes passing all health checks.
    pub addresses: Vec<String>,
    /// Registry change index, if the source supports blocking queries.
    pub index: Option<u64>,
}

/// Source of per-service health state.
#[async_trait]
pub trait HealthSource: Send + Sync + 'static {
    /// Fetch the healthy addresses of `service`. When `index` is set the
    /// source may block until its state moves past that index.
    async fn fetch(&self, service: &str, index: Option<u64>) -> Result<HealthSnapshot, DnsError>;
}

/// Entry of Consul's `/v1/health/service/<name>` response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceEntry {
    node: NodeEntry,
    #[serde(default)]
    service: Option<ServiceDefinition>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NodeEntry {
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ServiceDefinition {
    #[serde(default)]
    address: String,
}

impl ServiceEntry {
    /// The service address when registered, otherwise the node address.
    fn into_address(self) -> String {
        match self.service {
            Some(service) if !service.address.is_empty() => service.address,
            _ => self.node.address,
        }
    }
}

/// Health source backed by the Consul HTTP API.
#[derive(Debug, Clone)]
pub struct ConsulHealthSource {
    client: reqwest::Client,
    base_url: String,
    datacenter: Option<String>,
    token: Option<String>,
    wait: Duration,
}

impl ConsulHealthSource {
    /// Create a source for the given Consul configuration.
    pub fn new(config: &ConsulConfig) -> Result<Self, DnsError> {
        let wait = config.wait();
        // Consul adds up to wait/16 of jitter to blocking queries.
        let client = reqwest::Client::builder()
            .timeout(wait + wait / 16 + Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.address.trim_end_matches('/').to_string(),
            datacenter: config.datacenter.clone(),
            token: config.token.clone(),
            wait,
        })
    }
}

#[async_trait]
impl HealthSource for ConsulHealthSource {
    async fn fetch(&self, service: &str, index: Option<u64>) -> Result<HealthSnapshot, DnsError> {
        let url = format!("{}/v1/health/service/{}", self.base_url, service);

        let mut params: Vec<(&str, String)> = vec![("passing", "true".to_string())];
        if let Some(index) = index {
            params.push(("index", index.to_string()));
            params.push(("wait", format!("{}s", self.wait.as_secs())));
        }
        if let Some(ref dc) = self.datacenter {
            params.push(("dc", dc.clone()));
        }

        let mut request = self.client.get(url).query(&params);
        if let Some(ref token) = self.token {
            request = request.header("X-Consul-Token", token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DnsError::RegistryStatus {
                service: service.to_string(),
                status: status.as_u16(),
            });
        }

        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        let entries: Vec<ServiceEntry> = response.json().await?;

        Ok(HealthSnapshot {
            addresses: entries.into_iter().map(ServiceEntry::into_address).collect(),
            index,
        })
    }
}

/// Index to send with the next blocking query. Consul indexes only grow;
/// a smaller (or zero) index means the state was reset and a fresh read is
/// needed.
fn next_index(previous: Option<u64>, returned: Option<u64>) -> Option<u64> {
    match (previous, returned) {
        (_, Some(0)) | (_, None) => None,
        (Some(prev), Some(next)) if next < prev => None,
        (_, next) => next,
    }
}

/// Sleep for `duration` unless cancelled first. Returns false on cancellation.
async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = sleep(duration) => true,
    }
}

/// Watches one service and reports its healthy addresses.
pub struct Watcher {
    service: String,
    source: Arc<dyn HealthSource>,
    events: mpsc::Sender<AddressEvent>,
    metrics: Metrics,
    min_interval: Duration,
}

impl Watcher {
    /// Create a watcher for `service` reporting on `events`.
    pub fn new(
        service: impl Into<String>,
        source: Arc<dyn HealthSource>,
        events: mpsc::Sender<AddressEvent>,
        metrics: Metrics,
    ) -> Self {
        Self {
            service: service.into(),
            source,
            events,
            metrics,
            min_interval: ConsulConfig::default().min_interval(),
        }
    }

    /// Minimum time between the start of two fetches.
    pub fn with_min_interval(mut self, min_interval: Duration) -> Self {
        self.min_interval = min_interval;
        self
    }

    /// Poll until `cancel` fires or the event channel closes.
    pub async fn run(self, cancel: CancellationToken) {
        info!(service = %self.service, "Starting service watcher");
        self.metrics.set_monitor_running(&self.service, true);

        self.watch(&cancel).await;

        self.metrics.set_monitor_running(&self.service, false);
        info!(service = %self.service, "Service watcher stopped");
    }

    async fn watch(&self, cancel: &CancellationToken) {
        let service = self.service.as_str();
        let mut index: Option<u64> = None;
        let mut backoff_secs = 1u64;

        loop {
            let started = Instant::now();

            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = self.source.fetch(service, index) => result,
            };

            match result {
                Ok(snapshot) => {
                    backoff_secs = 1;
                    self.metrics.record_service_update(service);

                    let unchanged = index.is_some() && snapshot.index == index;
                    index = next_index(index, snapshot.index);

                    if unchanged {
                        debug!(service, index = ?index, "blocking query returned without changes");
                    } else {
                        debug!(
                            service,
                            index = ?index,
                            count = snapshot.addresses.len(),
                            "fetched healthy nodes"
                        );
                        let event = AddressEvent {
                            service: self.service.clone(),
                            addresses: snapshot.addresses,
                        };

                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return,
                            sent = self.events.send(event) => {
                                if sent.is_err() {
                                    debug!(service, "event channel closed");
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(service, "Failed to fetch healthy nodes: {}", e);
                    self.metrics.record_fetch_failure(service);
                    if !sleep_or_cancel(cancel, Duration::from_secs(backoff_secs)).await {
                        return;
                    }
                    backoff_secs = (backoff_secs * 2).min(MAX_BACKOFF_SECS);
                    continue;
                }
            }

            let elapsed = started.elapsed();
            if elapsed < self.min_interval
                && !sleep_or_cancel(cancel, self.min_interval - elapsed).await
            {
                return;
            }
        }
    }
}
