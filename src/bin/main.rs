//! consul-dns binary entry point.

use clap::Parser;
use consul_dns::{telemetry, Config, ConsulHealthSource, DnsServer};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Authoritative DNS server publishing one healthy address per Consul service.
#[derive(Parser, Debug)]
#[command(name = "consul-dns")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file (YAML or TOML).
    #[arg(short, long)]
    config: PathBuf,
}

/// Resolve on SIGINT or SIGTERM.
async fn termination_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = signal(SignalKind::terminate())?;
        tokio::select! {
            result = tokio::signal::ctrl_c() => result,
            _ = terminate.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(&args.config)?;

    // Initialize telemetry
    telemetry::init(&config.telemetry).map_err(|e| e as Box<dyn std::error::Error>)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config_file = %args.config.display(),
        bind = %config.bind,
        metrics_listen = %config.metrics_listen,
        zone = %config.zone,
        consul = %config.consul.address,
        "Starting consul-dns"
    );

    let source = Arc::new(ConsulHealthSource::new(&config.consul)?);
    let (metrics, exporter) = telemetry::prometheus();

    let server = match DnsServer::bind(config, source, metrics, exporter).await {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {}", e);
            return Err(e.into());
        }
    };

    // Setup graceful shutdown
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = termination_signal().await {
                error!("Failed to listen for shutdown signals: {}", e);
            }
            shutdown.cancel();
        }
    });

    if let Err(e) = server.run(shutdown).await {
        error!("DNS server error: {}", e);
        return Err(e.into());
    }

    info!("consul-dns shutdown complete");
    Ok(())
}
