//! Entry point of the service API: flag parsing, tracing setup, and the
//! aggregator plus HTTP server lifecycle. The aggregator tasks are started
//! before the accept loop blocks, so regions are ingested while the server
//! runs.

use std::sync::Arc;

use clap::Parser;
use envconfig::Envconfig;
use tokio::signal;

use grs::aggregator::Aggregator;
use grs::config::Config;
use grs::distributor::{EventProcessor, ResourceDistributor};
use grs::router;
use grs::types::event::enable_checkpoints;
use health::HealthRegistry;

/// Global resource service API server.
#[derive(Parser)]
struct Opts {
    /// Address the service listens on.
    #[arg(long, env = "GRS_MASTER_IP")]
    master_ip: Option<String>,

    /// Port the service listens on.
    #[arg(long, env = "GRS_MASTER_PORT")]
    master_port: Option<u16>,

    /// Comma-separated resource region manager URLs.
    #[arg(long, env = "GRS_RESOURCE_URLS")]
    resource_urls: Option<String>,
}

async fn shutdown() {
    let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("failed to register SIGTERM handler");

    let mut interrupt = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("failed to register SIGINT handler");

    tokio::select! {
        _ = term.recv() => {},
        _ = interrupt.recv() => {},
    };

    tracing::info!("Shutting down gracefully...");
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let opts = Opts::parse();
    let mut config = Config::init_from_env().expect("Invalid configuration:");
    if let Some(master_ip) = opts.master_ip {
        config.master_ip = master_ip;
    }
    if let Some(master_port) = opts.master_port {
        config.master_port = master_port;
    }
    if let Some(resource_urls) = opts.resource_urls {
        config.resource_urls = resource_urls;
    }

    enable_checkpoints(config.enable_checkpoints);

    let distributor = Arc::new(ResourceDistributor::new(config.event_queue_capacity));
    let liveness = HealthRegistry::new("liveness");

    // The ingestion tasks must be running before the server blocks on the
    // accept loop, or no region would ever be ingested.
    let processor: Arc<dyn EventProcessor> = distributor.clone();
    let aggregator = Aggregator::new(config.resource_urls(), processor)
        .with_timeouts(config.rrm_list_timeout.0, config.rrm_watch_timeout.0);
    let _ingestion = aggregator.run(&liveness).await;

    let app = router::router(
        distributor,
        liveness,
        config.response_chunk_size,
        config.export_prometheus,
    );

    // Failing to bind the listening socket is the only fatal error.
    let listener = tokio::net::TcpListener::bind(config.bind())
        .await
        .expect("failed to bind service-api listener");

    tracing::info!("listening on {}", config.bind());

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown())
        .await
        .expect("service-api server failed");
}
