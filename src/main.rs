#![forbid(unsafe_code)]

use anyhow::Result;
use roomrelay::config::ServerConfig;
use roomrelay::media::{self, WorkerPool};
use roomrelay::metrics::ServerMetrics;
use roomrelay::room::RoomRegistry;
use roomrelay::signaling::SignalingServer;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomrelay=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("roomrelay - Starting server");

    let config = ServerConfig::from_env()?;
    info!(
        "Engine {:?}, {} workers, listen {} (announced {})",
        config.engine,
        config.media.worker_config.num_workers,
        config.media.webrtc_transport_config.listen_ip,
        config.media.webrtc_transport_config.candidate_ip()
    );

    let engine = media::build_engine(config.engine)?;
    let worker_pool = Arc::new(WorkerPool::start(engine, &config.media.worker_config).await?);
    info!("Media worker pool ready ({} workers)", worker_pool.len());

    let metrics = ServerMetrics::new();
    let registry = Arc::new(RoomRegistry::new(
        worker_pool.clone(),
        config.media.clone(),
        metrics.clone(),
    ));

    let signaling_server = SignalingServer::new(registry.clone(), metrics, config.max_connections);

    // Run until the server fails, Ctrl+C, or a media worker dies
    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            registry.shutdown().await;
        }
        death = worker_pool.wait_fatal() => {
            error!(
                "Exiting after death of media worker {} (pid {}): {}",
                death.index, death.pid, death.reason
            );
            std::process::exit(1);
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
