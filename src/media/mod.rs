#![forbid(unsafe_code)]

// Media module - engine seam, worker pool, and engine backends

pub mod config;
pub mod loopback;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;
pub mod types;
pub mod worker_pool;

pub use config::{EngineKind, MediaConfig, RouterConfig, WebRtcTransportConfig, WorkerConfig};
pub use types::{ConsumerParams, MediaError, MediaKind, MediaResult, TransportParams, WorkerDeath};
pub use worker_pool::WorkerPool;

use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Factory for media workers. One implementation per engine backend.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Short backend name for logs and health output
    fn name(&self) -> &'static str;

    /// Spawns worker number `index`. The engine must report the worker's
    /// death on `death_tx` exactly once if it ever exits.
    ///
    /// # Errors
    /// Returns `MediaError::WorkerError` if the worker cannot be started
    async fn spawn_worker(
        &self,
        index: usize,
        config: &WorkerConfig,
        death_tx: mpsc::UnboundedSender<WorkerDeath>,
    ) -> MediaResult<Arc<dyn MediaWorker>>;
}

/// Handle to one engine worker hosting routing contexts for many rooms
#[async_trait]
pub trait MediaWorker: Send + Sync {
    fn index(&self) -> usize;

    /// Process identifier, for diagnostics only
    fn pid(&self) -> u32;

    fn is_alive(&self) -> bool;

    /// Creates a new routing context (router) on this worker.
    ///
    /// # Errors
    /// Returns `MediaError::RouterError` if the worker refuses or is dead
    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn RoutingContext>>;
}

/// Per-room handle into the engine. Every media object is addressed by its
/// engine-assigned id; capability and parameter descriptors are opaque JSON.
///
/// The `close_*` calls are idempotent and never fail: closing an unknown id is a no-op.
#[async_trait]
pub trait RoutingContext: Send + Sync {
    fn id(&self) -> &str;

    /// Capabilities descriptor clients load before producing or consuming
    fn rtp_capabilities(&self) -> Value;

    /// Whether a consumer with `rtp_capabilities` can receive `producer_id`
    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool;

    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<TransportParams>;

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()>;

    /// Returns the new producer id
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<String>;

    /// Creates a consumer. Consumers always start paused.
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams>;

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()>;

    async fn close_producer(&self, producer_id: &str);

    async fn close_consumer(&self, consumer_id: &str);

    async fn close_transport(&self, transport_id: &str);

    /// Releases the router and everything created on it
    async fn close(&self);
}

/// Runs an engine call with an upper time bound.
///
/// # Errors
/// Returns `MediaError::Timeout` if `limit` elapses first, or the call's own error
pub async fn with_timeout<T, F>(limit: Duration, call: F) -> MediaResult<T>
where
    F: Future<Output = MediaResult<T>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(MediaError::Timeout(saturating_millis(limit))),
    }
}

fn saturating_millis(limit: Duration) -> u64 {
    u64::try_from(limit.as_millis()).unwrap_or(u64::MAX)
}

/// Builds the engine selected by configuration.
///
/// # Errors
/// Returns an error if the selected backend was not compiled in
pub fn build_engine(kind: EngineKind) -> anyhow::Result<Arc<dyn MediaEngine>> {
    match kind {
        EngineKind::Loopback => Ok(Arc::new(loopback::LoopbackEngine::new())),
        #[cfg(feature = "mediasoup")]
        EngineKind::Mediasoup => Ok(Arc::new(mediasoup_engine::MediasoupEngine::new())),
        #[cfg(not(feature = "mediasoup"))]
        EngineKind::Mediasoup => {
            anyhow::bail!("MEDIA_ENGINE=mediasoup requires building with the `mediasoup` feature")
        }
    }
}
