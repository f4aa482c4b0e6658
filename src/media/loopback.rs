#![forbid(unsafe_code)]

// In-process media engine: full control-plane bookkeeping, no packet I/O.
// Used for local development and as the engine behind the test suite.

use crate::media::config::{CodecCapability, RouterConfig, WebRtcTransportConfig, WorkerConfig};
use crate::media::types::{ConsumerParams, MediaError, MediaKind, MediaResult, TransportParams, WorkerDeath};
use crate::media::{MediaEngine, MediaWorker, RoutingContext};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// First fake pid handed out; keeps loopback pids visibly distinct from real ones
const FIRST_PID: u32 = 40_000;

/// Engine whose workers live inside the current process
pub struct LoopbackEngine {
    workers: StdRwLock<Vec<Arc<LoopbackWorker>>>,
    next_pid: AtomicU32,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self {
            workers: StdRwLock::new(Vec::new()),
            next_pid: AtomicU32::new(FIRST_PID),
        }
    }

    /// Concrete handle to a spawned worker, e.g. to kill it
    pub fn worker(&self, index: usize) -> Option<Arc<LoopbackWorker>> {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers.iter().find(|w| w.index == index).cloned()
    }

    /// Transports, producers and consumers still open across every worker
    pub fn live_objects(&self) -> LiveObjects {
        let workers = self.workers.read().unwrap_or_else(|e| e.into_inner());
        workers
            .iter()
            .map(|w| w.live_objects())
            .fold(LiveObjects::default(), |acc, o| acc + o)
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn spawn_worker(
        &self,
        index: usize,
        config: &WorkerConfig,
        death_tx: mpsc::UnboundedSender<WorkerDeath>,
    ) -> MediaResult<Arc<dyn MediaWorker>> {
        if config.rtc_min_port > config.rtc_max_port {
            return Err(MediaError::ConfigurationError(format!(
                "rtc port range {}-{} is empty",
                config.rtc_min_port, config.rtc_max_port
            )));
        }

        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        let worker = Arc::new(LoopbackWorker {
            index,
            pid,
            alive: Arc::new(AtomicBool::new(true)),
            ports: Arc::new(StdMutex::new(PortPool::new(config.rtc_min_port, config.rtc_max_port))),
            routers: StdMutex::new(Vec::new()),
            death_tx,
        });

        debug!("Spawned loopback worker {} (pid {})", index, pid);
        self.workers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(worker.clone());
        Ok(worker)
    }
}

/// Count of open engine objects
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LiveObjects {
    pub routers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub paused_consumers: usize,
}

impl std::ops::Add for LiveObjects {
    type Output = LiveObjects;

    fn add(self, rhs: LiveObjects) -> LiveObjects {
        LiveObjects {
            routers: self.routers + rhs.routers,
            transports: self.transports + rhs.transports,
            producers: self.producers + rhs.producers,
            consumers: self.consumers + rhs.consumers,
            paused_consumers: self.paused_consumers + rhs.paused_consumers,
        }
    }
}

/// RTC port allocator shared by every router on one worker
struct PortPool {
    min: u16,
    max: u16,
    next: u16,
    in_use: HashSet<u16>,
}

impl PortPool {
    fn new(min: u16, max: u16) -> Self {
        Self {
            min,
            max,
            next: min,
            in_use: HashSet::new(),
        }
    }

    fn allocate(&mut self) -> Option<u16> {
        let span = u32::from(self.max - self.min) + 1;
        for _ in 0..span {
            let port = self.next;
            self.next = if self.next == self.max { self.min } else { self.next + 1 };
            if self.in_use.insert(port) {
                return Some(port);
            }
        }
        None
    }

    fn release(&mut self, port: u16) {
        self.in_use.remove(&port);
    }
}

/// One in-process worker
pub struct LoopbackWorker {
    index: usize,
    pid: u32,
    alive: Arc<AtomicBool>,
    ports: Arc<StdMutex<PortPool>>,
    routers: StdMutex<Vec<Arc<LoopbackRouter>>>,
    death_tx: mpsc::UnboundedSender<WorkerDeath>,
}

impl LoopbackWorker {
    /// Simulates the worker exiting. Every router it hosts stops answering
    /// and the death is reported once.
    pub fn kill(&self, reason: &str) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Loopback worker {} (pid {}) killed: {}", self.index, self.pid, reason);
        let _ = self.death_tx.send(WorkerDeath {
            index: self.index,
            pid: self.pid,
            reason: reason.to_string(),
        });
    }

    fn live_objects(&self) -> LiveObjects {
        let routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        routers
            .iter()
            .filter(|r| !r.closed.load(Ordering::SeqCst))
            .map(|r| r.live_objects())
            .fold(LiveObjects::default(), |acc, o| acc + o)
    }
}

#[async_trait]
impl MediaWorker for LoopbackWorker {
    fn index(&self) -> usize {
        self.index
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn RoutingContext>> {
        if !self.is_alive() {
            return Err(MediaError::RouterError(format!(
                "worker {} (pid {}) is dead",
                self.index, self.pid
            )));
        }

        let router = Arc::new(LoopbackRouter {
            id: Uuid::new_v4().to_string(),
            codecs: config.media_codecs.clone(),
            worker_alive: self.alive.clone(),
            ports: self.ports.clone(),
            closed: AtomicBool::new(false),
            state: StdMutex::new(RouterState::default()),
        });

        let mut routers = self.routers.lock().unwrap_or_else(|e| e.into_inner());
        routers.retain(|r| !r.closed.load(Ordering::SeqCst));
        routers.push(router.clone());

        debug!("Created loopback router {} on worker {}", router.id, self.index);
        Ok(router)
    }
}

struct LoopTransport {
    port: u16,
    connected: bool,
}

struct LoopProducer {
    kind: MediaKind,
    transport_id: String,
    rtp_parameters: Value,
}

struct LoopConsumer {
    producer_id: String,
    transport_id: String,
    paused: bool,
}

#[derive(Default)]
struct RouterState {
    transports: HashMap<String, LoopTransport>,
    producers: HashMap<String, LoopProducer>,
    consumers: HashMap<String, LoopConsumer>,
}

impl RouterState {
    fn drop_consumers_where(&mut self, pred: impl Fn(&LoopConsumer) -> bool) {
        self.consumers.retain(|_, c| !pred(c));
    }
}

/// Router hosted by a loopback worker
pub struct LoopbackRouter {
    id: String,
    codecs: Vec<CodecCapability>,
    worker_alive: Arc<AtomicBool>,
    ports: Arc<StdMutex<PortPool>>,
    closed: AtomicBool,
    state: StdMutex<RouterState>,
}

impl LoopbackRouter {
    fn state(&self) -> std::sync::MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_usable(&self) -> MediaResult<()> {
        if !self.worker_alive.load(Ordering::SeqCst) {
            return Err(MediaError::WorkerError("worker is dead".to_string()));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(MediaError::RouterError(format!("router {} is closed", self.id)));
        }
        Ok(())
    }

    fn release_port(&self, port: u16) {
        self.ports.lock().unwrap_or_else(|e| e.into_inner()).release(port);
    }

    fn live_objects(&self) -> LiveObjects {
        let state = self.state();
        LiveObjects {
            routers: 1,
            transports: state.transports.len(),
            producers: state.producers.len(),
            consumers: state.consumers.len(),
            paused_consumers: state.consumers.values().filter(|c| c.paused).count(),
        }
    }

    /// A consumer's capabilities must list a codec of the producer's kind that
    /// this router also supports.
    fn capabilities_cover(&self, kind: MediaKind, rtp_capabilities: &Value) -> bool {
        let Some(codecs) = rtp_capabilities.get("codecs").and_then(Value::as_array) else {
            return false;
        };
        codecs.iter().any(|codec| {
            let codec_kind = codec.get("kind").and_then(Value::as_str);
            let mime_type = codec.get("mimeType").and_then(Value::as_str);
            match (codec_kind, mime_type) {
                (Some(k), Some(mime)) => {
                    k == kind.to_string()
                        && self
                            .codecs
                            .iter()
                            .any(|c| c.kind == kind && c.mime_type.eq_ignore_ascii_case(mime))
                }
                _ => false,
            }
        })
    }
}

#[async_trait]
impl RoutingContext for LoopbackRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> Value {
        json!({
            "codecs": self.codecs,
            "headerExtensions": [],
        })
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let kind = match self.state().producers.get(producer_id) {
            Some(producer) => producer.kind,
            None => return false,
        };
        self.capabilities_cover(kind, rtp_capabilities)
    }

    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<TransportParams> {
        self.ensure_usable()?;

        let port = {
            let mut ports = self.ports.lock().unwrap_or_else(|e| e.into_inner());
            ports.allocate().ok_or_else(|| {
                MediaError::TransportError(format!(
                    "no free RTC ports in range {}-{}",
                    ports.min, ports.max
                ))
            })?
        };

        let id = Uuid::new_v4().to_string();
        let credentials = Uuid::new_v4().simple().to_string();
        let fingerprint = Uuid::new_v4()
            .as_bytes()
            .iter()
            .chain(Uuid::new_v4().as_bytes().iter())
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(":");

        let params = TransportParams {
            id: id.clone(),
            ice_parameters: json!({
                "usernameFragment": &credentials[..16],
                "password": &credentials[16..],
                "iceLite": true,
            }),
            ice_candidates: json!([{
                "foundation": "udpcandidate",
                "priority": 1_076_302_079u32,
                "ip": config.candidate_ip(),
                "port": port,
                "protocol": "udp",
                "type": "host",
            }]),
            dtls_parameters: json!({
                "role": "auto",
                "fingerprints": [{ "algorithm": "sha-256", "value": fingerprint }],
            }),
        };

        self.state().transports.insert(id, LoopTransport { port, connected: false });
        Ok(params)
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        self.ensure_usable()?;
        if !dtls_parameters.is_object() {
            return Err(MediaError::TransportError("invalid DTLS parameters".to_string()));
        }

        let mut state = self.state();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| MediaError::TransportError(format!("Transport not found: {transport_id}")))?;
        if transport.connected {
            return Err(MediaError::TransportError(format!(
                "Transport {transport_id} is already connected"
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> MediaResult<String> {
        self.ensure_usable()?;
        if !rtp_parameters.is_object() {
            return Err(MediaError::ProducerError("invalid RTP parameters".to_string()));
        }

        let mut state = self.state();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::TransportError(format!("Transport not found: {transport_id}")));
        }

        let id = Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            LoopProducer {
                kind,
                transport_id: transport_id.to_string(),
                rtp_parameters,
            },
        );
        Ok(id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams> {
        self.ensure_usable()?;

        let mut state = self.state();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::TransportError(format!("Transport not found: {transport_id}")));
        }
        let (kind, rtp_parameters) = match state.producers.get(producer_id) {
            Some(p) => (p.kind, p.rtp_parameters.clone()),
            None => {
                return Err(MediaError::ConsumerError(format!("Producer not found: {producer_id}")))
            }
        };
        if !self.capabilities_cover(kind, &rtp_capabilities) {
            return Err(MediaError::ConsumerError(format!(
                "Cannot consume producer {producer_id} with the given RTP capabilities"
            )));
        }

        let id = Uuid::new_v4().to_string();
        state.consumers.insert(
            id.clone(),
            LoopConsumer {
                producer_id: producer_id.to_string(),
                transport_id: transport_id.to_string(),
                paused: true,
            },
        );

        Ok(ConsumerParams {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters,
            consumer_type: "simple".to_string(),
            paused: true,
            producer_paused: false,
        })
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.ensure_usable()?;
        let mut state = self.state();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| MediaError::ConsumerError(format!("Consumer not found: {consumer_id}")))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) {
        let mut state = self.state();
        if state.producers.remove(producer_id).is_some() {
            state.drop_consumers_where(|c| c.producer_id == producer_id);
        }
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.state().consumers.remove(consumer_id);
    }

    async fn close_transport(&self, transport_id: &str) {
        let port = {
            let mut state = self.state();
            let Some(transport) = state.transports.remove(transport_id) else {
                return;
            };
            let orphaned: Vec<String> = state
                .producers
                .iter()
                .filter(|(_, p)| p.transport_id == transport_id)
                .map(|(id, _)| id.clone())
                .collect();
            for producer_id in &orphaned {
                state.producers.remove(producer_id);
            }
            state.drop_consumers_where(|c| {
                c.transport_id == transport_id || orphaned.contains(&c.producer_id)
            });
            transport.port
        };
        self.release_port(port);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let ports: Vec<u16> = {
            let mut state = self.state();
            state.producers.clear();
            state.consumers.clear();
            state.transports.drain().map(|(_, t)| t.port).collect()
        };
        for port in ports {
            self.release_port(port);
        }
        debug!("Closed loopback router {}", self.id);
    }
}
