#![forbid(unsafe_code)]

// Room management - one routing context plus the peers joined to it

pub mod peer;
pub mod registry;

pub use peer::{ConsumerEntry, Peer, ProducerEntry, TransportEntry, TransportState};
pub use registry::RoomRegistry;

use crate::media::config::MediaConfig;
use crate::media::types::{ConsumerParams, MediaError, MediaKind, TransportParams};
use crate::media::{with_timeout, RoutingContext};
use crate::signaling::protocol::{ProducerDescriptor, RoomSnapshot, ServerMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock as StdRwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Failures of room and registry operations. None of these are fatal to the
/// process; the signaling layer turns them into error replies.
#[derive(Error, Debug)]
pub enum RoomError {
    #[error("Room does not exist")]
    RoomNotFound(String),

    #[error("already exists")]
    RoomAlreadyExists(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Peer {0} already joined this room")]
    PeerAlreadyJoined(String),

    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Transport {0} is not connected")]
    TransportNotConnected(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Cannot consume producer {0} with the given RTP capabilities")]
    CapabilityMismatch(String),

    #[error("No healthy media worker: {0}")]
    WorkerFailure(String),

    #[error(transparent)]
    Engine(#[from] MediaError),
}

impl RoomError {
    /// True for the "something was already gone" family
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RoomError::RoomNotFound(_)
                | RoomError::PeerNotFound(_)
                | RoomError::TransportNotFound(_)
                | RoomError::ProducerNotFound(_)
                | RoomError::ConsumerNotFound(_)
        )
    }
}

pub type RoomResult<T> = Result<T, RoomError>;

struct RoomState {
    peers: HashMap<String, Peer>,
    /// Set by the registry when it removes the room; rejects late joins
    closed: bool,
}

/// A consumer torn down because its producer went away
struct OrphanedConsumer {
    peer_id: String,
    consumer_id: String,
}

/// One conference. Owns its routing context and its peers.
///
/// Engine calls are made with no lock held. Every mutation that follows an
/// engine call re-checks that the peer, transport or producer it touches is
/// still there, and releases the fresh engine object if not.
pub struct Room {
    id: String,
    worker_index: usize,
    worker_pid: u32,
    router: Arc<dyn RoutingContext>,
    config: Arc<MediaConfig>,
    state: StdRwLock<RoomState>,
}

impl Room {
    pub fn new(
        id: String,
        worker_index: usize,
        worker_pid: u32,
        router: Arc<dyn RoutingContext>,
        config: Arc<MediaConfig>,
    ) -> Self {
        Self {
            id,
            worker_index,
            worker_pid,
            router,
            config,
            state: StdRwLock::new(RoomState {
                peers: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn worker_index(&self) -> usize {
        self.worker_index
    }

    pub fn worker_pid(&self) -> u32 {
        self.worker_pid
    }

    fn state(&self) -> RwLockReadGuard<'_, RoomState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, RoomState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    async fn engine<T, F>(&self, call: F) -> RoomResult<T>
    where
        F: Future<Output = Result<T, MediaError>>,
    {
        Ok(with_timeout(self.config.request_timeout, call).await?)
    }

    pub fn peer_count(&self) -> usize {
        self.state().peers.len()
    }

    /// Inserts a freshly joined peer and returns the room snapshot.
    ///
    /// # Errors
    /// `RoomNotFound` if the room was closed meanwhile, `PeerAlreadyJoined`
    /// if a peer with the same id is already present
    pub fn add_peer(&self, peer: Peer) -> RoomResult<RoomSnapshot> {
        let mut state = self.state_mut();
        if state.closed {
            return Err(RoomError::RoomNotFound(self.id.clone()));
        }
        if state.peers.contains_key(peer.id()) {
            return Err(RoomError::PeerAlreadyJoined(peer.id().to_string()));
        }

        info!("Peer {} ({}) joined room {}", peer.id(), peer.name(), self.id);
        state.peers.insert(peer.id().to_string(), peer);
        Ok(Self::snapshot_of(&self.id, &state))
    }

    /// Removes a peer and releases everything it owned. Consumers other
    /// peers held on its producers are released too, and their owners get a
    /// `consumerClosed` push. No "peer left" event is broadcast.
    ///
    /// # Errors
    /// `PeerNotFound` if the peer is not (or no longer) in the room
    pub async fn remove_peer(&self, peer_id: &str) -> RoomResult<()> {
        let (mut peer, orphaned) = {
            let mut state = self.state_mut();
            let peer = state
                .peers
                .remove(peer_id)
                .ok_or_else(|| RoomError::PeerNotFound(peer_id.to_string()))?;
            let producer_ids: Vec<String> = peer.producers().map(|p| p.id.clone()).collect();
            let orphaned = Self::detach_consumers_of(&mut state.peers, &producer_ids);
            (peer, orphaned)
        };

        self.release_orphaned(orphaned).await;
        peer.close(self.router.as_ref()).await;

        info!("Peer {} left room {}", peer_id, self.id);
        Ok(())
    }

    pub fn rtp_capabilities(&self) -> Value {
        self.router.rtp_capabilities()
    }

    /// Creates a transport on the room's router and attaches it to the peer.
    ///
    /// # Errors
    /// `PeerNotFound`, or `Engine` if allocation fails (e.g. port exhaustion)
    pub async fn create_webrtc_transport(&self, peer_id: &str) -> RoomResult<TransportParams> {
        self.ensure_peer(peer_id)?;

        let params = self
            .engine(self.router.create_webrtc_transport(&self.config.webrtc_transport_config))
            .await?;

        let attached = {
            let mut state = self.state_mut();
            match state.peers.get_mut(peer_id) {
                Some(peer) => {
                    peer.add_transport(params.id.clone());
                    true
                }
                None => false,
            }
        };
        if !attached {
            self.router.close_transport(&params.id).await;
            return Err(RoomError::PeerNotFound(peer_id.to_string()));
        }

        info!("Created transport {} for peer {} in room {}", params.id, peer_id, self.id);
        Ok(params)
    }

    /// Completes DTLS negotiation on one of the peer's transports.
    ///
    /// # Errors
    /// `PeerNotFound`, `TransportNotFound`, or `Engine`
    pub async fn connect_peer_transport(
        &self,
        peer_id: &str,
        transport_id: &str,
        dtls_parameters: Value,
    ) -> RoomResult<()> {
        {
            let state = self.state();
            let peer = Self::peer_in(&state, peer_id)?;
            if peer.transport(transport_id).is_none() {
                return Err(RoomError::TransportNotFound(transport_id.to_string()));
            }
        }

        self.engine(self.router.connect_transport(transport_id, dtls_parameters))
            .await?;

        let mut state = self.state_mut();
        let peer = Self::peer_in_mut(&mut state, peer_id)?;
        if !peer.mark_transport_connected(transport_id) {
            return Err(RoomError::TransportNotFound(transport_id.to_string()));
        }

        debug!("Connected transport {} for peer {}", transport_id, peer_id);
        Ok(())
    }

    /// Publishes a track on a connected transport and tells every other peer
    /// about it with a `newProducers` push.
    ///
    /// # Errors
    /// `PeerNotFound`, `TransportNotFound`, `TransportNotConnected`, or `Engine`
    pub async fn produce(
        &self,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: Value,
    ) -> RoomResult<String> {
        {
            let state = self.state();
            let peer = Self::peer_in(&state, peer_id)?;
            match peer.transport(transport_id) {
                None => return Err(RoomError::TransportNotFound(transport_id.to_string())),
                Some(t) if t.state != TransportState::Connected => {
                    return Err(RoomError::TransportNotConnected(transport_id.to_string()))
                }
                Some(_) => {}
            }
        }

        let producer_id = self
            .engine(self.router.produce(transport_id, kind, rtp_parameters))
            .await?;

        let stale = {
            let mut state = self.state_mut();
            match state.peers.get_mut(peer_id) {
                Some(peer) if peer.transport(transport_id).is_some() => {
                    peer.add_producer(ProducerEntry {
                        id: producer_id.clone(),
                        kind,
                        transport_id: transport_id.to_string(),
                    });
                    let push = ServerMessage::NewProducers {
                        producers: vec![ProducerDescriptor {
                            producer_id: producer_id.clone(),
                            kind,
                        }],
                    };
                    Self::broadcast_except(&state, peer_id, &push);
                    None
                }
                Some(_) => Some(RoomError::TransportNotFound(transport_id.to_string())),
                None => Some(RoomError::PeerNotFound(peer_id.to_string())),
            }
        };
        if let Some(err) = stale {
            self.router.close_producer(&producer_id).await;
            return Err(err);
        }

        info!("Peer {} produced {} {} in room {}", peer_id, kind, producer_id, self.id);
        Ok(producer_id)
    }

    /// Every producer in the room not owned by `exclude_peer_id`
    pub fn producer_list_for_peer(&self, exclude_peer_id: &str) -> Vec<ProducerDescriptor> {
        let state = self.state();
        state
            .peers
            .values()
            .filter(|p| p.id() != exclude_peer_id)
            .flat_map(|p| p.producers())
            .map(|p| ProducerDescriptor {
                producer_id: p.id.clone(),
                kind: p.kind,
            })
            .collect()
    }

    /// Subscribes the peer to a producer owned by anyone in the room. The
    /// consumer starts paused.
    ///
    /// The peer's capabilities are recorded on its first consume and reused
    /// for every later one.
    ///
    /// # Errors
    /// `PeerNotFound`, `TransportNotFound`, `ProducerNotFound` (including a
    /// producer closed while the consumer was being created),
    /// `CapabilityMismatch`, or `Engine`
    pub async fn consume(
        &self,
        peer_id: &str,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> RoomResult<ConsumerParams> {
        let caps = {
            let state = self.state();
            let peer = Self::peer_in(&state, peer_id)?;
            if peer.transport(transport_id).is_none() {
                return Err(RoomError::TransportNotFound(transport_id.to_string()));
            }
            if !Self::producer_exists(&state, producer_id) {
                return Err(RoomError::ProducerNotFound(producer_id.to_string()));
            }
            peer.rtp_capabilities().cloned().unwrap_or(rtp_capabilities)
        };

        if !self.router.can_consume(producer_id, &caps) {
            return Err(RoomError::CapabilityMismatch(producer_id.to_string()));
        }

        let params = self
            .engine(self.router.consume(transport_id, producer_id, caps.clone()))
            .await?;

        let stale = {
            let mut state = self.state_mut();
            let producer_alive = Self::producer_exists(&state, producer_id);
            match state.peers.get_mut(peer_id) {
                Some(_) if !producer_alive => Some(RoomError::ProducerNotFound(producer_id.to_string())),
                Some(peer) if peer.transport(transport_id).is_some() => {
                    peer.set_rtp_capabilities(caps);
                    peer.add_consumer(ConsumerEntry {
                        id: params.id.clone(),
                        producer_id: producer_id.to_string(),
                        transport_id: transport_id.to_string(),
                        kind: params.kind,
                        paused: true,
                    });
                    None
                }
                Some(_) => Some(RoomError::TransportNotFound(transport_id.to_string())),
                None => Some(RoomError::PeerNotFound(peer_id.to_string())),
            }
        };
        if let Some(err) = stale {
            self.router.close_consumer(&params.id).await;
            return Err(err);
        }

        info!(
            "Peer {} consuming {} via consumer {} in room {}",
            peer_id, producer_id, params.id, self.id
        );
        Ok(params)
    }

    /// # Errors
    /// `PeerNotFound`, `ConsumerNotFound`, or `Engine`
    pub async fn resume_consumer(&self, peer_id: &str, consumer_id: &str) -> RoomResult<()> {
        {
            let state = self.state();
            let peer = Self::peer_in(&state, peer_id)?;
            if peer.consumer(consumer_id).is_none() {
                return Err(RoomError::ConsumerNotFound(consumer_id.to_string()));
            }
        }

        self.engine(self.router.resume_consumer(consumer_id)).await?;

        let mut state = self.state_mut();
        let peer = Self::peer_in_mut(&mut state, peer_id)?;
        if !peer.mark_consumer_resumed(consumer_id) {
            return Err(RoomError::ConsumerNotFound(consumer_id.to_string()));
        }

        debug!("Resumed consumer {} for peer {}", consumer_id, peer_id);
        Ok(())
    }

    /// Closes one of the peer's own producers and every consumer bound to it
    /// anywhere in the room.
    ///
    /// # Errors
    /// `PeerNotFound` or `ProducerNotFound`
    pub async fn close_producer(&self, peer_id: &str, producer_id: &str) -> RoomResult<()> {
        let orphaned = {
            let mut state = self.state_mut();
            let peer = Self::peer_in_mut(&mut state, peer_id)?;
            if peer.remove_producer(producer_id).is_none() {
                return Err(RoomError::ProducerNotFound(producer_id.to_string()));
            }
            Self::detach_consumers_of(&mut state.peers, &[producer_id.to_string()])
        };

        let released = orphaned.len();
        self.release_orphaned(orphaned).await;
        self.router.close_producer(producer_id).await;

        info!(
            "Closed producer {} of peer {} ({} consumers released)",
            producer_id, peer_id, released
        );
        Ok(())
    }

    /// Peer ids and names only
    pub fn snapshot(&self) -> RoomSnapshot {
        let state = self.state();
        Self::snapshot_of(&self.id, &state)
    }

    /// Marks the room closed if it has no peers. Called by the registry while
    /// it holds its own write lock.
    pub(crate) fn close_if_empty(&self) -> bool {
        let mut state = self.state_mut();
        if state.closed || !state.peers.is_empty() {
            return false;
        }
        state.closed = true;
        true
    }

    /// Tears down every peer, then the router
    pub(crate) async fn close(&self) {
        let peers: Vec<Peer> = {
            let mut state = self.state_mut();
            state.closed = true;
            state.peers.drain().map(|(_, p)| p).collect()
        };
        for mut peer in peers {
            peer.close(self.router.as_ref()).await;
        }
        self.router.close().await;
        info!("Closed room {} (router {})", self.id, self.router.id());
    }

    pub(crate) async fn release_router(&self) {
        self.router.close().await;
    }

    // --- Helpers ---

    fn ensure_peer(&self, peer_id: &str) -> RoomResult<()> {
        let state = self.state();
        Self::peer_in(&state, peer_id).map(|_| ())
    }

    fn peer_in<'a>(state: &'a RoomState, peer_id: &str) -> RoomResult<&'a Peer> {
        state
            .peers
            .get(peer_id)
            .ok_or_else(|| RoomError::PeerNotFound(peer_id.to_string()))
    }

    fn peer_in_mut<'a>(state: &'a mut RoomState, peer_id: &str) -> RoomResult<&'a mut Peer> {
        state
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| RoomError::PeerNotFound(peer_id.to_string()))
    }

    fn producer_exists(state: &RoomState, producer_id: &str) -> bool {
        state.peers.values().any(|p| p.producer(producer_id).is_some())
    }

    fn snapshot_of(id: &str, state: &RoomState) -> RoomSnapshot {
        let mut peers: Vec<_> = state.peers.values().map(Peer::summary).collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        RoomSnapshot {
            id: id.to_string(),
            peers,
        }
    }

    /// Detaches consumers bound to `producer_ids` from every peer and queues
    /// a `consumerClosed` push to each owner
    fn detach_consumers_of(
        peers: &mut HashMap<String, Peer>,
        producer_ids: &[String],
    ) -> Vec<OrphanedConsumer> {
        if producer_ids.is_empty() {
            return Vec::new();
        }

        let mut orphaned = Vec::new();
        for peer in peers.values_mut() {
            for consumer in peer.remove_consumers_of(producer_ids) {
                peer.notify(&ServerMessage::ConsumerClosed {
                    consumer_id: consumer.id.clone(),
                });
                orphaned.push(OrphanedConsumer {
                    peer_id: peer.id().to_string(),
                    consumer_id: consumer.id,
                });
            }
        }
        orphaned
    }

    async fn release_orphaned(&self, orphaned: Vec<OrphanedConsumer>) {
        for consumer in orphaned {
            self.router.close_consumer(&consumer.consumer_id).await;
            debug!(
                "Released consumer {} of peer {} after its producer closed",
                consumer.consumer_id, consumer.peer_id
            );
        }
    }

    /// Serializes once and queues the message for every peer except one
    fn broadcast_except(state: &RoomState, exclude_peer_id: &str, msg: &ServerMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!("Failed to serialize broadcast: {}", e);
                return;
            }
        };
        for peer in state.peers.values().filter(|p| p.id() != exclude_peer_id) {
            peer.send_raw(json.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::{RouterConfig, WebRtcTransportConfig, WorkerConfig};
    use crate::media::loopback::LoopbackEngine;
    use crate::media::MediaEngine;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::{mpsc, Notify};

    struct Fixture {
        engine: LoopbackEngine,
        room: Room,
    }

    async fn fixture() -> Fixture {
        fixture_with(|router| router).await
    }

    async fn fixture_with(
        wrap: impl FnOnce(Arc<dyn RoutingContext>) -> Arc<dyn RoutingContext>,
    ) -> Fixture {
        let engine = LoopbackEngine::new();
        let (death_tx, _death_rx) = mpsc::unbounded_channel();
        let worker = engine
            .spawn_worker(0, &WorkerConfig::default(), death_tx)
            .await
            .unwrap();
        let router = worker.create_router(&RouterConfig::default()).await.unwrap();
        let room = Room::new(
            "r1".into(),
            0,
            worker.pid(),
            wrap(router),
            Arc::new(MediaConfig::default()),
        );
        Fixture { engine, room }
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Call {
        Transport,
        Produce,
        Consume,
    }

    /// Router that, once armed, completes one `call` on the engine and then
    /// parks before returning until the test releases it
    struct HeldRouter {
        inner: Arc<dyn RoutingContext>,
        call: Call,
        armed: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    impl HeldRouter {
        fn arm(&self) {
            self.armed.store(true, Ordering::SeqCst);
        }

        async fn hold(&self, call: Call) {
            if call == self.call && self.armed.swap(false, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
        }

        /// Runs `during` while the held call is parked, then lets it finish
        async fn while_held<F: Future<Output = ()>>(&self, during: F) {
            self.entered.notified().await;
            during.await;
            self.release.notify_one();
        }
    }

    #[async_trait]
    impl RoutingContext for HeldRouter {
        fn id(&self) -> &str {
            self.inner.id()
        }

        fn rtp_capabilities(&self) -> Value {
            self.inner.rtp_capabilities()
        }

        fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
            self.inner.can_consume(producer_id, rtp_capabilities)
        }

        async fn create_webrtc_transport(
            &self,
            config: &WebRtcTransportConfig,
        ) -> crate::media::MediaResult<TransportParams> {
            let params = self.inner.create_webrtc_transport(config).await?;
            self.hold(Call::Transport).await;
            Ok(params)
        }

        async fn connect_transport(
            &self,
            transport_id: &str,
            dtls_parameters: Value,
        ) -> crate::media::MediaResult<()> {
            self.inner.connect_transport(transport_id, dtls_parameters).await
        }

        async fn produce(
            &self,
            transport_id: &str,
            kind: MediaKind,
            rtp_parameters: Value,
        ) -> crate::media::MediaResult<String> {
            let producer_id = self.inner.produce(transport_id, kind, rtp_parameters).await?;
            self.hold(Call::Produce).await;
            Ok(producer_id)
        }

        async fn consume(
            &self,
            transport_id: &str,
            producer_id: &str,
            rtp_capabilities: Value,
        ) -> crate::media::MediaResult<ConsumerParams> {
            let params = self.inner.consume(transport_id, producer_id, rtp_capabilities).await?;
            self.hold(Call::Consume).await;
            Ok(params)
        }

        async fn resume_consumer(&self, consumer_id: &str) -> crate::media::MediaResult<()> {
            self.inner.resume_consumer(consumer_id).await
        }

        async fn close_producer(&self, producer_id: &str) {
            self.inner.close_producer(producer_id).await;
        }

        async fn close_consumer(&self, consumer_id: &str) {
            self.inner.close_consumer(consumer_id).await;
        }

        async fn close_transport(&self, transport_id: &str) {
            self.inner.close_transport(transport_id).await;
        }

        async fn close(&self) {
            self.inner.close().await;
        }
    }

    async fn held_fixture(call: Call) -> (Fixture, Arc<HeldRouter>) {
        let mut held = None;
        let f = fixture_with(|inner| {
            let router = Arc::new(HeldRouter {
                inner,
                call,
                armed: AtomicBool::new(false),
                entered: Notify::new(),
                release: Notify::new(),
            });
            held = Some(router.clone());
            router as Arc<dyn RoutingContext>
        })
        .await;
        (f, held.unwrap())
    }

    fn join(room: &Room, id: &str) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(32);
        room.add_peer(Peer::new(id.into(), format!("name-{id}"), tx)).unwrap();
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    fn caps() -> Value {
        json!({ "codecs": [
            { "kind": "audio", "mimeType": "audio/opus" },
            { "kind": "video", "mimeType": "video/VP8" },
        ] })
    }

    async fn connected_transport(room: &Room, peer_id: &str) -> String {
        let transport = room.create_webrtc_transport(peer_id).await.unwrap();
        room.connect_peer_transport(peer_id, &transport.id, json!({ "role": "client", "fingerprints": [] }))
            .await
            .unwrap();
        transport.id
    }

    #[tokio::test]
    async fn test_produce_notifies_other_peers_only() {
        let f = fixture().await;
        let mut a_rx = join(&f.room, "a");
        let mut b_rx = join(&f.room, "b");

        let t = connected_transport(&f.room, "a").await;
        let producer_id = f.room.produce("a", &t, MediaKind::Video, json!({})).await.unwrap();

        assert!(drain(&mut a_rx).is_empty());
        let pushes = drain(&mut b_rx);
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0]["type"], "newProducers");
        assert_eq!(pushes[0]["producers"][0]["producerId"], producer_id.as_str());
        assert_eq!(pushes[0]["producers"][0]["kind"], "video");
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let f = fixture().await;
        let _rx = join(&f.room, "a");
        let transport = f.room.create_webrtc_transport("a").await.unwrap();

        let result = f.room.produce("a", &transport.id, MediaKind::Audio, json!({})).await;
        assert!(matches!(result, Err(RoomError::TransportNotConnected(_))));

        let result = f.room.produce("a", "nope", MediaKind::Audio, json!({})).await;
        assert!(matches!(result, Err(RoomError::TransportNotFound(_))));
    }

    #[tokio::test]
    async fn test_late_joiner_sees_existing_producers() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        for peer in ["a", "b"] {
            let t = connected_transport(&f.room, peer).await;
            f.room.produce(peer, &t, MediaKind::Audio, json!({})).await.unwrap();
            f.room.produce(peer, &t, MediaKind::Video, json!({})).await.unwrap();
        }

        let _c = join(&f.room, "c");
        assert_eq!(f.room.producer_list_for_peer("c").len(), 4);
        assert_eq!(f.room.producer_list_for_peer("a").len(), 2);
    }

    #[tokio::test]
    async fn test_consume_then_resume() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        let ta = connected_transport(&f.room, "a").await;
        let producer_id = f.room.produce("a", &ta, MediaKind::Video, json!({})).await.unwrap();

        let tb = f.room.create_webrtc_transport("b").await.unwrap().id;
        let consumer = f.room.consume("b", &tb, &producer_id, caps()).await.unwrap();
        assert!(consumer.paused);
        assert_eq!(consumer.producer_id, producer_id);
        assert_eq!(f.engine.live_objects().paused_consumers, 1);

        f.room.resume_consumer("b", &consumer.id).await.unwrap();
        assert_eq!(f.engine.live_objects().paused_consumers, 0);

        let state = f.room.state();
        let entry = state.peers["b"].consumer(&consumer.id).unwrap();
        assert!(!entry.paused);
    }

    #[tokio::test]
    async fn test_consume_capability_mismatch() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        let ta = connected_transport(&f.room, "a").await;
        let producer_id = f.room.produce("a", &ta, MediaKind::Video, json!({})).await.unwrap();
        let tb = f.room.create_webrtc_transport("b").await.unwrap().id;

        let audio_only = json!({ "codecs": [{ "kind": "audio", "mimeType": "audio/opus" }] });
        let result = f.room.consume("b", &tb, &producer_id, audio_only).await;
        assert!(matches!(result, Err(RoomError::CapabilityMismatch(_))));
        assert_eq!(f.engine.live_objects().consumers, 0);
    }

    #[tokio::test]
    async fn test_close_producer_releases_dependent_consumers() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let ta = connected_transport(&f.room, "a").await;
        let producer_id = f.room.produce("a", &ta, MediaKind::Audio, json!({})).await.unwrap();

        let mut receivers = Vec::new();
        for peer in ["b", "c", "d"] {
            let mut rx = join(&f.room, peer);
            let t = f.room.create_webrtc_transport(peer).await.unwrap().id;
            f.room.consume(peer, &t, &producer_id, caps()).await.unwrap();
            drain(&mut rx);
            receivers.push((peer, t, rx));
        }
        assert_eq!(f.engine.live_objects().consumers, 3);

        f.room.close_producer("a", &producer_id).await.unwrap();
        assert_eq!(f.engine.live_objects().consumers, 0);
        assert_eq!(f.engine.live_objects().producers, 0);

        for (peer, t, rx) in receivers.iter_mut() {
            let pushes = drain(rx);
            assert_eq!(pushes.len(), 1);
            assert_eq!(pushes[0]["type"], "consumerClosed");
            assert_eq!(f.room.state().peers[*peer].consumers().count(), 0);

            let again = f.room.consume(peer, t, &producer_id, caps()).await;
            assert!(matches!(again, Err(RoomError::ProducerNotFound(_))));
        }
    }

    #[tokio::test]
    async fn test_close_producer_of_someone_else_fails() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        let ta = connected_transport(&f.room, "a").await;
        let producer_id = f.room.produce("a", &ta, MediaKind::Audio, json!({})).await.unwrap();

        let result = f.room.close_producer("b", &producer_id).await;
        assert!(matches!(result, Err(RoomError::ProducerNotFound(_))));
        assert_eq!(f.engine.live_objects().producers, 1);
    }

    #[tokio::test]
    async fn test_remove_peer_is_idempotent_and_cascades() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let mut b_rx = join(&f.room, "b");
        let ta = connected_transport(&f.room, "a").await;
        let p1 = f.room.produce("a", &ta, MediaKind::Video, json!({})).await.unwrap();
        let tb = f.room.create_webrtc_transport("b").await.unwrap().id;
        let c1 = f.room.consume("b", &tb, &p1, caps()).await.unwrap().id;
        drain(&mut b_rx);

        f.room.remove_peer("a").await.unwrap();
        assert!(f.room.state().peers["b"].consumer(&c1).is_none());
        let pushes = drain(&mut b_rx);
        assert_eq!(pushes, vec![json!({ "type": "consumerClosed", "consumerId": c1 })]);

        let live = f.engine.live_objects();
        assert_eq!(live.producers, 0);
        assert_eq!(live.consumers, 0);
        assert_eq!(live.transports, 1);

        let again = f.room.remove_peer("a").await;
        assert!(matches!(again, Err(RoomError::PeerNotFound(_))));
        assert_eq!(f.engine.live_objects().transports, 1);
    }

    #[tokio::test]
    async fn test_duplicate_peer_rejected() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let (tx, _rx) = mpsc::channel(1);
        let result = f.room.add_peer(Peer::new("a".into(), "again".into(), tx));
        assert!(matches!(result, Err(RoomError::PeerAlreadyJoined(_))));
        assert_eq!(f.room.peer_count(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_has_ids_and_names_only() {
        let f = fixture().await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");

        let snapshot = serde_json::to_value(f.room.snapshot()).unwrap();
        assert_eq!(
            snapshot,
            json!({
                "id": "r1",
                "peers": [{ "id": "a", "name": "name-a" }, { "id": "b", "name": "name-b" }],
            })
        );
    }

    #[tokio::test]
    async fn test_closed_room_rejects_join() {
        let f = fixture().await;
        assert!(f.room.close_if_empty());
        let (tx, _rx) = mpsc::channel(1);
        let result = f.room.add_peer(Peer::new("a".into(), "late".into(), tx));
        assert!(matches!(result, Err(RoomError::RoomNotFound(_))));
    }

    #[tokio::test]
    async fn test_transport_for_missing_peer() {
        let f = fixture().await;
        let result = f.room.create_webrtc_transport("ghost").await;
        assert!(matches!(result, Err(RoomError::PeerNotFound(_))));
        assert_eq!(f.engine.live_objects().transports, 0);
    }

    #[tokio::test]
    async fn test_transport_released_when_peer_leaves_mid_create() {
        let (f, held) = held_fixture(Call::Transport).await;
        let _a = join(&f.room, "a");
        held.arm();

        let (result, _) = tokio::join!(
            f.room.create_webrtc_transport("a"),
            held.while_held(async {
                f.room.remove_peer("a").await.unwrap();
            })
        );

        assert!(matches!(result, Err(RoomError::PeerNotFound(_))));
        assert_eq!(f.engine.live_objects().transports, 0);
    }

    #[tokio::test]
    async fn test_producer_released_when_peer_leaves_mid_produce() {
        let (f, held) = held_fixture(Call::Produce).await;
        let _a = join(&f.room, "a");
        let mut b_rx = join(&f.room, "b");
        let ta = connected_transport(&f.room, "a").await;
        held.arm();

        let (result, _) = tokio::join!(
            f.room.produce("a", &ta, MediaKind::Video, json!({})),
            held.while_held(async {
                f.room.remove_peer("a").await.unwrap();
            })
        );

        assert!(matches!(result, Err(RoomError::PeerNotFound(_))));
        let live = f.engine.live_objects();
        assert_eq!(live.producers, 0);
        assert_eq!(live.transports, 0);
        assert!(drain(&mut b_rx).is_empty());
    }

    #[tokio::test]
    async fn test_consumer_released_when_producer_owner_leaves_mid_consume() {
        let (f, held) = held_fixture(Call::Consume).await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        let ta = connected_transport(&f.room, "a").await;
        let producer_id = f.room.produce("a", &ta, MediaKind::Video, json!({})).await.unwrap();
        let tb = f.room.create_webrtc_transport("b").await.unwrap().id;
        held.arm();

        let (result, _) = tokio::join!(
            f.room.consume("b", &tb, &producer_id, caps()),
            held.while_held(async {
                f.room.remove_peer("a").await.unwrap();
            })
        );

        assert!(matches!(result, Err(RoomError::ProducerNotFound(_))));
        let live = f.engine.live_objects();
        assert_eq!(live.consumers, 0);
        assert_eq!(live.producers, 0);
        assert_eq!(f.room.state().peers["b"].consumers().count(), 0);
    }

    #[tokio::test]
    async fn test_consumer_released_when_consuming_peer_leaves_mid_consume() {
        let (f, held) = held_fixture(Call::Consume).await;
        let _a = join(&f.room, "a");
        let _b = join(&f.room, "b");
        let ta = connected_transport(&f.room, "a").await;
        let producer_id = f.room.produce("a", &ta, MediaKind::Audio, json!({})).await.unwrap();
        let tb = f.room.create_webrtc_transport("b").await.unwrap().id;
        held.arm();

        let (result, _) = tokio::join!(
            f.room.consume("b", &tb, &producer_id, caps()),
            held.while_held(async {
                f.room.remove_peer("b").await.unwrap();
            })
        );

        assert!(matches!(result, Err(RoomError::PeerNotFound(_))));
        let live = f.engine.live_objects();
        assert_eq!(live.consumers, 0);
        assert_eq!(live.producers, 1);
    }
}
