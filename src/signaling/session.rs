#![forbid(unsafe_code)]

// Per-connection signaling session: join state and request dispatch

use super::protocol::{ClientMessage, ResponseData, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::room::{Peer, Room, RoomError, RoomRegistry};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Protocol-level failures. Room failures pass through with their own text.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("not in a room")]
    NotInRoom,

    #[error("not currently in a room")]
    NotCurrentlyInRoom,

    #[error("already in a room")]
    AlreadyInRoom,

    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Room(#[from] RoomError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Unjoined,
    Joined { room_id: String },
    /// Terminal; the connection is gone
    Left,
}

/// Dispatches one connection's requests against the registry.
///
/// Requests are handled one at a time in arrival order. The peer id is fixed
/// for the life of the connection.
pub struct Session {
    peer_id: String,
    registry: Arc<RoomRegistry>,
    sender: mpsc::Sender<Arc<String>>,
    metrics: ServerMetrics,
    state: SessionState,
}

impl Session {
    pub fn new(
        peer_id: String,
        registry: Arc<RoomRegistry>,
        sender: mpsc::Sender<Arc<String>>,
        metrics: ServerMetrics,
    ) -> Self {
        Self {
            peer_id,
            registry,
            sender,
            metrics,
            state: SessionState::Unjoined,
        }
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Handles one request. `Ok(None)` means the request gets no reply.
    ///
    /// # Errors
    /// Any failure is meant to be reported to the client and never ends the
    /// connection
    pub async fn handle(&mut self, msg: ClientMessage) -> Result<Option<ResponseData>, SessionError> {
        if self.state == SessionState::Left {
            return Err(SessionError::Closed);
        }

        match msg {
            ClientMessage::CreateRoom { room_id } => {
                self.registry.create_room(&room_id).await?;
                Ok(Some(ResponseData::Text(room_id)))
            }

            ClientMessage::Join { room_id, name } => self.join(room_id, name).map(Some),

            ClientMessage::GetRouterRtpCapabilities => {
                let room = self.current_room()?;
                Ok(Some(ResponseData::RtpCapabilities(room.rtp_capabilities())))
            }

            ClientMessage::CreateWebRtcTransport => {
                let room = self.current_room()?;
                let params = room.create_webrtc_transport(&self.peer_id).await?;
                self.metrics.inc_transports_created();
                Ok(Some(ResponseData::Transport(params)))
            }

            ClientMessage::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let room = self.current_room()?;
                room.connect_peer_transport(&self.peer_id, &transport_id, dtls_parameters)
                    .await?;
                Ok(Some(ResponseData::Text("success".to_string())))
            }

            ClientMessage::Produce {
                kind,
                rtp_parameters,
                transport_id,
            } => {
                let room = self.current_room()?;
                let producer_id = room
                    .produce(&self.peer_id, &transport_id, kind, rtp_parameters)
                    .await?;
                self.metrics.inc_producers_created();
                Ok(Some(ResponseData::ProducerCreated { producer_id }))
            }

            ClientMessage::Consume {
                transport_id,
                producer_id,
                rtp_capabilities,
            } => {
                let room = self.current_room()?;
                let params = room
                    .consume(&self.peer_id, &transport_id, &producer_id, rtp_capabilities)
                    .await?;
                self.metrics.inc_consumers_created();
                Ok(Some(ResponseData::Consumer(params)))
            }

            ClientMessage::Resume { consumer_id } => {
                let room = self.current_room()?;
                room.resume_consumer(&self.peer_id, &consumer_id).await?;
                Ok(Some(ResponseData::Ack))
            }

            ClientMessage::GetProducers => {
                let room = self.current_room()?;
                let producers = room.producer_list_for_peer(&self.peer_id);
                debug!("Sending {} existing producers to {}", producers.len(), self.peer_id);
                self.push(&ServerMessage::NewProducers { producers });
                Ok(None)
            }

            ClientMessage::GetMyRoomInfo => {
                let room = self.current_room()?;
                Ok(Some(ResponseData::Room(room.snapshot())))
            }

            ClientMessage::ProducerClosed { producer_id } => {
                let closed = match self.current_room() {
                    Ok(room) => room
                        .close_producer(&self.peer_id, &producer_id)
                        .await
                        .map_err(SessionError::from),
                    Err(e) => Err(e),
                };
                if let Err(e) = closed {
                    warn!("producerClosed from {} ignored: {}", self.peer_id, e);
                }
                Ok(None)
            }

            ClientMessage::ExitRoom => {
                let room_live = match &self.state {
                    SessionState::Joined { room_id } => self.registry.contains(room_id),
                    _ => false,
                };
                if !room_live {
                    // A room closed by shutdown leaves nothing to exit
                    self.state = SessionState::Unjoined;
                    return Err(SessionError::NotCurrentlyInRoom);
                }
                self.leave().await;
                self.state = SessionState::Unjoined;
                Ok(Some(ResponseData::Text("successfully exited room".to_string())))
            }
        }
    }

    /// Connection lost. Tears the peer down right away; the session accepts
    /// nothing afterwards.
    pub async fn disconnect(&mut self) {
        if self.state == SessionState::Left {
            return;
        }
        self.leave().await;
        self.state = SessionState::Left;
    }

    fn join(&mut self, room_id: String, name: String) -> Result<ResponseData, SessionError> {
        if matches!(self.state, SessionState::Joined { .. }) {
            return Err(SessionError::AlreadyInRoom);
        }

        let room = self.registry.require(&room_id)?;
        let peer = Peer::new(self.peer_id.clone(), name, self.sender.clone());
        let snapshot = room.add_peer(peer)?;

        self.metrics.inc_joins();
        self.state = SessionState::Joined { room_id };
        Ok(ResponseData::Room(snapshot))
    }

    /// Removes this peer from its room, then drops the room if it is now empty
    async fn leave(&self) {
        let SessionState::Joined { room_id } = &self.state else {
            return;
        };
        let room_id = room_id.clone();

        if let Some(room) = self.registry.get(&room_id) {
            match room.remove_peer(&self.peer_id).await {
                Ok(()) => self.metrics.inc_leaves(),
                Err(e) if e.is_not_found() => {
                    debug!("Peer {} already gone from {}: {}", self.peer_id, room_id, e)
                }
                Err(e) => warn!("Removing peer {} from {} failed: {}", self.peer_id, room_id, e),
            }
        }
        if self.registry.remove_if_empty(&room_id).await {
            info!("Room {} closed after its last peer left", room_id);
        }
    }

    /// The room this session is joined to, re-resolved on every request
    fn current_room(&self) -> Result<Arc<Room>, SessionError> {
        match &self.state {
            SessionState::Joined { room_id } => Ok(self.registry.require(room_id)?),
            _ => Err(SessionError::NotInRoom),
        }
    }

    fn push(&self, msg: &ServerMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!("Failed to serialize push for {}: {}", self.peer_id, e);
                return;
            }
        };
        if self.sender.try_send(json).is_err() {
            warn!("Dropped push for {}: channel full or closed", self.peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::config::{MediaConfig, WorkerConfig};
    use crate::media::loopback::LoopbackEngine;
    use crate::media::types::MediaKind;
    use crate::media::WorkerPool;
    use serde_json::{json, Value};

    struct Client {
        session: Session,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl Client {
        async fn send(&mut self, msg: Value) -> Result<Option<Value>, String> {
            let msg: ClientMessage = serde_json::from_value(msg).unwrap();
            match self.session.handle(msg).await {
                Ok(data) => Ok(data.map(|d| serde_json::to_value(d).unwrap())),
                Err(e) => Err(e.to_string()),
            }
        }

        async fn ok(&mut self, msg: Value) -> Value {
            self.send(msg).await.unwrap().unwrap_or(Value::Null)
        }

        fn pushes(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(json) = self.rx.try_recv() {
                out.push(serde_json::from_str(&json).unwrap());
            }
            out
        }
    }

    async fn setup() -> (Arc<LoopbackEngine>, Arc<RoomRegistry>) {
        let engine = Arc::new(LoopbackEngine::new());
        let config = MediaConfig {
            worker_config: WorkerConfig {
                num_workers: 2,
                ..WorkerConfig::default()
            },
            ..MediaConfig::default()
        };
        let pool = WorkerPool::start(engine.clone(), &config.worker_config)
            .await
            .unwrap();
        let registry = RoomRegistry::new(Arc::new(pool), config, ServerMetrics::new());
        (engine, Arc::new(registry))
    }

    fn client(registry: &Arc<RoomRegistry>, peer_id: &str) -> Client {
        let (tx, rx) = mpsc::channel(32);
        Client {
            session: Session::new(peer_id.into(), registry.clone(), tx, ServerMetrics::new()),
            rx,
        }
    }

    fn caps() -> Value {
        json!({ "codecs": [{ "kind": "video", "mimeType": "video/VP8" }] })
    }

    async fn send_transport(c: &mut Client) -> String {
        let t = c.ok(json!({ "type": "createWebRtcTransport" })).await;
        let id = t["id"].as_str().unwrap().to_string();
        c.ok(json!({
            "type": "connectTransport",
            "transportId": id,
            "dtlsParameters": { "role": "client" },
        }))
        .await;
        id
    }

    #[tokio::test]
    async fn test_join_missing_room() {
        let (_engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");

        let result = alice
            .send(json!({ "type": "join", "roomId": "missingRoom", "name": "Alice" }))
            .await;
        assert_eq!(result, Err("Room does not exist".to_string()));
        assert_eq!(alice.session.state(), &SessionState::Unjoined);
        assert_eq!(registry.room_count(), 0);
        assert_eq!(registry.peer_count(), 0);
    }

    #[tokio::test]
    async fn test_requests_outside_a_room() {
        let (_engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");

        let produce = alice
            .send(json!({
                "type": "produce",
                "kind": "audio",
                "rtpParameters": {},
                "transportId": "t1",
            }))
            .await;
        assert_eq!(produce, Err("not in a room".to_string()));

        let exit = alice.send(json!({ "type": "exitRoom" })).await;
        assert_eq!(exit, Err("not currently in a room".to_string()));
    }

    #[tokio::test]
    async fn test_create_room_does_not_join() {
        let (_engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");

        let created = alice.ok(json!({ "type": "createRoom", "roomId": "r1" })).await;
        assert_eq!(created, json!("r1"));
        assert_eq!(alice.session.state(), &SessionState::Unjoined);

        let again = alice.send(json!({ "type": "createRoom", "room_id": "r1" })).await;
        assert_eq!(again, Err("already exists".to_string()));
    }

    #[tokio::test]
    async fn test_join_twice_rejected() {
        let (_engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");
        alice.ok(json!({ "type": "createRoom", "roomId": "r1" })).await;
        alice.ok(json!({ "type": "join", "roomId": "r1", "name": "Alice" })).await;

        let again = alice
            .send(json!({ "type": "join", "roomId": "r1", "name": "Alice" }))
            .await;
        assert_eq!(again, Err("already in a room".to_string()));
    }

    #[tokio::test]
    async fn test_produce_consume_resume_flow() {
        let (engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");
        let mut bob = client(&registry, "bob");

        alice.ok(json!({ "type": "createRoom", "roomId": "r1" })).await;
        let snapshot = alice.ok(json!({ "type": "join", "roomId": "r1", "name": "Alice" })).await;
        assert_eq!(snapshot["peers"][0]["name"], "Alice");
        bob.ok(json!({ "type": "join", "roomId": "r1", "name": "Bob" })).await;

        let caps_reply = alice.ok(json!({ "type": "getRouterRtpCapabilities" })).await;
        assert!(caps_reply["codecs"].is_array());

        let t = send_transport(&mut alice).await;
        let produced = alice
            .ok(json!({
                "type": "produce",
                "kind": "video",
                "rtpParameters": { "codecs": [] },
                "transportId": t,
            }))
            .await;
        let producer_id = produced["producer_id"].as_str().unwrap().to_string();

        assert!(alice.pushes().is_empty());
        let pushes = bob.pushes();
        assert_eq!(
            pushes,
            vec![json!({
                "type": "newProducers",
                "producers": [{ "producerId": producer_id, "kind": "video" }],
            })]
        );

        let bt = bob.ok(json!({ "type": "createWebRtcTransport" })).await;
        let consumer = bob
            .ok(json!({
                "type": "consume",
                "transportId": bt["id"],
                "producerId": producer_id,
                "rtpCapabilities": caps(),
            }))
            .await;
        assert_eq!(consumer["paused"], true);
        assert_eq!(consumer["kind"], "video");

        let resumed = bob
            .ok(json!({ "type": "resume", "consumerId": consumer["id"] }))
            .await;
        assert_eq!(resumed, Value::Null);
        assert_eq!(engine.live_objects().paused_consumers, 0);
    }

    #[tokio::test]
    async fn test_get_producers_pushes_to_caller_only() {
        let (_engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");
        let mut bob = client(&registry, "bob");
        alice.ok(json!({ "type": "createRoom", "roomId": "r1" })).await;
        alice.ok(json!({ "type": "join", "roomId": "r1", "name": "Alice" })).await;

        let t = send_transport(&mut alice).await;
        for kind in [MediaKind::Audio, MediaKind::Video] {
            alice
                .ok(json!({ "type": "produce", "kind": kind, "rtpParameters": {}, "transportId": t }))
                .await;
        }

        bob.ok(json!({ "type": "join", "roomId": "r1", "name": "Bob" })).await;
        let reply = bob.send(json!({ "type": "getProducers" })).await;
        assert_eq!(reply, Ok(None));

        let pushes = bob.pushes();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0]["producers"].as_array().map(Vec::len), Some(2));
        assert!(alice.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_and_removes_room() {
        let (engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");
        let mut bob = client(&registry, "bob");
        alice.ok(json!({ "type": "createRoom", "roomId": "r1" })).await;
        alice.ok(json!({ "type": "join", "roomId": "r1", "name": "Alice" })).await;
        bob.ok(json!({ "type": "join", "roomId": "r1", "name": "Bob" })).await;

        let t = send_transport(&mut alice).await;
        let produced = alice
            .ok(json!({ "type": "produce", "kind": "video", "rtpParameters": {}, "transportId": t }))
            .await;
        let bt = bob.ok(json!({ "type": "createWebRtcTransport" })).await;
        let consumer = bob
            .ok(json!({
                "type": "consume",
                "transportId": bt["id"],
                "producerId": produced["producer_id"],
                "rtpCapabilities": caps(),
            }))
            .await;
        bob.pushes();

        alice.session.disconnect().await;
        assert_eq!(alice.session.state(), &SessionState::Left);
        assert_eq!(
            bob.pushes(),
            vec![json!({ "type": "consumerClosed", "consumerId": consumer["id"] })]
        );
        let info = bob.ok(json!({ "type": "getMyRoomInfo" })).await;
        assert_eq!(info["peers"], json!([{ "id": "bob", "name": "Bob" }]));

        let after = alice.send(json!({ "type": "getMyRoomInfo" })).await;
        assert_eq!(after, Err("connection closed".to_string()));

        let exited = bob.ok(json!({ "type": "exitRoom" })).await;
        assert_eq!(exited, json!("successfully exited room"));
        assert_eq!(bob.session.state(), &SessionState::Unjoined);
        assert!(registry.get("r1").is_none());
        assert_eq!(engine.live_objects().routers, 0);
    }

    #[tokio::test]
    async fn test_producer_closed_is_fire_and_forget() {
        let (engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");
        alice.ok(json!({ "type": "createRoom", "roomId": "r1" })).await;
        alice.ok(json!({ "type": "join", "roomId": "r1", "name": "Alice" })).await;
        let t = send_transport(&mut alice).await;
        let produced = alice
            .ok(json!({ "type": "produce", "kind": "audio", "rtpParameters": {}, "transportId": t }))
            .await;

        let reply = alice
            .send(json!({ "type": "producerClosed", "producer_id": produced["producer_id"] }))
            .await;
        assert_eq!(reply, Ok(None));
        assert_eq!(engine.live_objects().producers, 0);

        let unknown = alice
            .send(json!({ "type": "producerClosed", "producerId": "nope" }))
            .await;
        assert_eq!(unknown, Ok(None));
    }

    #[tokio::test]
    async fn test_producer_closed_outside_room_gets_no_reply() {
        let (_engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");

        let reply = alice
            .send(json!({ "type": "producerClosed", "producer_id": "p1" }))
            .await;
        assert_eq!(reply, Ok(None));
        assert!(alice.pushes().is_empty());
    }

    #[tokio::test]
    async fn test_exit_after_room_shut_down() {
        let (_engine, registry) = setup().await;
        let mut alice = client(&registry, "alice");
        alice.ok(json!({ "type": "createRoom", "roomId": "r1" })).await;
        alice.ok(json!({ "type": "join", "roomId": "r1", "name": "Alice" })).await;

        registry.shutdown().await;

        let exit = alice.send(json!({ "type": "exitRoom" })).await;
        assert_eq!(exit, Err("not currently in a room".to_string()));
        assert_eq!(alice.session.state(), &SessionState::Unjoined);
    }
}
