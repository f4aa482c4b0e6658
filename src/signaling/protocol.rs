#![forbid(unsafe_code)]

// Signaling protocol message definitions

use crate::media::types::{ConsumerParams, MediaKind, TransportParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages sent from client to server.
///
/// Each frame may also carry a numeric `requestId`; the reply echoes it.
/// snake_case spellings used by older clients are accepted as aliases.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Create a room; does not join it
    #[serde(rename_all = "camelCase")]
    CreateRoom {
        #[serde(alias = "room_id")]
        room_id: String,
    },

    /// Join an existing room
    #[serde(rename_all = "camelCase")]
    Join {
        #[serde(alias = "room_id")]
        room_id: String,
        name: String,
    },

    GetRouterRtpCapabilities,

    CreateWebRtcTransport,

    /// Finish DTLS negotiation on a transport
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        #[serde(alias = "transport_id")]
        transport_id: String,
        #[serde(alias = "dtls_parameters", alias = "remoteParams")]
        dtls_parameters: Value,
    },

    /// Publish a track
    #[serde(rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        #[serde(alias = "rtp_parameters", alias = "mediaParams")]
        rtp_parameters: Value,
        #[serde(alias = "producerTransportId", alias = "producer_transport_id")]
        transport_id: String,
    },

    /// Subscribe to a remote producer
    #[serde(rename_all = "camelCase")]
    Consume {
        #[serde(alias = "consumerTransportId", alias = "consumer_transport_id")]
        transport_id: String,
        #[serde(alias = "producer_id")]
        producer_id: String,
        #[serde(alias = "rtp_capabilities", alias = "remoteCapabilities")]
        rtp_capabilities: Value,
    },

    #[serde(rename_all = "camelCase")]
    Resume {
        #[serde(alias = "consumer_id")]
        consumer_id: String,
    },

    /// Ask for a `newProducers` push listing everything already published
    GetProducers,

    GetMyRoomInfo,

    /// The client closed one of its own producers
    #[serde(rename_all = "camelCase")]
    ProducerClosed {
        #[serde(alias = "producer_id")]
        producer_id: String,
    },

    ExitRoom,
}

impl ClientMessage {
    /// Wire name, for logs
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::CreateRoom { .. } => "createRoom",
            ClientMessage::Join { .. } => "join",
            ClientMessage::GetRouterRtpCapabilities => "getRouterRtpCapabilities",
            ClientMessage::CreateWebRtcTransport => "createWebRtcTransport",
            ClientMessage::ConnectTransport { .. } => "connectTransport",
            ClientMessage::Produce { .. } => "produce",
            ClientMessage::Consume { .. } => "consume",
            ClientMessage::Resume { .. } => "resume",
            ClientMessage::GetProducers => "getProducers",
            ClientMessage::GetMyRoomInfo => "getMyRoomInfo",
            ClientMessage::ProducerClosed { .. } => "producerClosed",
            ClientMessage::ExitRoom => "exitRoom",
        }
    }
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Successful reply to a request
    #[serde(rename_all = "camelCase")]
    Response {
        request_id: Option<u64>,
        data: ResponseData,
    },

    /// Failed request
    #[serde(rename_all = "camelCase")]
    Error {
        request_id: Option<u64>,
        message: String,
    },

    /// Producers the receiving peer may want to consume
    NewProducers { producers: Vec<ProducerDescriptor> },

    /// A consumer was released because its producer went away
    #[serde(rename_all = "camelCase")]
    ConsumerClosed { consumer_id: String },
}

/// Success payload of a request, shaped per request type
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ResponseData {
    /// createRoom, connectTransport, exitRoom
    Text(String),
    Room(RoomSnapshot),
    RtpCapabilities(Value),
    Transport(TransportParams),
    ProducerCreated { producer_id: String },
    Consumer(ConsumerParams),
    /// resume
    Ack,
}

/// Public peer information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSummary {
    pub id: String,
    pub name: String,
}

/// Room summary safe to hand to clients: no engine handles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSnapshot {
    pub id: String,
    pub peers: Vec<PeerSummary>,
}

/// Identifies one consumable producer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDescriptor {
    pub producer_id: String,
    pub kind: MediaKind,
}
