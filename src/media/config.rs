#![forbid(unsafe_code)]

// Configuration for media workers, routers, and transports

use crate::media::types::MediaKind;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::time::Duration;

/// Main media configuration
#[derive(Debug, Clone)]
pub struct MediaConfig {
    pub worker_config: WorkerConfig,
    pub router_config: RouterConfig,
    pub webrtc_transport_config: WebRtcTransportConfig,
    /// Upper bound on any single media engine call
    pub request_timeout: Duration,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            worker_config: WorkerConfig::default(),
            router_config: RouterConfig::default(),
            webrtc_transport_config: WebRtcTransportConfig::default(),
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// Which media engine backs the workers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Mediasoup,
    Loopback,
}

impl Default for EngineKind {
    fn default() -> Self {
        if cfg!(feature = "mediasoup") {
            EngineKind::Mediasoup
        } else {
            EngineKind::Loopback
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mediasoup" => Ok(EngineKind::Mediasoup),
            "loopback" => Ok(EngineKind::Loopback),
            other => Err(format!("unknown media engine '{other}' (expected mediasoup or loopback)")),
        }
    }
}

/// Worker log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerLogLevel {
    Debug,
    Warn,
    Error,
    None,
}

impl FromStr for WorkerLogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(WorkerLogLevel::Debug),
            "warn" => Ok(WorkerLogLevel::Warn),
            "error" => Ok(WorkerLogLevel::Error),
            "none" => Ok(WorkerLogLevel::None),
            other => Err(format!("invalid worker log level '{other}'")),
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub num_workers: usize,
    pub log_level: WorkerLogLevel,
    pub log_tags: Vec<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Delay between a worker dying and the process giving up
    pub death_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            log_level: WorkerLogLevel::Warn,
            log_tags: ["info", "ice", "dtls", "rtp", "srtp", "rtcp"]
                .iter()
                .map(|t| t.to_string())
                .collect(),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            death_grace: Duration::from_secs(2),
        }
    }
}

/// One codec the routers are willing to negotiate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub preferred_payload_type: u8,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

/// Router configuration with codec capabilities
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub media_codecs: Vec<CodecCapability>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            media_codecs: Self::default_codecs(),
        }
    }
}

impl RouterConfig {
    /// Returns default codec capabilities for audio and video
    pub fn default_codecs() -> Vec<CodecCapability> {
        let video = |mime_type: &str, payload_type: u8, parameters: Map<String, Value>| CodecCapability {
            kind: MediaKind::Video,
            mime_type: mime_type.to_string(),
            preferred_payload_type: payload_type,
            clock_rate: 90000,
            channels: None,
            parameters,
        };

        let mut opus_params = Map::new();
        opus_params.insert("minptime".into(), 10.into());
        opus_params.insert("useinbandfec".into(), 1.into());

        let mut h264_params = Map::new();
        h264_params.insert("level-asymmetry-allowed".into(), 1.into());
        h264_params.insert("packetization-mode".into(), 1.into());
        h264_params.insert("profile-level-id".into(), "42e01f".into());

        vec![
            CodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: opus_params,
            },
            video("video/VP8", 96, Map::new()),
            video("video/VP9", 98, Map::new()),
            video("video/H264", 102, h264_params),
        ]
    }
}

/// WebRTC transport configuration
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_ip: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)),
            announced_ip: None,
            initial_available_outgoing_bitrate: 1_000_000,
            max_incoming_bitrate: Some(1_500_000),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the public IP address for the transport
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_ip = Some(public_ip.to_string());
        self
    }

    /// Address advertised in ICE candidates
    pub fn candidate_ip(&self) -> String {
        self.announced_ip
            .clone()
            .unwrap_or_else(|| self.listen_ip.to_string())
    }
}
