#![forbid(unsafe_code)]

// mediasoup-backed media engine. Handles are kept in per-router tables keyed by
// their string ids; dropping a handle closes the underlying mediasoup object.

use crate::media::config::{
    CodecCapability, RouterConfig, WebRtcTransportConfig, WorkerConfig, WorkerLogLevel as LogLevel,
};
use crate::media::types::{
    ConsumerParams, MediaError, MediaKind as Kind, MediaResult, TransportParams, WorkerDeath,
};
use crate::media::{MediaEngine, MediaWorker, RoutingContext};
use async_trait::async_trait;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerLogLevel, WorkerLogTag};
use serde_json::Value;
use std::collections::HashMap;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Engine backed by mediasoup worker threads
pub struct MediasoupEngine {
    manager: mediasoup::worker_manager::WorkerManager,
}

impl MediasoupEngine {
    pub fn new() -> Self {
        Self {
            manager: mediasoup::worker_manager::WorkerManager::new(),
        }
    }
}

impl Default for MediasoupEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn to_worker_settings(config: &WorkerConfig) -> WorkerSettings {
    let mut settings = WorkerSettings::default();

    settings.log_level = match config.log_level {
        LogLevel::Debug => WorkerLogLevel::Debug,
        LogLevel::Warn => WorkerLogLevel::Warn,
        LogLevel::Error => WorkerLogLevel::Error,
        LogLevel::None => WorkerLogLevel::None,
    };
    settings.log_tags = config
        .log_tags
        .iter()
        .filter_map(|tag| match tag.as_str() {
            "info" => Some(WorkerLogTag::Info),
            "ice" => Some(WorkerLogTag::Ice),
            "dtls" => Some(WorkerLogTag::Dtls),
            "rtp" => Some(WorkerLogTag::Rtp),
            "srtp" => Some(WorkerLogTag::Srtp),
            "rtcp" => Some(WorkerLogTag::Rtcp),
            "rtx" => Some(WorkerLogTag::Rtx),
            "bwe" => Some(WorkerLogTag::Bwe),
            "score" => Some(WorkerLogTag::Score),
            "simulcast" => Some(WorkerLogTag::Simulcast),
            "svc" => Some(WorkerLogTag::Svc),
            "sctp" => Some(WorkerLogTag::Sctp),
            other => {
                warn!("Ignoring unknown worker log tag '{}'", other);
                None
            }
        })
        .collect();
    settings.rtc_port_range = config.rtc_min_port..=config.rtc_max_port;

    settings
}

fn codec_parameters(parameters: &serde_json::Map<String, Value>) -> RtpCodecParametersParameters {
    let mut out = RtpCodecParametersParameters::default();
    for (key, value) in parameters {
        if let Some(n) = value.as_u64() {
            out.insert(key.clone(), (n as u32).into());
        } else if let Some(s) = value.as_str() {
            out.insert(key.clone(), s.into());
        }
    }
    out
}

fn to_codec_capability(codec: &CodecCapability) -> MediaResult<RtpCodecCapability> {
    let invalid = || MediaError::ConfigurationError(format!("unsupported codec {}", codec.mime_type));
    let clock_rate = NonZeroU32::new(codec.clock_rate).ok_or_else(invalid)?;

    match codec.kind {
        Kind::Audio => {
            let mime_type = match codec.mime_type.to_ascii_lowercase().as_str() {
                "audio/opus" => MimeTypeAudio::Opus,
                "audio/pcmu" => MimeTypeAudio::Pcmu,
                "audio/pcma" => MimeTypeAudio::Pcma,
                "audio/g722" => MimeTypeAudio::G722,
                _ => return Err(invalid()),
            };
            Ok(RtpCodecCapability::Audio {
                mime_type,
                preferred_payload_type: Some(codec.preferred_payload_type),
                clock_rate,
                channels: NonZeroU8::new(codec.channels.unwrap_or(1)).ok_or_else(invalid)?,
                parameters: codec_parameters(&codec.parameters),
                rtcp_feedback: vec![RtcpFeedback::TransportCc],
            })
        }
        Kind::Video => {
            let mime_type = match codec.mime_type.to_ascii_lowercase().as_str() {
                "video/vp8" => MimeTypeVideo::Vp8,
                "video/vp9" => MimeTypeVideo::Vp9,
                "video/h264" => MimeTypeVideo::H264,
                "video/av1" => MimeTypeVideo::Av1,
                _ => return Err(invalid()),
            };
            Ok(RtpCodecCapability::Video {
                mime_type,
                preferred_payload_type: Some(codec.preferred_payload_type),
                clock_rate,
                parameters: codec_parameters(&codec.parameters),
                rtcp_feedback: vec![
                    RtcpFeedback::Nack,
                    RtcpFeedback::NackPli,
                    RtcpFeedback::CcmFir,
                    RtcpFeedback::GoogRemb,
                    RtcpFeedback::TransportCc,
                ],
            })
        }
    }
}

fn to_transport_options(config: &WebRtcTransportConfig) -> WebRtcTransportOptions {
    let listen_info = |protocol| ListenInfo {
        protocol,
        ip: config.listen_ip,
        announced_address: config.announced_ip.clone(),
        port: None,
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
        expose_internal_ip: false,
    };

    let mut infos = WebRtcTransportListenInfos::new(listen_info(Protocol::Udp));
    if config.enable_tcp {
        infos = infos.insert(listen_info(Protocol::Tcp));
    }

    let mut options = WebRtcTransportOptions::new(infos);
    options.enable_udp = config.enable_udp;
    options.enable_tcp = config.enable_tcp;
    options.prefer_udp = config.prefer_udp;
    options.initial_available_outgoing_bitrate = config.initial_available_outgoing_bitrate;
    options
}

fn parse_json<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> MediaResult<T> {
    serde_json::from_value(value)
        .map_err(|e| MediaError::TransportError(format!("invalid {what}: {e}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    fn name(&self) -> &'static str {
        "mediasoup"
    }

    async fn spawn_worker(
        &self,
        index: usize,
        config: &WorkerConfig,
        death_tx: mpsc::UnboundedSender<WorkerDeath>,
    ) -> MediaResult<Arc<dyn MediaWorker>> {
        let worker = self
            .manager
            .create_worker(to_worker_settings(config))
            .await
            .map_err(|e| MediaError::WorkerError(format!("Failed to create worker: {e}")))?;

        // mediasoup workers are threads of this process
        let pid = std::process::id();
        let worker_id = worker.id();

        worker
            .on_dead(move |reason| {
                let _ = death_tx.send(WorkerDeath {
                    index,
                    pid,
                    reason: format!("{reason:?}"),
                });
            })
            .detach();

        info!("Created mediasoup worker {} with id: {}", index, worker_id);
        Ok(Arc::new(SoupWorker { index, pid, worker }))
    }
}

struct SoupWorker {
    index: usize,
    pid: u32,
    worker: Worker,
}

#[async_trait]
impl MediaWorker for SoupWorker {
    fn index(&self) -> usize {
        self.index
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_alive(&self) -> bool {
        !self.worker.closed()
    }

    async fn create_router(&self, config: &RouterConfig) -> MediaResult<Arc<dyn RoutingContext>> {
        let codecs = config
            .media_codecs
            .iter()
            .map(to_codec_capability)
            .collect::<MediaResult<Vec<_>>>()?;

        let router = self
            .worker
            .create_router(RouterOptions::new(codecs))
            .await
            .map_err(|e| MediaError::RouterError(format!("Failed to create router: {e}")))?;

        let router_id = router.id().to_string();
        let worker_index = self.index;
        router
            .on_worker_close(move || {
                warn!("Router closed because worker {} closed", worker_index);
            })
            .detach();

        debug!("Created router {} on worker {}", router_id, self.index);
        Ok(Arc::new(SoupRouter {
            id: router_id,
            router,
            handles: StdMutex::new(Handles::default()),
        }))
    }
}

#[derive(Default)]
struct Handles {
    transports: HashMap<String, WebRtcTransport>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
}

struct SoupRouter {
    id: String,
    router: Router,
    handles: StdMutex<Handles>,
}

impl SoupRouter {
    fn handles(&self) -> std::sync::MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transport(&self, transport_id: &str) -> MediaResult<WebRtcTransport> {
        self.handles()
            .transports
            .get(transport_id)
            .cloned()
            .ok_or_else(|| MediaError::TransportError(format!("Transport not found: {transport_id}")))
    }
}

#[async_trait]
impl RoutingContext for SoupRouter {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_capabilities(&self) -> Value {
        to_value(self.router.rtp_capabilities())
    }

    fn can_consume(&self, producer_id: &str, rtp_capabilities: &Value) -> bool {
        let Ok(producer_id) = producer_id.parse::<ProducerId>() else {
            return false;
        };
        match serde_json::from_value::<RtpCapabilities>(rtp_capabilities.clone()) {
            Ok(caps) => self.router.can_consume(&producer_id, &caps),
            Err(_) => false,
        }
    }

    async fn create_webrtc_transport(
        &self,
        config: &WebRtcTransportConfig,
    ) -> MediaResult<TransportParams> {
        let transport = self
            .router
            .create_webrtc_transport(to_transport_options(config))
            .await
            .map_err(|e| MediaError::TransportError(format!("Failed to create transport: {e}")))?;

        if let Some(bitrate) = config.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!("Failed to set max incoming bitrate on {}: {}", transport.id(), e);
            }
        }

        let transport_id = transport.id().to_string();
        transport
            .on_dtls_state_change({
                let transport_id = transport_id.clone();
                move |dtls_state| {
                    debug!("DTLS state: {:?} for transport {}", dtls_state, transport_id);
                }
            })
            .detach();

        let params = TransportParams {
            id: transport_id.clone(),
            ice_parameters: to_value(transport.ice_parameters()),
            ice_candidates: to_value(transport.ice_candidates()),
            dtls_parameters: to_value(&transport.dtls_parameters()),
        };
        self.handles().transports.insert(transport_id, transport);
        Ok(params)
    }

    async fn connect_transport(&self, transport_id: &str, dtls_parameters: Value) -> MediaResult<()> {
        let transport = self.transport(transport_id)?;
        let dtls_parameters: DtlsParameters = parse_json(dtls_parameters, "DTLS parameters")?;

        transport
            .connect(WebRtcTransportRemoteParameters { dtls_parameters })
            .await?;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: Kind,
        rtp_parameters: Value,
    ) -> MediaResult<String> {
        let transport = self.transport(transport_id)?;
        let rtp_parameters: RtpParameters = parse_json(rtp_parameters, "RTP parameters")?;
        let kind = match kind {
            Kind::Audio => MediaKind::Audio,
            Kind::Video => MediaKind::Video,
        };

        let producer = transport
            .produce(ProducerOptions::new(kind, rtp_parameters))
            .await
            .map_err(|e| MediaError::ProducerError(format!("Failed to create producer: {e}")))?;

        let producer_id = producer.id().to_string();
        self.handles().producers.insert(producer_id.clone(), producer);
        Ok(producer_id)
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: Value,
    ) -> MediaResult<ConsumerParams> {
        let transport = self.transport(transport_id)?;
        let target: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::ConsumerError(format!("Invalid producer ID: {producer_id}")))?;
        let rtp_capabilities: RtpCapabilities = parse_json(rtp_capabilities, "RTP capabilities")?;

        let mut options = ConsumerOptions::new(target, rtp_capabilities);
        options.paused = true;

        let consumer = transport
            .consume(options)
            .await
            .map_err(|e| MediaError::ConsumerError(format!("Failed to create consumer: {e}")))?;

        let params = ConsumerParams {
            id: consumer.id().to_string(),
            producer_id: producer_id.to_string(),
            kind: match consumer.kind() {
                MediaKind::Audio => Kind::Audio,
                MediaKind::Video => Kind::Video,
            },
            rtp_parameters: to_value(consumer.rtp_parameters()),
            consumer_type: to_value(&consumer.r#type())
                .as_str()
                .unwrap_or("simple")
                .to_string(),
            paused: consumer.paused(),
            producer_paused: consumer.producer_paused(),
        };
        self.handles().consumers.insert(params.id.clone(), consumer);
        Ok(params)
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        let consumer = self
            .handles()
            .consumers
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| MediaError::ConsumerError(format!("Consumer not found: {consumer_id}")))?;

        consumer.resume().await?;
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) {
        let producer = self.handles().producers.remove(producer_id);
        drop(producer);
    }

    async fn close_consumer(&self, consumer_id: &str) {
        let consumer = self.handles().consumers.remove(consumer_id);
        drop(consumer);
    }

    async fn close_transport(&self, transport_id: &str) {
        let transport = self.handles().transports.remove(transport_id);
        drop(transport);
    }

    async fn close(&self) {
        let handles = std::mem::take(&mut *self.handles());
        drop(handles);
        debug!("Released handles of router {}", self.id);
    }
}
