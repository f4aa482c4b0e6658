#![forbid(unsafe_code)]

// Peer: one joined connection and the media objects it owns

use crate::media::types::MediaKind;
use crate::media::RoutingContext;
use crate::signaling::protocol::{PeerSummary, ServerMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

/// Negotiation state of a transport. A closed transport is removed from its
/// peer rather than kept around in a third state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Negotiating,
    Connected,
}

#[derive(Debug, Clone)]
pub struct TransportEntry {
    pub id: String,
    pub state: TransportState,
}

#[derive(Debug, Clone)]
pub struct ProducerEntry {
    pub id: String,
    pub kind: MediaKind,
    pub transport_id: String,
}

#[derive(Debug, Clone)]
pub struct ConsumerEntry {
    pub id: String,
    pub producer_id: String,
    pub transport_id: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// State for one participant. Knows nothing about other peers; all
/// cross-peer effects go through the owning room.
pub struct Peer {
    id: String,
    name: String,
    sender: mpsc::Sender<Arc<String>>,
    rtp_capabilities: Option<Value>,
    transports: HashMap<String, TransportEntry>,
    producers: HashMap<String, ProducerEntry>,
    consumers: HashMap<String, ConsumerEntry>,
    closed: bool,
}

impl Peer {
    pub fn new(id: String, name: String, sender: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            name,
            sender,
            rtp_capabilities: None,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }

    pub fn rtp_capabilities(&self) -> Option<&Value> {
        self.rtp_capabilities.as_ref()
    }

    /// Records the peer's receive capabilities. Only the first call has any
    /// effect; returns whether this call set them.
    pub fn set_rtp_capabilities(&mut self, caps: Value) -> bool {
        if self.rtp_capabilities.is_some() {
            return false;
        }
        self.rtp_capabilities = Some(caps);
        true
    }

    // --- Transports ---

    pub fn add_transport(&mut self, transport_id: String) {
        self.transports.insert(
            transport_id.clone(),
            TransportEntry {
                id: transport_id,
                state: TransportState::Negotiating,
            },
        );
    }

    pub fn transport(&self, transport_id: &str) -> Option<&TransportEntry> {
        self.transports.get(transport_id)
    }

    /// Returns false if the transport is unknown
    pub fn mark_transport_connected(&mut self, transport_id: &str) -> bool {
        match self.transports.get_mut(transport_id) {
            Some(t) => {
                t.state = TransportState::Connected;
                true
            }
            None => false,
        }
    }

    pub fn transports(&self) -> impl Iterator<Item = &TransportEntry> {
        self.transports.values()
    }

    // --- Producers ---

    pub fn add_producer(&mut self, producer: ProducerEntry) {
        self.producers.insert(producer.id.clone(), producer);
    }

    pub fn producer(&self, producer_id: &str) -> Option<&ProducerEntry> {
        self.producers.get(producer_id)
    }

    pub fn remove_producer(&mut self, producer_id: &str) -> Option<ProducerEntry> {
        self.producers.remove(producer_id)
    }

    pub fn producers(&self) -> impl Iterator<Item = &ProducerEntry> {
        self.producers.values()
    }

    // --- Consumers ---

    pub fn add_consumer(&mut self, consumer: ConsumerEntry) {
        self.consumers.insert(consumer.id.clone(), consumer);
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<&ConsumerEntry> {
        self.consumers.get(consumer_id)
    }

    /// Returns false if the consumer is unknown
    pub fn mark_consumer_resumed(&mut self, consumer_id: &str) -> bool {
        match self.consumers.get_mut(consumer_id) {
            Some(c) => {
                c.paused = false;
                true
            }
            None => false,
        }
    }

    pub fn consumers(&self) -> impl Iterator<Item = &ConsumerEntry> {
        self.consumers.values()
    }

    /// Detaches every consumer bound to one of `producer_ids`
    pub fn remove_consumers_of(&mut self, producer_ids: &[String]) -> Vec<ConsumerEntry> {
        let doomed: Vec<String> = self
            .consumers
            .values()
            .filter(|c| producer_ids.contains(&c.producer_id))
            .map(|c| c.id.clone())
            .collect();
        doomed
            .iter()
            .filter_map(|id| self.consumers.remove(id))
            .collect()
    }

    // --- Notifications ---

    /// Queues a push message for this peer without blocking
    pub fn notify(&self, msg: &ServerMessage) -> bool {
        match serde_json::to_string(msg) {
            Ok(json) => self.send_raw(Arc::new(json)),
            Err(e) => {
                warn!("Failed to serialize push for peer {}: {}", self.id, e);
                false
            }
        }
    }

    /// Queues an already-serialized message, so fan-out serializes once
    pub fn send_raw(&self, json: Arc<String>) -> bool {
        match self.sender.try_send(json) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Channel full for peer {}, dropping push", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Channel closed for peer {}", self.id);
                false
            }
        }
    }

    // --- Teardown ---

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Releases every owned media object through the engine, consumers first,
    /// and empties all maps. Calling it again does nothing.
    pub async fn close(&mut self, router: &dyn RoutingContext) {
        if self.closed {
            return;
        }
        self.closed = true;

        let consumers: Vec<String> = self.consumers.drain().map(|(id, _)| id).collect();
        let producers: Vec<String> = self.producers.drain().map(|(id, _)| id).collect();
        let transports: Vec<String> = self.transports.drain().map(|(id, _)| id).collect();

        for consumer_id in &consumers {
            router.close_consumer(consumer_id).await;
        }
        for producer_id in &producers {
            router.close_producer(producer_id).await;
        }
        for transport_id in &transports {
            router.close_transport(transport_id).await;
        }

        info!(
            "Closed peer {} ({} consumers, {} producers released)",
            self.id,
            consumers.len(),
            producers.len()
        );
    }
}
