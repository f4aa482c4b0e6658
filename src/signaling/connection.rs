#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientMessage, ServerMessage};
use super::session::Session;
use crate::metrics::ServerMetrics;
use crate::room::RoomRegistry;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale, so drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout: close the connection if no message arrives within this duration.
/// Keeps idle sockets from holding semaphore permits indefinitely.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Splits a text frame into its optional `requestId` and the typed request
fn parse_frame(text: &str) -> (Option<u64>, Result<ClientMessage, serde_json::Error>) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => return (None, Err(e)),
    };
    let request_id = value.get("requestId").and_then(Value::as_u64);
    (request_id, serde_json::from_value(value))
}

/// Integer token bucket, refilled on every check
struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    fn new() -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: Instant::now(),
            warned: false,
        }
    }

    /// Returns `Some(first_violation)` when the message must be dropped
    fn check(&mut self, now: Instant) -> Option<bool> {
        let elapsed_us = now.duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = (self.tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            None
        } else {
            let first = !self.warned;
            self.warned = true;
            Some(first)
        }
    }
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", peer_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for everything sent to this client: replies and pushes
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_peer_id = peer_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for peer: {}", send_peer_id);
    });

    let mut session = Session::new(peer_id.clone(), registry, tx.clone(), metrics.clone());
    let mut limiter = RateLimiter::new();

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();

                let (request_id, parsed) = parse_frame(&text);

                if let Some(first) = limiter.check(Instant::now()) {
                    if first {
                        warn!("Rate limit exceeded for peer {}", peer_id);
                        let _ = send_json(&tx, &ServerMessage::Error {
                            request_id,
                            message: format!("Rate limit exceeded: max {} messages/second", RATE_LIMIT_REFILL_RATE),
                        });
                    }
                    continue;
                }

                let client_msg = match parsed {
                    Ok(client_msg) => client_msg,
                    Err(e) => {
                        warn!("Invalid message format from {}: {}", peer_id, e);
                        metrics.inc_errors();
                        let _ = send_json(&tx, &ServerMessage::Error {
                            request_id,
                            message: format!("Invalid message format: {e}"),
                        });
                        continue;
                    }
                };

                let name = client_msg.name();
                debug!("Peer {} -> {} (requestId {:?})", peer_id, name, request_id);

                let start = Instant::now();
                let result = session.handle(client_msg).await;
                metrics.observe_request_handling(start.elapsed());

                let reply = match result {
                    Ok(Some(data)) => ServerMessage::Response { request_id, data },
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("{} from peer {} failed: {}", name, peer_id, e);
                        metrics.inc_errors();
                        ServerMessage::Error {
                            request_id,
                            message: e.to_string(),
                        }
                    }
                };

                if send_json(&tx, &reply).is_err() && tx.is_closed() {
                    break;
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", peer_id);
            }
        }
    }

    session.disconnect().await;

    drop(session);
    drop(tx);
    let _ = send_task.await;

    info!("Connection closed: {}", peer_id);
}
