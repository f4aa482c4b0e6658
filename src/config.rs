#![forbid(unsafe_code)]

// Process configuration read from environment variables

use crate::media::config::{EngineKind, MediaConfig, WorkerLogLevel};
use anyhow::{anyhow, bail, Context, Result};
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_MAX_CONNECTIONS: usize = 10_000;

/// Everything the binary needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    pub engine: EngineKind,
    pub media: MediaConfig,
}

impl ServerConfig {
    /// Reads configuration from the process environment.
    ///
    /// # Errors
    /// Returns an error naming the offending variable if any value fails to parse
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary key lookup. Unset keys take defaults.
    ///
    /// # Errors
    /// Returns an error naming the offending variable if any value fails to parse
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut media = MediaConfig::default();

        let port = parse_or(&lookup, "PORT", DEFAULT_PORT)?;

        let mut max_connections = parse_or(&lookup, "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            tracing::warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let engine = match lookup("MEDIA_ENGINE") {
            Some(value) => EngineKind::from_str(&value).map_err(|e| anyhow!("MEDIA_ENGINE: {e}"))?,
            None => EngineKind::default(),
        };

        let worker = &mut media.worker_config;
        worker.num_workers = parse_or(&lookup, "NUM_WORKERS", worker.num_workers)?;
        if worker.num_workers == 0 {
            bail!("NUM_WORKERS must be at least 1");
        }
        worker.rtc_min_port = parse_or(&lookup, "RTC_MIN_PORT", worker.rtc_min_port)?;
        worker.rtc_max_port = parse_or(&lookup, "RTC_MAX_PORT", worker.rtc_max_port)?;
        if worker.rtc_min_port > worker.rtc_max_port {
            bail!(
                "RTC_MIN_PORT ({}) must not exceed RTC_MAX_PORT ({})",
                worker.rtc_min_port,
                worker.rtc_max_port
            );
        }
        if let Some(level) = lookup("WORKER_LOG_LEVEL") {
            worker.log_level = WorkerLogLevel::from_str(&level).map_err(|e| anyhow!("WORKER_LOG_LEVEL: {e}"))?;
        }
        if let Some(tags) = lookup("WORKER_LOG_TAGS") {
            worker.log_tags = tags
                .split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
        worker.death_grace = Duration::from_millis(parse_or(&lookup, "WORKER_DEATH_GRACE_MS", 2000u64)?);

        let transport = &mut media.webrtc_transport_config;
        transport.listen_ip = parse_or(&lookup, "LISTEN_IP", transport.listen_ip)?;
        if let Some(ip) = lookup("ANNOUNCE_IP") {
            let ip: IpAddr = ip.parse().map_err(|_| anyhow!("Invalid ANNOUNCE_IP: {ip}"))?;
            tracing::info!("Using announced IP: {}", ip);
            *transport = transport.clone().with_public_ip(ip);
        }
        transport.max_incoming_bitrate = Some(parse_or(
            &lookup,
            "MAX_INCOMING_BITRATE",
            transport.max_incoming_bitrate.unwrap_or(1_500_000),
        )?);
        transport.initial_available_outgoing_bitrate = parse_or(
            &lookup,
            "INITIAL_OUTGOING_BITRATE",
            transport.initial_available_outgoing_bitrate,
        )?;

        let timeout_ms = parse_or(&lookup, "ENGINE_TIMEOUT_MS", 10_000u64)?;
        if timeout_ms == 0 {
            bail!("ENGINE_TIMEOUT_MS must be positive");
        }
        media.request_timeout = Duration::from_millis(timeout_ms);

        Ok(Self {
            port,
            max_connections,
            engine,
            media,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid {key}: {raw}")),
        None => Ok(default),
    }
}
