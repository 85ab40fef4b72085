//! Server and ping configuration.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ServerResult;

fn default_addr() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_max_frame_size() -> usize {
    iris_proto::frame::DEFAULT_MAX_FRAME_SIZE
}

fn default_tick_interval_ms() -> u64 {
    200
}

fn default_true() -> bool {
    true
}

/// Configuration for the WebSocket server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address the main listener binds, e.g. `127.0.0.1:9000`.
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Hosts accepted in the handshake `Host` header.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Origins accepted in the handshake `Origin` header.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    /// Cap on the size of a single outgoing wire frame; larger messages
    /// fragment.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// How often the periodic service tick runs, in milliseconds. This
    /// bounds how long the loop can sit idle with no I/O.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Whether message payloads appear in debug logs.
    #[serde(default = "default_true")]
    pub log_payloads: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            allowed_hosts: Vec::new(),
            allowed_origins: Vec::new(),
            max_frame_size: default_max_frame_size(),
            tick_interval_ms: default_tick_interval_ms(),
            log_payloads: true,
        }
    }
}

impl ServerConfig {
    /// Create a new default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> ServerResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    /// Set the listen address.
    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    /// Add an allowed handshake host.
    pub fn allow_host(mut self, host: impl Into<String>) -> Self {
        self.allowed_hosts.push(host.into());
        self
    }

    /// Add an allowed handshake origin.
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origins.push(origin.into());
        self
    }

    /// Set the outgoing frame size cap.
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the periodic tick interval.
    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set whether payloads appear in debug logs.
    pub fn log_payloads(mut self, log: bool) -> Self {
        self.log_payloads = log;
        self
    }

    /// The tick interval as a [`Duration`].
    pub fn tick_interval_duration(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Ping/liveness configuration for a service.
///
/// When set on a service, the periodic tick sends a Ping to every client
/// idle for at least `interval`, and disconnects a client once
/// `max_before_disconnect` consecutive pings went unanswered.
#[derive(Debug, Clone, Deserialize)]
pub struct PingConfig {
    /// Idle time before a ping is sent, in seconds.
    pub interval_secs: u64,
    /// Unanswered pings tolerated before disconnecting, if any.
    #[serde(default)]
    pub max_before_disconnect: Option<u32>,
    /// Payload carried by liveness pings.
    #[serde(default = "default_ping_payload")]
    pub payload: String,
}

fn default_ping_payload() -> String {
    "knock knock".to_string()
}

impl PingConfig {
    /// Create a ping config with the given idle interval.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval_secs: interval.as_secs(),
            max_before_disconnect: None,
            payload: default_ping_payload(),
        }
    }

    /// Set the number of unanswered pings tolerated before disconnect.
    pub fn max_before_disconnect(mut self, max: u32) -> Self {
        self.max_before_disconnect = Some(max);
        self
    }

    /// Set the ping payload.
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// The idle interval as a [`Duration`].
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
