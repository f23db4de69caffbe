//! Core data model shared by every layer
//!
//! `ClientIdentity` is the only lookup key used by the registry, the store,
//! the dispatcher and the logs. Everything else hangs off it.

use crate::store::MessageStore;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Composite key identifying one broker connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClientIdentity {
    pub server_uri: String,
    pub client_id: String,
    pub app_id: String,
}

impl ClientIdentity {
    pub fn new(
        server_uri: impl Into<String>,
        client_id: impl Into<String>,
        app_id: impl Into<String>,
    ) -> Self {
        Self {
            server_uri: server_uri.into(),
            client_id: client_id.into(),
            app_id: app_id.into(),
        }
    }

    /// Stable string form, `server_uri:client_id:app_id`
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.server_uri, self.client_id, self.app_id)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

/// MQTT quality of service
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Qos {
    AtMostOnce,
    #[default]
    AtLeastOnce,
    ExactlyOnce,
}

impl Qos {
    pub fn level(self) -> u8 {
        match self {
            Qos::AtMostOnce => 0,
            Qos::AtLeastOnce => 1,
            Qos::ExactlyOnce => 2,
        }
    }

    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Qos::AtMostOnce),
            1 => Some(Qos::AtLeastOnce),
            2 => Some(Qos::ExactlyOnce),
            _ => None,
        }
    }
}

/// Who deletes a persisted inbound message once it has been delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckMode {
    /// Deleted by the dispatcher after every listener returned
    #[default]
    Auto,
    /// Deleted when the application calls `acknowledge`
    Manual,
}

/// Username/password pair handed to the protocol engine
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Offline publish buffer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferOptions {
    #[serde(default = "default_buffer_enabled")]
    pub enabled: bool,
    #[serde(default = "default_buffer_capacity")]
    pub capacity: usize,
    /// Evict the oldest entry instead of rejecting when full
    #[serde(default)]
    pub delete_oldest: bool,
}

fn default_buffer_enabled() -> bool {
    true
}

fn default_buffer_capacity() -> usize {
    5000
}

impl Default for BufferOptions {
    fn default() -> Self {
        Self {
            enabled: default_buffer_enabled(),
            capacity: default_buffer_capacity(),
            delete_oldest: false,
        }
    }
}

/// Options fixed at registration time and passed to every handshake
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectOptions {
    pub automatic_reconnect: bool,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    pub keep_alive: Duration,
    pub connection_timeout: Duration,
    pub buffer: BufferOptions,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            automatic_reconnect: true,
            clean_session: false,
            credentials: None,
            keep_alive: Duration::from_secs(60),
            connection_timeout: Duration::from_secs(30),
            buffer: BufferOptions::default(),
        }
    }
}

/// Everything needed to construct a `Connection`
#[derive(Clone)]
pub struct ClientInfo {
    pub identity: ClientIdentity,
    pub options: ConnectOptions,
    pub ack_mode: AckMode,
    pub store: Arc<dyn MessageStore>,
}

impl ClientInfo {
    pub fn new(identity: ClientIdentity, store: Arc<dyn MessageStore>) -> Self {
        Self {
            identity,
            options: ConnectOptions::default(),
            ack_mode: AckMode::default(),
            store,
        }
    }

    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_ack_mode(mut self, ack_mode: AckMode) -> Self {
        self.ack_mode = ack_mode;
        self
    }
}

impl fmt::Debug for ClientInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientInfo")
            .field("identity", &self.identity)
            .field("options", &self.options)
            .field("ack_mode", &self.ack_mode)
            .field("store", &"dyn MessageStore")
            .finish()
    }
}

/// A message as delivered by the protocol engine, before persistence
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retained: bool,
    pub duplicate: bool,
    /// Broker packet id, present for QoS 1 and 2
    pub packet_id: Option<u16>,
}

/// Handle for one application publish, unique within its connection.
///
/// Returned by `publish` and carried by the matching `DeliveryComplete`
/// event, so callers can tell which publish the broker confirmed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeliveryToken(pub u64);

impl fmt::Display for DeliveryToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An application publish, sent or waiting in the offline buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub token: DeliveryToken,
    pub topic: String,
    pub payload: Bytes,
    pub qos: Qos,
    pub retained: bool,
}
