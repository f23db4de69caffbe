//! Hermes - resilient MQTT connection manager
//!
//! Hermes keeps any number of independent broker connections alive for a
//! long-running host process. Inbound messages are persisted before the
//! broker is acknowledged, so nothing is lost if the process dies before
//! the application has consumed them. Sessions are restored after network
//! loss and after the host suspends the process.
//!
//! # Overview
//!
//! - [`registry::ConnectionRegistry`] - the public entry point, one per process
//! - [`connection::Connection`] - per-client state machine, offline buffer and subscriptions
//! - [`store::MessageStore`] - durable per-client backlog (`sled` or in-memory)
//! - [`keepalive::KeepAliveScheduler`] - probes that survive deep sleep
//! - [`network::NetworkMonitor`] - debounced reachability to reconnect broadcasts
//! - [`transport::ProtocolEngine`] - the MQTT codec boundary, backed by `rumqttc`
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use hermes::registry::ConnectionRegistry;
//! use hermes::store::SledMessageStore;
//! use hermes::transport::mqtt::RumqttcEngineFactory;
//! use hermes::types::{AckMode, ClientIdentity, Qos};
//! use hermes::Event;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(SledMessageStore::open("/tmp/hermes-store")?);
//! let registry = ConnectionRegistry::new(Arc::new(RumqttcEngineFactory::default()), store)?;
//! registry.add_listener(Arc::new(|event: &Event| println!("{}", event.name())));
//!
//! let identity = ClientIdentity::new("tcp://localhost:1883", "sensor-7", "com.example.app");
//! let info = registry.client_info(identity).with_ack_mode(AckMode::Manual);
//! let client = registry.register(info).await?;
//!
//! registry.connect(&client).await?;
//! registry.subscribe(&client, &["sensors/#".to_string()], Qos::AtLeastOnce).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod keepalive;
pub mod network;
pub mod observability;
pub mod power;
pub mod registry;
pub mod store;
pub mod testing;
pub mod transport;
pub mod types;

pub use config::{ConfigError, HermesConfig};
pub use connection::{Connection, ConnectionState};
pub use dispatch::{Event, EventListener};
pub use error::{HermesError, HermesResult};
pub use registry::ConnectionRegistry;
pub use store::{MessageStore, StoredMessage};
pub use types::{AckMode, ClientIdentity, ClientInfo, ConnectOptions, DeliveryToken, Qos};
