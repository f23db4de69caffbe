//! rumqttc-backed protocol engine
//!
//! This module separates pure functions from I/O operations:
//!
//! - [`connection`] - Engine state, backoff configuration and option translation
//! - [`message_handler`] - Pure routing of rumqttc events
//! - [`health_monitor`] - Pure reconnection decisions
//! - [`client`] - The engine itself and its event loop supervisor
//!
//! # Usage
//!
//! ```rust,no_run
//! use hermes::transport::mqtt::{ReconnectConfig, RumqttcEngineFactory};
//! use hermes::transport::{engine_event_channel, EngineFactory};
//! use hermes::types::{ClientIdentity, ConnectOptions};
//!
//! # tokio_test::block_on(async {
//! let factory = RumqttcEngineFactory::new(ReconnectConfig::default());
//! let (events_tx, _events_rx) = engine_event_channel();
//! let identity = ClientIdentity::new("tcp://localhost:1883", "sensor-7", "com.example.app");
//!
//! let engine = factory.create(&identity, events_tx)?;
//! engine.connect(&ConnectOptions::default()).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod message_handler;

pub use client::{RumqttcEngine, RumqttcEngineFactory};
pub use connection::{EngineState, ReconnectConfig};
pub use health_monitor::{HealthMonitor, ReconnectionDecision};
pub use message_handler::{EventRoute, MessageHandler};
