//! Pure engine state and option handling for the rumqttc adapter
//!
//! This module contains pure functions for engine state, backoff
//! configuration and translation of `ConnectOptions` into rumqttc options.

use crate::transport::EngineError;
use crate::types::{ClientIdentity, ConnectOptions, Qos};
use rumqttc::v5::{mqttbytes::QoS, MqttOptions};
use rumqttc::Transport as RumqttcTransport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Engine-level session state, driven by the event loop supervisor
#[derive(Debug, Clone, PartialEq)]
pub enum EngineState {
    /// No session and no supervisor
    Idle,
    /// Initial handshake in progress
    Connecting,
    /// ConnAck received
    Connected,
    /// Session lost with reason
    Disconnected(String),
    /// Waiting out backoff before retry (attempt count)
    Reconnecting(u32),
    /// Released by `close()`
    Closed,
}

/// Reconnection backoff used by the supervisor after an established session drops
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Maximum number of reconnection attempts (None = unlimited)
    #[serde(default)]
    pub max_attempts: Option<u32>,
    /// Backoff pattern in milliseconds
    #[serde(default = "default_backoff_pattern")]
    pub backoff_pattern: Vec<u64>,
    /// Delay to use after pattern is exhausted
    #[serde(default = "default_sustained_delay")]
    pub sustained_delay: u64,
}

fn default_backoff_pattern() -> Vec<u64> {
    vec![25, 50, 100, 250]
}

fn default_sustained_delay() -> u64 {
    250
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            backoff_pattern: default_backoff_pattern(),
            sustained_delay: default_sustained_delay(),
        }
    }
}

impl ReconnectConfig {
    /// Calculate the maximum total time for all reconnection attempts
    /// Returns None if unlimited retries are configured
    pub fn calculate_max_total_time(&self) -> Option<u64> {
        self.max_attempts.map(|max_attempts| {
            (1..=max_attempts)
                .map(|attempt| self.calculate_backoff_delay(attempt))
                .sum()
        })
    }

    /// Backoff delay for the given 1-based attempt, sustained once the pattern runs out
    pub fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        let index = attempt.saturating_sub(1) as usize;
        self.backoff_pattern
            .get(index)
            .copied()
            .unwrap_or(self.sustained_delay)
    }
}

pub fn to_rumqttc_qos(qos: Qos) -> QoS {
    match qos {
        Qos::AtMostOnce => QoS::AtMostOnce,
        Qos::AtLeastOnce => QoS::AtLeastOnce,
        Qos::ExactlyOnce => QoS::ExactlyOnce,
    }
}

pub fn from_rumqttc_qos(qos: QoS) -> Qos {
    match qos {
        QoS::AtMostOnce => Qos::AtMostOnce,
        QoS::AtLeastOnce => Qos::AtLeastOnce,
        QoS::ExactlyOnce => Qos::ExactlyOnce,
    }
}

/// Broker endpoint parsed from a server URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `tcp://`, `mqtt://`, `ssl://` or `mqtts://` URIs
pub fn parse_broker_uri(server_uri: &str) -> Result<BrokerEndpoint, EngineError> {
    let url =
        Url::parse(server_uri).map_err(|_| EngineError::InvalidBrokerUrl(server_uri.to_string()))?;

    let tls = match url.scheme() {
        "tcp" | "mqtt" => false,
        "ssl" | "mqtts" => true,
        _ => return Err(EngineError::InvalidBrokerUrl(server_uri.to_string())),
    };

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| EngineError::InvalidBrokerUrl(server_uri.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerEndpoint {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Smallest keep alive rumqttc accepts; `set_keep_alive` panics below it
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Broker keep alive for `requested`. Zero means no application probes and
/// leaves rumqttc's own default in place.
fn effective_keep_alive(requested: Duration) -> Option<Duration> {
    if requested.is_zero() {
        None
    } else {
        Some(requested.max(MIN_KEEP_ALIVE))
    }
}

/// Pure function to build rumqttc options for one handshake
pub fn configure_mqtt_options(
    identity: &ClientIdentity,
    options: &ConnectOptions,
) -> Result<MqttOptions, EngineError> {
    let endpoint = parse_broker_uri(&identity.server_uri)?;
    let mut mqtt_options =
        MqttOptions::new(identity.client_id.clone(), endpoint.host, endpoint.port);

    if endpoint.tls {
        mqtt_options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = &options.credentials {
        mqtt_options.set_credentials(&credentials.username, &credentials.password);
    }

    if let Some(keep_alive) = effective_keep_alive(options.keep_alive) {
        mqtt_options.set_keep_alive(keep_alive);
    }
    mqtt_options.set_clean_start(options.clean_session);
    // Inbound messages are acked only after they are persisted
    mqtt_options.set_manual_acks(true);

    Ok(mqtt_options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Credentials;

    #[test]
    fn test_reconnect_config_default() {
        let config = ReconnectConfig::default();
        assert_eq!(config.max_attempts, None);
        assert_eq!(config.backoff_pattern, vec![25, 50, 100, 250]);
        assert_eq!(config.sustained_delay, 250);
    }

    #[test]
    fn test_calculate_backoff_delay() {
        let config = ReconnectConfig::default();
        assert_eq!(config.calculate_backoff_delay(1), 25);
        assert_eq!(config.calculate_backoff_delay(2), 50);
        assert_eq!(config.calculate_backoff_delay(3), 100);
        assert_eq!(config.calculate_backoff_delay(4), 250);
        assert_eq!(config.calculate_backoff_delay(5), 250);
        assert_eq!(config.calculate_backoff_delay(100), 250);
    }

    #[test]
    fn test_calculate_max_total_time() {
        let config = ReconnectConfig {
            max_attempts: Some(5),
            ..Default::default()
        };
        assert_eq!(config.calculate_max_total_time(), Some(25 + 50 + 100 + 250 + 250));
        assert_eq!(ReconnectConfig::default().calculate_max_total_time(), None);
    }

    #[test]
    fn test_empty_pattern_uses_sustained_delay() {
        let config = ReconnectConfig {
            max_attempts: None,
            backoff_pattern: vec![],
            sustained_delay: 500,
        };
        assert_eq!(config.calculate_backoff_delay(1), 500);
    }

    #[test]
    fn test_parse_broker_uri_schemes() {
        let plain = parse_broker_uri("tcp://broker.local:1884").unwrap();
        assert_eq!(plain.host, "broker.local");
        assert_eq!(plain.port, 1884);
        assert!(!plain.tls);

        assert_eq!(parse_broker_uri("mqtt://broker.local").unwrap().port, 1883);

        let secure = parse_broker_uri("ssl://broker.local").unwrap();
        assert!(secure.tls);
        assert_eq!(secure.port, 8883);
        assert!(parse_broker_uri("mqtts://broker.local:9999").unwrap().tls);
    }

    #[test]
    fn test_parse_broker_uri_rejects_garbage() {
        assert!(matches!(
            parse_broker_uri("invalid-url"),
            Err(EngineError::InvalidBrokerUrl(_))
        ));
        assert!(matches!(
            parse_broker_uri("http://broker.local"),
            Err(EngineError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_configure_mqtt_options() {
        let identity = ClientIdentity::new("tcp://localhost:1883", "client-7", "app");
        let options = ConnectOptions {
            clean_session: true,
            credentials: Some(Credentials {
                username: "u".to_string(),
                password: "p".to_string(),
            }),
            keep_alive: Duration::from_secs(30),
            ..Default::default()
        };

        let mqtt_options = configure_mqtt_options(&identity, &options).unwrap();
        assert_eq!(mqtt_options.client_id(), "client-7");
        assert_eq!(mqtt_options.keep_alive(), Duration::from_secs(30));
        assert!(mqtt_options.clean_start());
        assert!(mqtt_options.manual_acks());
    }

    #[test]
    fn test_short_keep_alive_is_raised_to_minimum() {
        let identity = ClientIdentity::new("tcp://localhost:1883", "short-ka", "app");
        for requested in [
            Duration::from_millis(200),
            Duration::from_secs(1),
            Duration::from_secs(2),
            Duration::from_secs(4),
        ] {
            let options = ConnectOptions {
                keep_alive: requested,
                ..Default::default()
            };
            let mqtt_options = configure_mqtt_options(&identity, &options).unwrap();
            assert_eq!(mqtt_options.keep_alive(), MIN_KEEP_ALIVE, "requested {requested:?}");
        }
    }

    #[test]
    fn test_zero_keep_alive_leaves_rumqttc_default() {
        let identity = ClientIdentity::new("tcp://localhost:1883", "no-ka", "app");
        let options = ConnectOptions {
            keep_alive: Duration::ZERO,
            ..Default::default()
        };
        let mqtt_options = configure_mqtt_options(&identity, &options).unwrap();
        assert!(mqtt_options.keep_alive() >= MIN_KEEP_ALIVE);
    }

    #[test]
    fn test_qos_round_trip() {
        for qos in [Qos::AtMostOnce, Qos::AtLeastOnce, Qos::ExactlyOnce] {
            assert_eq!(from_rumqttc_qos(to_rumqttc_qos(qos)), qos);
        }
    }
}
