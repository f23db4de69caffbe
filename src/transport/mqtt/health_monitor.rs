//! Pure reconnection decisions for the rumqttc supervisor
//!
//! This module contains pure functions deciding what the supervisor does
//! after a session drops, plus engine state transition logging.

use super::connection::{EngineState, ReconnectConfig};
use std::time::Duration;
use tracing::{error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Decide whether the supervisor should poll the event loop again after a loss
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        config: &ReconnectConfig,
        policy: ReconnectPolicy,
    ) -> ReconnectionDecision {
        if policy.shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }
        if policy.disconnect_requested {
            return ReconnectionDecision::AbortDisconnectRequested;
        }
        // The first handshake is reported to the caller, never retried here
        if !policy.has_connected {
            return ReconnectionDecision::AbortInitialHandshake;
        }
        if !policy.automatic_reconnect {
            return ReconnectionDecision::AbortAutoReconnectDisabled;
        }
        if let Some(max_attempts) = config.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts + 1;
        ReconnectionDecision::Proceed {
            attempt,
            delay_ms: config.calculate_backoff_delay(attempt),
        }
    }

    /// Determine next state after a supervisor event (pure function)
    pub fn determine_next_state(event: SupervisorEvent) -> EngineState {
        match event {
            SupervisorEvent::HandshakeStarted => EngineState::Connecting,
            SupervisorEvent::ConnAckReceived => EngineState::Connected,
            SupervisorEvent::DisconnectedByBroker => {
                EngineState::Disconnected("Broker disconnected".to_string())
            }
            SupervisorEvent::NetworkError(error) => EngineState::Disconnected(error),
            SupervisorEvent::ReconnectionStarted(attempt) => EngineState::Reconnecting(attempt),
            SupervisorEvent::ClientDisconnected => {
                EngineState::Disconnected("Client disconnected".to_string())
            }
            SupervisorEvent::Released => EngineState::Closed,
        }
    }

    /// Check if engine state allows outbound traffic (pure function)
    pub fn can_send(state: &EngineState) -> bool {
        matches!(state, EngineState::Connected)
    }

    /// Log engine state transition (pure logging function)
    pub fn log_state_transition(client: &str, from: &EngineState, to: &EngineState) {
        match (from, to) {
            (EngineState::Connecting, EngineState::Connected) => {
                info!(client, "MQTT session established");
            }
            (EngineState::Reconnecting(attempt), EngineState::Connected) => {
                info!(client, attempt, "MQTT session re-established");
            }
            (EngineState::Connected, EngineState::Disconnected(reason)) => {
                warn!(client, reason = %reason, "MQTT session lost");
            }
            (EngineState::Connecting, EngineState::Disconnected(reason)) => {
                error!(client, reason = %reason, "MQTT handshake failed");
            }
            _ => {
                info!(client, "MQTT engine state: {:?} -> {:?}", from, to);
            }
        }
    }

    /// Time to wait for the first ConnAck
    pub fn calculate_connection_timeout(configured: Duration) -> Duration {
        if configured.is_zero() {
            Duration::from_secs(60)
        } else {
            configured
        }
    }

    /// Validate backoff configuration (pure function)
    pub fn validate_reconnect_config(config: &ReconnectConfig) -> Result<(), String> {
        if let Some(0) = config.max_attempts {
            return Err("max_attempts must be greater than 0 or omitted for unlimited".to_string());
        }
        if config.sustained_delay == 0 {
            return Err("sustained_delay must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Inputs to a reconnection decision besides the attempt count
#[derive(Debug, Clone, Copy, Default)]
pub struct ReconnectPolicy {
    pub shutdown_requested: bool,
    pub disconnect_requested: bool,
    pub has_connected: bool,
    pub automatic_reconnect: bool,
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Poll again after the delay
    Proceed { attempt: u32, delay_ms: u64 },
    AbortShutdownRequested,
    AbortDisconnectRequested,
    AbortInitialHandshake,
    AbortAutoReconnectDisabled,
    AbortMaxAttemptsExceeded,
}

/// Supervisor events that trigger state transitions
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    HandshakeStarted,
    ConnAckReceived,
    DisconnectedByBroker,
    NetworkError(String),
    ReconnectionStarted(u32),
    ClientDisconnected,
    Released,
}
