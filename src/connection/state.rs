//! Connection state machine
//!
//! `next_state` is the whole transition table. `StateCell` applies it
//! atomically through a watch channel so concurrent callers race on a single
//! compare-and-set instead of on separate flags.

use serde::Serialize;
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle state of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "cause", rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered, no session
    Idle,
    /// One handshake outstanding
    Connecting,
    Connected,
    /// Session dropped without a disconnect request
    ConnectionLost(String),
    /// Disconnect in flight
    Disconnecting,
    /// Engine released; terminal
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Idle => f.write_str("idle"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::ConnectionLost(cause) => write!(f, "connection lost ({cause})"),
            ConnectionState::Disconnecting => f.write_str("disconnecting"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

/// Inputs to the state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    BeginConnect,
    HandshakeSucceeded,
    HandshakeFailed,
    Lost(String),
    BeginDisconnect,
    DisconnectFinished,
    Release,
}

/// Pure transition table. `None` means the transition does not apply.
pub fn next_state(current: &ConnectionState, transition: &Transition) -> Option<ConnectionState> {
    use ConnectionState as S;

    match (current, transition) {
        (S::Closed, _) => None,
        (_, Transition::Release) => Some(S::Closed),

        (S::Idle | S::ConnectionLost(_), Transition::BeginConnect) => Some(S::Connecting),

        // ConnectionLost -> Connected is the engine healing the session itself
        (S::Connecting | S::ConnectionLost(_), Transition::HandshakeSucceeded) => {
            Some(S::Connected)
        }
        (S::Connecting, Transition::HandshakeFailed) => Some(S::Idle),

        (S::Connected, Transition::Lost(cause)) => Some(S::ConnectionLost(cause.clone())),

        (S::Connecting | S::Connected | S::ConnectionLost(_), Transition::BeginDisconnect) => {
            Some(S::Disconnecting)
        }
        (S::Disconnecting, Transition::DisconnectFinished) => Some(S::Idle),

        _ => None,
    }
}

/// Single atomic state holder for a connection
#[derive(Debug)]
pub struct StateCell {
    client: String,
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    pub fn new(client: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self {
            client: client.into(),
            tx,
        }
    }

    pub fn get(&self) -> ConnectionState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply `transition` if it is valid from the current state.
    /// Returns the state that was replaced.
    pub fn apply(&self, transition: Transition) -> Option<ConnectionState> {
        let mut previous = None;
        self.tx.send_if_modified(|state| match next_state(state, &transition) {
            Some(next) => {
                previous = Some(std::mem::replace(state, next));
                true
            }
            None => false,
        });

        match &previous {
            Some(from) => log_transition(&self.client, from, &self.get()),
            None => debug!(
                client = %self.client,
                state = %self.get(),
                ?transition,
                "Transition not applicable"
            ),
        }
        previous
    }
}

fn log_transition(client: &str, from: &ConnectionState, to: &ConnectionState) {
    match to {
        ConnectionState::Connected => info!(client, from = %from, "Connected"),
        ConnectionState::ConnectionLost(cause) => warn!(client, cause = %cause, "Connection lost"),
        _ => debug!(client, from = %from, to = %to, "State changed"),
    }
}
