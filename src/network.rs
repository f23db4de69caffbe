//! Network reachability monitor
//!
//! Turns host connectivity reports into registry-wide `reconnect()` and
//! `offline()` broadcasts. Repeated identical reports are dropped so that a
//! flapping host notifier cannot trigger a reconnect storm.

use crate::power::{WakeLease, WakeLock};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Receiver of debounced reachability transitions
#[async_trait]
pub trait ReachabilityListener: Send + Sync {
    async fn on_network_online(&self);
    async fn on_network_offline(&self);
}

/// Last reachability the registry acted on, shared with every connection
///
/// Starts online; connections skip `reconnect()` while it reads offline.
#[derive(Debug)]
pub struct NetworkStatus {
    online: AtomicBool,
}

impl NetworkStatus {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

impl Default for NetworkStatus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct NetworkMonitor {
    listener: Arc<dyn ReachabilityListener>,
    wake_lock: Arc<dyn WakeLock>,
    /// None until the host reports anything
    last_known: Mutex<Option<bool>>,
}

impl NetworkMonitor {
    pub fn new(listener: Arc<dyn ReachabilityListener>, wake_lock: Arc<dyn WakeLock>) -> Self {
        Self {
            listener,
            wake_lock,
            last_known: Mutex::new(None),
        }
    }

    /// Unknown reachability counts as online
    pub async fn is_online(&self) -> bool {
        self.last_known.lock().await.unwrap_or(true)
    }

    /// Host callback. Returns true when the report caused a broadcast.
    pub async fn on_reachability_changed(&self, is_online: bool) -> bool {
        // Held across the fan-out so concurrent reports are applied in order
        let mut last_known = self.last_known.lock().await;
        if *last_known == Some(is_online) {
            debug!(is_online, "Duplicate reachability report ignored");
            return false;
        }
        *last_known = Some(is_online);

        let lease = WakeLease::acquire(self.wake_lock.clone(), "network-monitor");
        if is_online {
            info!("Network online, reconnecting clients");
            self.listener.on_network_online().await;
        } else {
            info!("Network offline, marking clients offline");
            self.listener.on_network_offline().await;
        }
        lease.release();
        true
    }
}
