//! Keep-alive scheduling that survives deep sleep
//!
//! A protocol engine's own keep-alive timer stops ticking when the host
//! suspends the process. The scheduler instead registers with a wake-capable
//! timer (`WakeTimer`), and each firing holds a `WakeLease` while it probes
//! the connection so the host cannot suspend mid-probe.

use crate::error::HermesError;
use crate::power::{WakeLease, WakeLock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Delay used to turn a connection loss into an immediate retry
pub const IMMEDIATE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Callback run when an alarm fires
pub type AlarmCallback = Box<dyn FnOnce() + Send + 'static>;

/// Host timer facility able to wake a suspended process
///
/// Setting an alarm with a tag that is already pending replaces it.
pub trait WakeTimer: Send + Sync {
    fn set_alarm(&self, tag: &str, delay: Duration, callback: AlarmCallback);
    fn cancel_alarm(&self, tag: &str);
}

/// `WakeTimer` backed by tokio timers, for hosts that never suspend
pub struct TokioWakeTimer {
    runtime: Handle,
    alarms: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl TokioWakeTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            alarms: Mutex::new(HashMap::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.alarms
            .lock()
            .map(|alarms| alarms.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }
}

impl WakeTimer for TokioWakeTimer {
    fn set_alarm(&self, tag: &str, delay: Duration, callback: AlarmCallback) {
        let handle = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });

        match self.alarms.lock() {
            Ok(mut alarms) => {
                if let Some(previous) = alarms.insert(tag.to_string(), handle) {
                    previous.abort();
                }
            }
            Err(_) => warn!(tag, "Alarm table poisoned, alarm cannot be cancelled"),
        }
    }

    fn cancel_alarm(&self, tag: &str) {
        if let Ok(mut alarms) = self.alarms.lock() {
            if let Some(handle) = alarms.remove(tag) {
                handle.abort();
            }
        }
    }
}

impl Drop for TokioWakeTimer {
    fn drop(&mut self) {
        if let Ok(mut alarms) = self.alarms.lock() {
            for (_, handle) in alarms.drain() {
                handle.abort();
            }
        }
    }
}

/// Something the scheduler can probe
#[async_trait]
pub trait KeepAliveTarget: Send + Sync {
    /// Ping when healthy, reconnect when lost. An error stops the probe chain.
    async fn check_for_activity(&self) -> Result<(), HermesError>;
}

/// Per-connection keep-alive probe loop
pub struct KeepAliveScheduler {
    tag: String,
    interval: Duration,
    timer: Arc<dyn WakeTimer>,
    wake_lock: Arc<dyn WakeLock>,
    runtime: Handle,
    target: Mutex<Option<Weak<dyn KeepAliveTarget>>>,
    started: AtomicBool,
    this: Weak<KeepAliveScheduler>,
}

impl KeepAliveScheduler {
    pub fn new(
        tag: impl Into<String>,
        interval: Duration,
        timer: Arc<dyn WakeTimer>,
        wake_lock: Arc<dyn WakeLock>,
        runtime: Handle,
    ) -> Arc<Self> {
        let tag = tag.into();
        Arc::new_cyclic(|this| Self {
            tag,
            interval,
            timer,
            wake_lock,
            runtime,
            target: Mutex::new(None),
            started: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    /// Attach the probe target. Held weakly so the scheduler never keeps a
    /// closed connection alive.
    pub fn init(&self, target: Weak<dyn KeepAliveTarget>) {
        if let Ok(mut slot) = self.target.lock() {
            *slot = Some(target);
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Begin periodic probing, first probe one interval from now
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        debug!(tag = %self.tag, interval_ms = self.interval.as_millis() as u64, "Keep-alive started");
        self.schedule(self.interval);
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
        self.timer.cancel_alarm(&self.tag);
        debug!(tag = %self.tag, "Keep-alive stopped");
    }

    /// Arm a single probe `delay` from now, replacing any pending one
    pub fn schedule(&self, delay: Duration) {
        let scheduler = self.this.clone();
        let runtime = self.runtime.clone();
        trace!(tag = %self.tag, delay_ms = delay.as_millis() as u64, "Scheduling keep-alive probe");
        self.timer.set_alarm(
            &self.tag,
            delay,
            Box::new(move || {
                if let Some(scheduler) = scheduler.upgrade() {
                    runtime.spawn(async move { scheduler.fire().await });
                }
            }),
        );
    }

    async fn fire(self: Arc<Self>) {
        let target = self
            .target
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().and_then(Weak::upgrade));
        let Some(target) = target else {
            debug!(tag = %self.tag, "Keep-alive target gone, probe skipped");
            return;
        };

        let lease = WakeLease::acquire(self.wake_lock.clone(), format!("{}:probe", self.tag));
        match target.check_for_activity().await {
            Ok(()) => {
                lease.release();
                if self.is_started() {
                    self.schedule(self.interval);
                }
            }
            Err(e) => {
                lease.release();
                warn!(tag = %self.tag, error = %e, "Keep-alive probe failed");
            }
        }
    }
}

impl Drop for KeepAliveScheduler {
    fn drop(&mut self) {
        self.timer.cancel_alarm(&self.tag);
    }
}
