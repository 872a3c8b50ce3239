use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, trace};

pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_millis(2_000);
pub const DEFAULT_EVALUATION_PERIOD: Duration = Duration::from_millis(500);

/// Derives "remote reachable" from the arrival times of remote heartbeats.
///
/// The remote is offline until the first heartbeat is recorded and again once
/// `timeout` has elapsed since the latest one.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    timeout: Duration,
    last_heartbeat: Mutex<Option<Instant>>,
    online: watch::Sender<bool>,
}

impl Default for HeartbeatMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_TIMEOUT)
    }
}

impl HeartbeatMonitor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            last_heartbeat: Mutex::new(None),
            online: watch::channel(false).0,
        }
    }

    pub fn record_heartbeat(&self) {
        *self.last_heartbeat.lock() = Some(Instant::now());
        self.publish(true);
    }

    pub fn is_online_at(&self, now: Instant) -> bool {
        match *self.last_heartbeat.lock() {
            Some(last) => now.saturating_duration_since(last) < self.timeout,
            None => false,
        }
    }

    /// Re-evaluates the online flag against the current time.
    pub fn evaluate(&self) -> bool {
        let online = self.is_online_at(Instant::now());
        self.publish(online);
        online
    }

    pub fn remote_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.online.subscribe()
    }

    /// Forgets every recorded heartbeat; the remote reads as offline.
    pub fn reset(&self) {
        *self.last_heartbeat.lock() = None;
        self.publish(false);
    }

    pub fn spawn_evaluator(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                monitor.evaluate();
            }
        })
    }

    fn publish(&self, online: bool) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!(target: "tiller::heartbeat", "remote online");
            } else {
                info!(target: "tiller::heartbeat", "remote offline");
            }
        } else {
            trace!(target: "tiller::heartbeat", online, "heartbeat evaluated");
        }
    }
}
