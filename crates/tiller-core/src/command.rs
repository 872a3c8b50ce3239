//! Periodic control frames written to the vehicle over the control data
//! channel.
//!
//! Frames are newline-terminated ASCII: `M<percent>,<direction>\n` for the
//! motor and `R<degrees>\n` for the rudder. Both are written on every tick
//! whether or not the setpoint changed; the vehicle treats a gap in the stream
//! as "stop".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use crate::engine::DataChannel;

pub const DEFAULT_COMMAND_PERIOD: Duration = Duration::from_millis(100);
pub const MAX_RUDDER_DEGREES: f64 = 45.0;
const DIRECTION_DEADBAND: f64 = 0.1;

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(-1.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ControlSetpoint {
    pub throttle: f64,
    pub steering: f64,
}

impl ControlSetpoint {
    pub fn new(throttle: f64, steering: f64) -> Self {
        Self {
            throttle: clamp_unit(throttle),
            steering: clamp_unit(steering),
        }
    }

    pub fn motor_percent(&self) -> u8 {
        (clamp_unit(self.throttle).abs() * 100.0).round() as u8
    }

    pub fn motor_direction(&self) -> i8 {
        let throttle = clamp_unit(self.throttle);
        if throttle > DIRECTION_DEADBAND {
            1
        } else if throttle < -DIRECTION_DEADBAND {
            -1
        } else {
            0
        }
    }

    /// Rudder angle in whole degrees, rounded half away from zero.
    pub fn rudder_degrees(&self) -> i8 {
        (clamp_unit(self.steering) * MAX_RUDDER_DEGREES).round() as i8
    }

    pub fn motor_frame(&self) -> String {
        format!("M{},{}\n", self.motor_percent(), self.motor_direction())
    }

    pub fn rudder_frame(&self) -> String {
        format!("R{}\n", self.rudder_degrees())
    }
}

/// Shared, lock-free setpoint cell written by input handling and read by the
/// publisher on each tick.
#[derive(Debug, Clone, Default)]
pub struct Setpoints {
    throttle: Arc<AtomicU64>,
    steering: Arc<AtomicU64>,
}

impl Setpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_throttle(&self, throttle: f64) {
        self.throttle
            .store(clamp_unit(throttle).to_bits(), Ordering::Relaxed);
    }

    pub fn set_steering(&self, steering: f64) {
        self.steering
            .store(clamp_unit(steering).to_bits(), Ordering::Relaxed);
    }

    pub fn set(&self, setpoint: ControlSetpoint) {
        self.set_throttle(setpoint.throttle);
        self.set_steering(setpoint.steering);
    }

    /// Zeroes both setpoints.
    pub fn halt(&self) {
        self.set(ControlSetpoint::default());
    }

    pub fn current(&self) -> ControlSetpoint {
        ControlSetpoint {
            throttle: f64::from_bits(self.throttle.load(Ordering::Relaxed)),
            steering: f64::from_bits(self.steering.load(Ordering::Relaxed)),
        }
    }
}

struct ActivePublisher {
    enabled: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

/// Writes motor and rudder frames to an open data channel on a fixed period.
pub struct CommandPublisher {
    setpoints: Setpoints,
    period: Duration,
    active: Option<ActivePublisher>,
}

impl CommandPublisher {
    pub fn new(setpoints: Setpoints, period: Duration) -> Self {
        Self {
            setpoints,
            period,
            active: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }

    /// Starts ticking against `channel`, replacing any previous ticker.
    pub fn start(&mut self, channel: Arc<dyn DataChannel>) {
        self.stop();
        let enabled = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(run_ticker(
            channel,
            self.setpoints.clone(),
            self.period,
            Arc::clone(&enabled),
        ));
        debug!(
            target: "tiller::command",
            period_ms = self.period.as_millis() as u64,
            "command publisher started"
        );
        self.active = Some(ActivePublisher { enabled, task });
    }

    /// Stops the ticker. Safe to call when already stopped.
    pub fn stop(&mut self) {
        if let Some(active) = self.active.take() {
            active.enabled.store(false, Ordering::SeqCst);
            active.task.abort();
            debug!(target: "tiller::command", "command publisher stopped");
        }
    }
}

impl Drop for CommandPublisher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_ticker(
    channel: Arc<dyn DataChannel>,
    setpoints: Setpoints,
    period: Duration,
    enabled: Arc<AtomicBool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let setpoint = setpoints.current();
        for frame in [setpoint.motor_frame(), setpoint.rudder_frame()] {
            if !enabled.load(Ordering::SeqCst) || !channel.is_open() {
                trace!(
                    target: "tiller::command",
                    label = channel.label(),
                    "control channel no longer open"
                );
                return;
            }
            if let Err(err) = channel.send_text(&frame).await {
                warn!(
                    target: "tiller::command",
                    label = channel.label(),
                    error = %err,
                    "control frame write failed"
                );
            }
        }
    }
}
