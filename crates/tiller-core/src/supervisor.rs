//! Owns the rendezvous link, the liveness monitor and the one live
//! [`SignalingSession`], and serializes everything that touches them on a
//! single task.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use transport_bus::{Bus, BusMessage, LinkState};

use crate::command::Setpoints;
use crate::config::{Config, InitiationPolicy, Topics, HEARTBEAT_TOKEN};
use crate::engine::{EngineEvent, PeerEngine};
use crate::heartbeat::HeartbeatMonitor;
use crate::session::{SessionOptions, SessionState, SignalingSession};
use crate::signaling::SignalingMessage;
use crate::telemetry::{TelemetryRouter, TelemetrySnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorStatus {
    pub link: LinkState,
    pub remote_online: bool,
    pub session: SessionState,
    pub data_channel_open: bool,
    pub attempt: u64,
}

impl Default for SupervisorStatus {
    fn default() -> Self {
        Self {
            link: LinkState::Down,
            remote_online: false,
            session: SessionState::Idle,
            data_channel_open: false,
            attempt: 0,
        }
    }
}

#[derive(Debug)]
enum SupervisorCommand {
    Connect,
    Disconnect,
    Shutdown,
}

/// Cloneable front of a running supervisor.
#[derive(Clone)]
pub struct SupervisorHandle {
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    status: watch::Receiver<SupervisorStatus>,
    telemetry: watch::Receiver<Arc<TelemetrySnapshot>>,
    setpoints: Setpoints,
}

impl SupervisorHandle {
    fn send(&self, command: SupervisorCommand) {
        if self.commands.send(command).is_err() {
            debug!(target: "tiller::supervisor", "supervisor already stopped");
        }
    }

    /// Local initiation intent.
    pub fn connect(&self) {
        self.send(SupervisorCommand::Connect);
    }

    pub fn disconnect(&self) {
        self.send(SupervisorCommand::Disconnect);
    }

    /// Disconnects and stops the supervisor task.
    pub fn shutdown(&self) {
        self.send(SupervisorCommand::Shutdown);
    }

    pub fn status(&self) -> watch::Receiver<SupervisorStatus> {
        self.status.clone()
    }

    pub fn telemetry(&self) -> watch::Receiver<Arc<TelemetrySnapshot>> {
        self.telemetry.clone()
    }

    pub fn setpoints(&self) -> &Setpoints {
        &self.setpoints
    }
}

pub struct SessionSupervisor {
    bus: Arc<dyn Bus>,
    topics: Topics,
    policy: InitiationPolicy,
    heartbeat_interval: Duration,
    heartbeat: Arc<HeartbeatMonitor>,
    evaluator: Option<JoinHandle<()>>,
    telemetry: Arc<TelemetryRouter>,
    session: SignalingSession,
    link: LinkState,
    status: watch::Sender<SupervisorStatus>,
    commands: mpsc::UnboundedReceiver<SupervisorCommand>,
    engine_events: mpsc::UnboundedReceiver<EngineEvent>,
}

impl SessionSupervisor {
    /// Spawns the supervisor task and returns its handle and join handle.
    pub fn spawn(
        config: &Config,
        bus: Arc<dyn Bus>,
        engine: Arc<dyn PeerEngine>,
    ) -> (SupervisorHandle, JoinHandle<()>) {
        let (command_tx, commands) = mpsc::unbounded_channel();
        let (event_tx, engine_events) = mpsc::unbounded_channel();
        let (status, status_rx) = watch::channel(SupervisorStatus::default());
        let setpoints = Setpoints::new();
        let telemetry = Arc::new(TelemetryRouter::new());
        let session = SignalingSession::new(
            SessionOptions::from(config),
            engine,
            Arc::clone(&bus),
            setpoints.clone(),
            Arc::clone(&telemetry),
            event_tx,
        );

        let handle = SupervisorHandle {
            commands: command_tx,
            status: status_rx,
            telemetry: telemetry.subscribe(),
            setpoints,
        };
        let supervisor = Self {
            bus,
            topics: config.topics(),
            policy: config.initiation,
            heartbeat_interval: config.heartbeat_interval,
            heartbeat: Arc::new(HeartbeatMonitor::new(config.heartbeat_timeout)),
            evaluator: None,
            telemetry,
            session,
            link: LinkState::Down,
            status,
            commands,
            engine_events,
        };
        (handle, tokio::spawn(supervisor.run()))
    }

    async fn run(mut self) {
        let mut link = self.bus.link_state();
        let mut signals = self.bus.subscribe(&self.topics.signal_in);
        let mut heartbeats = self.bus.subscribe(&self.topics.heartbeat_in);
        let mut telemetry = self.bus.subscribe(&self.topics.telemetry_in);
        let mut online = self.heartbeat.subscribe();
        let mut heartbeat_tick = tokio::time::interval(self.heartbeat_interval);
        heartbeat_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(target: "tiller::supervisor", policy = ?self.policy, signal = %self.topics.signal_in, "supervisor started");
        let initial = *link.borrow_and_update();
        if initial == LinkState::Up {
            self.on_link_up().await;
        }
        self.refresh_status();

        loop {
            tokio::select! {
                changed = link.changed() => {
                    if changed.is_err() {
                        warn!(target: "tiller::supervisor", "rendezvous bus dropped");
                        break;
                    }
                    let state = *link.borrow_and_update();
                    match state {
                        LinkState::Up => self.on_link_up().await,
                        LinkState::Down => self.on_link_down().await,
                    }
                }
                message = signals.recv() => match message {
                    Ok(message) => self.on_signal(message).await,
                    Err(err) => if !lagged(err, "signal") { break },
                },
                message = heartbeats.recv() => match message {
                    Ok(_) => self.heartbeat.record_heartbeat(),
                    Err(err) => if !lagged(err, "heartbeat") { break },
                },
                message = telemetry.recv() => match message {
                    Ok(message) => {
                        self.telemetry.apply_topic(&message.topic, &message.payload);
                    }
                    Err(err) => if !lagged(err, "telemetry") { break },
                },
                Some(event) = self.engine_events.recv() => {
                    self.session.handle_engine(event).await;
                }
                changed = online.changed() => {
                    if changed.is_ok() {
                        let remote_online = *online.borrow_and_update();
                        self.on_online_change(remote_online).await;
                    }
                }
                _ = heartbeat_tick.tick(), if self.link == LinkState::Up => {
                    if let Err(err) = self.bus.publish(&self.topics.heartbeat_out, Bytes::from_static(HEARTBEAT_TOKEN.as_bytes())) {
                        debug!(target: "tiller::supervisor", error = %err, "heartbeat not published");
                    }
                }
                command = self.commands.recv() => match command {
                    Some(SupervisorCommand::Connect) => {
                        info!(target: "tiller::supervisor", "local connect request");
                        self.session.initiate().await;
                    }
                    Some(SupervisorCommand::Disconnect) => {
                        info!(target: "tiller::supervisor", "local disconnect request");
                        self.session.disconnect().await;
                    }
                    Some(SupervisorCommand::Shutdown) | None => break,
                },
            }
            self.refresh_status();
        }

        self.session.disconnect().await;
        self.stop_evaluator();
        self.refresh_status();
        info!(target: "tiller::supervisor", "supervisor stopped");
    }

    async fn on_link_up(&mut self) {
        info!(target: "tiller::supervisor", "rendezvous link up");
        self.link = LinkState::Up;
        if self.evaluator.is_none() {
            self.evaluator = Some(self.heartbeat.spawn_evaluator(self.heartbeat_interval));
        }
        if self.policy == InitiationPolicy::OnConnect
            && self.heartbeat.remote_online()
            && self.session.is_idle()
        {
            self.session.initiate().await;
        }
    }

    async fn on_link_down(&mut self) {
        info!(target: "tiller::supervisor", "rendezvous link down");
        self.link = LinkState::Down;
        self.session.teardown("rendezvous link down").await;
        self.stop_evaluator();
        self.heartbeat.reset();
    }

    fn stop_evaluator(&mut self) {
        if let Some(evaluator) = self.evaluator.take() {
            evaluator.abort();
        }
    }

    async fn on_online_change(&mut self, remote_online: bool) {
        if remote_online
            && self.policy == InitiationPolicy::OnConnect
            && self.link == LinkState::Up
            && self.session.is_idle()
        {
            info!(target: "tiller::supervisor", "remote came online, initiating");
            self.session.initiate().await;
        }
    }

    async fn on_signal(&mut self, message: BusMessage) {
        let signal = match SignalingMessage::decode(&message.payload) {
            Ok(signal) => signal,
            Err(err) => {
                debug!(target: "tiller::supervisor", topic = %message.topic, error = %err, "dropping malformed signal");
                return;
            }
        };
        debug!(target: "tiller::supervisor", kind = signal.kind(), "signal received");
        if signal == SignalingMessage::Hello {
            self.heartbeat.record_heartbeat();
            match self.policy {
                InitiationPolicy::OnHello => self.session.initiate().await,
                InitiationPolicy::OnConnect if self.session.is_idle() => {
                    self.session.initiate().await
                }
                InitiationPolicy::OnConnect => {}
            }
            return;
        }
        self.session.handle_signal(signal).await;
    }

    fn refresh_status(&self) {
        let next = SupervisorStatus {
            link: self.link,
            remote_online: self.heartbeat.remote_online(),
            session: self.session.state(),
            data_channel_open: self.session.data_channel_open(),
            attempt: self.session.attempt(),
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Returns true when the subscription is still usable.
fn lagged(err: RecvError, stream: &'static str) -> bool {
    match err {
        RecvError::Lagged(skipped) => {
            warn!(target: "tiller::supervisor", stream, skipped, "subscriber lagged");
            true
        }
        RecvError::Closed => {
            warn!(target: "tiller::supervisor", stream, "subscription closed");
            false
        }
    }
}
