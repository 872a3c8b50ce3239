//! One negotiation attempt against the vehicle.
//!
//! The operator side is always the offerer: it opens the peer connection,
//! creates the control data channel and sends the offer. An incoming `offer`
//! is never answered. A session is driven by a single owner (the supervisor
//! task), so every transition below runs to completion before the next
//! message or engine event is looked at.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use transport_bus::Bus;

use crate::command::{CommandPublisher, Setpoints};
use crate::config::Config;
use crate::engine::{
    ChannelOrigin, DataChannel, EngineEvent, EngineEventKind, EngineEventSender, IceServer,
    MediaKind, PeerConnection, PeerEngine, PeerState, SessionDescription, TransceiverDirection,
};
use crate::error::TillerResult;
use crate::ice_buffer::IceCandidateBuffer;
use crate::signaling::{IceCandidate, SignalingMessage};
use crate::telemetry::TelemetryRouter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Initiating,
    OfferSent,
    Connected,
    Closing,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Initiating => "initiating",
            Self::OfferSent => "offer-sent",
            Self::Connected => "connected",
            Self::Closing => "closing",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Per-session settings, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub ice_servers: Vec<IceServer>,
    pub control_label: String,
    pub receive_media: Vec<MediaKind>,
    pub candidate_limit: usize,
    pub command_period: Duration,
    /// Topic outbound signaling messages are published on.
    pub signal_topic: String,
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            control_label: config.control_label.clone(),
            receive_media: config.receive_media.clone(),
            candidate_limit: config.candidate_limit,
            command_period: config.command_period,
            signal_topic: config.topics().signal_out,
        }
    }
}

pub struct SignalingSession {
    options: SessionOptions,
    engine: Arc<dyn PeerEngine>,
    bus: Arc<dyn Bus>,
    telemetry: Arc<TelemetryRouter>,
    events: mpsc::UnboundedSender<EngineEvent>,
    attempt: u64,
    state: SessionState,
    peer: Option<Arc<dyn PeerConnection>>,
    control: Option<Arc<dyn DataChannel>>,
    remote_channels: Vec<Arc<dyn DataChannel>>,
    pending: IceCandidateBuffer,
    remote_description_set: bool,
    data_channel_open: bool,
    publisher: CommandPublisher,
}

impl SignalingSession {
    pub fn new(
        options: SessionOptions,
        engine: Arc<dyn PeerEngine>,
        bus: Arc<dyn Bus>,
        setpoints: Setpoints,
        telemetry: Arc<TelemetryRouter>,
        events: mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        let pending = IceCandidateBuffer::with_limit(options.candidate_limit);
        let publisher = CommandPublisher::new(setpoints, options.command_period);
        Self {
            options,
            engine,
            bus,
            telemetry,
            events,
            attempt: 0,
            state: SessionState::Idle,
            peer: None,
            control: None,
            remote_channels: Vec::new(),
            pending,
            remote_description_set: false,
            data_channel_open: false,
            publisher,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Counter of negotiation attempts started so far.
    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub fn is_idle(&self) -> bool {
        self.state == SessionState::Idle
    }

    pub fn data_channel_open(&self) -> bool {
        self.data_channel_open
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending.len()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!(
                target: "tiller::session",
                attempt = self.attempt,
                from = %self.state,
                to = %next,
                "session state"
            );
            self.state = next;
        }
    }

    fn send_signal(&self, message: &SignalingMessage) -> TillerResult<()> {
        let payload = message.encode()?;
        self.bus
            .publish(&self.options.signal_topic, Bytes::from(payload))?;
        debug!(target: "tiller::session", kind = message.kind(), "signal sent");
        Ok(())
    }

    /// Starts a fresh negotiation, tearing down whatever was live first.
    pub async fn initiate(&mut self) {
        if !self.is_idle() {
            self.teardown("re-initiation").await;
        }
        self.attempt += 1;
        self.transition(SessionState::Initiating);
        if let Err(err) = self.negotiate().await {
            self.fail(err).await;
        }
    }

    async fn negotiate(&mut self) -> TillerResult<()> {
        let sender = EngineEventSender::new(self.attempt, self.events.clone());
        let peer = self
            .engine
            .create_peer_connection(&self.options.ice_servers, sender)
            .await?;
        self.peer = Some(Arc::clone(&peer));

        for kind in &self.options.receive_media {
            peer.add_transceiver(*kind, TransceiverDirection::RecvOnly)
                .await?;
        }
        self.control = Some(peer.create_data_channel(&self.options.control_label).await?);

        let offer = peer.create_offer().await?;
        self.transition(SessionState::OfferSent);
        peer.set_local_description(offer.clone()).await?;
        self.send_signal(&SignalingMessage::Offer { sdp: offer.sdp })?;
        Ok(())
    }

    /// Applies an inbound signaling message. `hello` is the supervisor's
    /// business and is ignored here.
    pub async fn handle_signal(&mut self, message: SignalingMessage) {
        match message {
            SignalingMessage::Answer { sdp } => self.apply_answer(sdp).await,
            SignalingMessage::IceCandidate(candidate) => {
                self.apply_remote_candidate(candidate).await
            }
            SignalingMessage::Bye | SignalingMessage::Busy => {
                if self.is_idle() {
                    debug!(target: "tiller::session", kind = message.kind(), "ignoring while idle");
                } else {
                    info!(
                        target: "tiller::session",
                        attempt = self.attempt,
                        kind = message.kind(),
                        "remote ended session"
                    );
                    self.teardown(message.kind()).await;
                }
            }
            SignalingMessage::Offer { .. } => {
                debug!(target: "tiller::session", "ignoring remote offer; operator always offers");
            }
            SignalingMessage::Hello => {}
        }
    }

    async fn apply_answer(&mut self, sdp: String) {
        if self.state != SessionState::OfferSent || self.remote_description_set {
            debug!(
                target: "tiller::session",
                attempt = self.attempt,
                state = %self.state,
                "ignoring answer"
            );
            return;
        }
        let Some(peer) = self.peer.clone() else {
            return;
        };
        if let Err(err) = peer
            .set_remote_description(SessionDescription::answer(sdp))
            .await
        {
            self.fail(err.into()).await;
            return;
        }
        self.remote_description_set = true;

        let buffered = self.pending.drain();
        debug!(target: "tiller::session", count = buffered.len(), "flushing buffered candidates");
        for candidate in buffered {
            add_candidate(peer.as_ref(), candidate).await;
        }
    }

    async fn apply_remote_candidate(&mut self, candidate: IceCandidate) {
        if matches!(self.state, SessionState::Idle | SessionState::Closing) {
            debug!(target: "tiller::session", "dropping candidate without a live session");
            return;
        }
        match (&self.peer, self.remote_description_set) {
            (Some(peer), true) => add_candidate(peer.as_ref(), candidate).await,
            _ => {
                if let Some(evicted) = self.pending.push(candidate) {
                    debug!(
                        target: "tiller::session",
                        candidate = %evicted.candidate,
                        "candidate buffer full, dropped oldest"
                    );
                }
            }
        }
    }

    /// Applies a peer-connection engine callback. Events produced by an
    /// earlier attempt are dropped.
    pub async fn handle_engine(&mut self, event: EngineEvent) {
        if event.attempt != self.attempt || self.is_idle() {
            debug!(
                target: "tiller::session",
                attempt = event.attempt,
                current = self.attempt,
                kind = ?event.kind,
                "dropping stale engine event"
            );
            return;
        }

        match event.kind {
            EngineEventKind::LocalCandidate(candidate) => {
                if let Err(err) = self.send_signal(&SignalingMessage::IceCandidate(candidate)) {
                    warn!(
                        target: "tiller::session",
                        error = %err,
                        "failed to send local candidate"
                    );
                }
            }
            EngineEventKind::ConnectionState(PeerState::Connected) => {
                if self.state == SessionState::OfferSent && self.remote_description_set {
                    self.transition(SessionState::Connected);
                }
            }
            EngineEventKind::ConnectionState(PeerState::Failed) => {
                warn!(target: "tiller::session", attempt = self.attempt, "peer connection failed");
                self.transition(SessionState::Failed);
                self.teardown("peer connection failed").await;
            }
            EngineEventKind::ConnectionState(PeerState::Closed) => {
                self.teardown("peer connection closed").await;
            }
            EngineEventKind::ConnectionState(state) => {
                debug!(
                    target: "tiller::session",
                    attempt = self.attempt,
                    ?state,
                    "peer connection state"
                );
            }
            EngineEventKind::RemoteDataChannel(channel) => {
                info!(target: "tiller::session", label = channel.label(), "remote data channel");
                self.remote_channels.push(channel);
            }
            EngineEventKind::DataChannelOpen { label, origin } => {
                match self.control.clone() {
                    Some(control) if self.is_control(&label, origin) => {
                        info!(
                            target: "tiller::session",
                            attempt = self.attempt,
                            label = %label,
                            "control channel open"
                        );
                        self.data_channel_open = true;
                        self.publisher.start(control);
                    }
                    _ => {
                        debug!(
                            target: "tiller::session",
                            label = %label,
                            ?origin,
                            "data channel open"
                        );
                    }
                }
            }
            EngineEventKind::DataChannelClosed { label, origin } => {
                if self.data_channel_open && self.is_control(&label, origin) {
                    info!(
                        target: "tiller::session",
                        attempt = self.attempt,
                        label = %label,
                        "control channel closed"
                    );
                    self.data_channel_open = false;
                    self.publisher.stop();
                } else {
                    debug!(
                        target: "tiller::session",
                        label = %label,
                        ?origin,
                        "data channel closed"
                    );
                }
            }
            EngineEventKind::DataChannelMessage { text, .. } => {
                self.telemetry.apply_record(&text);
            }
            EngineEventKind::Track { kind } => {
                info!(target: "tiller::session", attempt = self.attempt, ?kind, "remote track");
            }
        }
    }

    /// Local request to end the session: tells the remote, then tears down.
    pub async fn disconnect(&mut self) {
        if self.is_idle() {
            return;
        }
        if let Err(err) = self.send_signal(&SignalingMessage::Bye) {
            warn!(target: "tiller::session", error = %err, "failed to send bye");
        }
        self.teardown("local disconnect").await;
    }

    /// Only the channel this side created carries commands; the remote may
    /// open one under the same label.
    fn is_control(&self, label: &str, origin: ChannelOrigin) -> bool {
        origin == ChannelOrigin::Local && label == self.options.control_label
    }

    async fn fail(&mut self, err: crate::error::TillerError) {
        warn!(
            target: "tiller::session",
            attempt = self.attempt,
            error = %err,
            "negotiation failed"
        );
        self.transition(SessionState::Failed);
        self.teardown("negotiation failure").await;
    }

    /// Releases every resource of the current attempt and returns to idle.
    /// Each channel and the peer connection are closed at most once.
    pub async fn teardown(&mut self, reason: &str) {
        if self.is_idle() && self.peer.is_none() {
            return;
        }
        self.transition(SessionState::Closing);
        self.publisher.stop();
        self.data_channel_open = false;

        if let Some(control) = self.control.take() {
            if let Err(err) = control.close().await {
                debug!(target: "tiller::session", error = %err, "closing control channel");
            }
        }
        for channel in self.remote_channels.drain(..) {
            if let Err(err) = channel.close().await {
                debug!(
                    target: "tiller::session",
                    label = channel.label(),
                    error = %err,
                    "closing remote channel"
                );
            }
        }
        if let Some(peer) = self.peer.take() {
            if let Err(err) = peer.close().await {
                debug!(target: "tiller::session", error = %err, "closing peer connection");
            }
        }
        self.pending.clear();
        self.remote_description_set = false;
        info!(target: "tiller::session", attempt = self.attempt, reason, "session torn down");
        self.transition(SessionState::Idle);
    }
}

async fn add_candidate(peer: &dyn PeerConnection, candidate: IceCandidate) {
    if let Err(err) = peer.add_ice_candidate(candidate).await {
        warn!(target: "tiller::session", error = %err, "remote candidate rejected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::mock::MockCall;
    use crate::engine::MockEngine;
    use test_timeout::tokio_timeout_test;
    use tokio::sync::broadcast;
    use transport_bus::{BusMessage, LinkState, LocalBus};

    struct Harness {
        engine: MockEngine,
        bus: Arc<LocalBus>,
        outbound: broadcast::Receiver<BusMessage>,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        session: SignalingSession,
    }

    impl Harness {
        fn new() -> Self {
            let engine = MockEngine::new();
            let bus = Arc::new(LocalBus::new());
            let options = SessionOptions::from(&Config::default());
            let outbound = bus.subscribe(&options.signal_topic);
            let (tx, events) = mpsc::unbounded_channel();
            let session = SignalingSession::new(
                options,
                Arc::new(engine.clone()),
                bus.clone(),
                Setpoints::new(),
                Arc::new(TelemetryRouter::new()),
                tx,
            );
            Self {
                engine,
                bus,
                outbound,
                events,
                session,
            }
        }

        async fn pump(&mut self) {
            while let Ok(event) = self.events.try_recv() {
                self.session.handle_engine(event).await;
            }
        }

        fn sent(&mut self) -> Vec<SignalingMessage> {
            let mut out = Vec::new();
            while let Ok(msg) = self.outbound.try_recv() {
                out.push(SignalingMessage::decode(&msg.payload).expect("valid signal"));
            }
            out
        }
    }

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000 typ host"),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    fn answer() -> SignalingMessage {
        SignalingMessage::Answer {
            sdp: "v=0 answer".into(),
        }
    }

    fn closes(engine: &MockEngine) -> usize {
        engine.count(|call| {
            matches!(
                call,
                MockCall::ClosePeerConnection { .. } | MockCall::CloseDataChannel { .. }
            )
        })
    }

    #[tokio_timeout_test(10)]
    async fn initiate_sends_a_recvonly_offer() {
        let mut h = Harness::new();
        h.session.initiate().await;

        assert_eq!(h.session.state(), SessionState::OfferSent);
        assert_eq!(
            h.engine.calls(),
            vec![
                MockCall::CreatePeerConnection {
                    attempt: 1,
                    ice_servers: 1
                },
                MockCall::AddTransceiver {
                    kind: MediaKind::Video,
                    direction: TransceiverDirection::RecvOnly
                },
                MockCall::CreateDataChannel {
                    label: "control".into()
                },
                MockCall::CreateOffer,
                MockCall::SetLocalDescription(SessionDescription::offer("mock-offer-1")),
            ]
        );
        assert_eq!(
            h.sent(),
            vec![SignalingMessage::Offer {
                sdp: "mock-offer-1".into()
            }]
        );
    }

    #[tokio_timeout_test(10)]
    async fn only_the_first_answer_is_applied() {
        let mut h = Harness::new();
        h.session.initiate().await;
        h.session.handle_signal(answer()).await;
        h.engine.emit(EngineEventKind::ConnectionState(PeerState::Connected));
        h.pump().await;
        assert_eq!(h.session.state(), SessionState::Connected);

        h.session.handle_signal(answer()).await;
        assert_eq!(
            h.engine
                .count(|call| matches!(call, MockCall::SetRemoteDescription(_))),
            1
        );
    }

    #[tokio_timeout_test(10)]
    async fn early_candidates_flush_in_order_after_answer() {
        let mut h = Harness::new();
        h.session.initiate().await;
        for n in 1..=3 {
            h.session
                .handle_signal(SignalingMessage::IceCandidate(candidate(n)))
                .await;
        }
        assert_eq!(h.session.pending_candidates(), 3);
        assert!(h.engine.applied_candidates().is_empty());

        h.session.handle_signal(answer()).await;
        assert_eq!(h.session.pending_candidates(), 0);
        assert_eq!(
            h.engine.applied_candidates(),
            vec![candidate(1), candidate(2), candidate(3)]
        );

        h.session
            .handle_signal(SignalingMessage::IceCandidate(candidate(4)))
            .await;
        assert_eq!(h.session.pending_candidates(), 0);
        assert_eq!(h.engine.applied_candidates().len(), 4);
        assert_eq!(h.engine.applied_candidates()[3], candidate(4));
    }

    #[tokio_timeout_test(10)]
    async fn candidate_buffer_drops_oldest_when_full() {
        let mut h = Harness::new();
        h.session.initiate().await;
        for n in 0..70 {
            h.session
                .handle_signal(SignalingMessage::IceCandidate(candidate(n)))
                .await;
        }
        assert_eq!(h.session.pending_candidates(), 64);
        h.session.handle_signal(answer()).await;
        let applied = h.engine.applied_candidates();
        assert_eq!(applied.len(), 64);
        assert_eq!(applied[0], candidate(6));
    }

    #[tokio_timeout_test(10)]
    async fn local_candidates_are_sent_immediately() {
        let mut h = Harness::new();
        h.session.initiate().await;
        h.sent();
        h.engine.emit(EngineEventKind::LocalCandidate(candidate(9)));
        h.pump().await;
        assert_eq!(h.sent(), vec![SignalingMessage::IceCandidate(candidate(9))]);
        assert_eq!(h.session.pending_candidates(), 0);
    }

    #[tokio_timeout_test(10)]
    async fn bye_while_connected_releases_everything_once() {
        let mut h = Harness::new();
        h.session.initiate().await;
        h.session.handle_signal(answer()).await;
        h.engine.emit(EngineEventKind::ConnectionState(PeerState::Connected));
        h.engine.announce_remote_channel("telemetry");
        h.engine.open_channel("control");
        h.pump().await;
        assert!(h.session.data_channel_open());

        h.session.handle_signal(SignalingMessage::Bye).await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.data_channel_open());
        assert_eq!(closes(&h.engine), 3);

        h.session.handle_signal(SignalingMessage::Bye).await;
        h.session.teardown("again").await;
        h.engine.emit(EngineEventKind::ConnectionState(PeerState::Closed));
        h.pump().await;
        assert_eq!(closes(&h.engine), 3);
    }

    #[tokio_timeout_test(10)]
    async fn reinitiation_tears_down_the_previous_attempt() {
        let mut h = Harness::new();
        h.session.initiate().await;
        h.session.initiate().await;

        assert_eq!(h.session.attempt(), 2);
        assert_eq!(h.session.state(), SessionState::OfferSent);
        assert_eq!(
            h.engine
                .count(|call| matches!(call, MockCall::ClosePeerConnection { attempt: 1 })),
            1
        );
        assert_eq!(
            h.engine
                .count(|call| matches!(call, MockCall::ClosePeerConnection { attempt: 2 })),
            0
        );
    }

    #[tokio_timeout_test(10)]
    async fn stale_engine_events_are_dropped() {
        let mut h = Harness::new();
        h.session.initiate().await;
        let stale = h.engine.sender().expect("sender");
        h.session.initiate().await;
        h.sent();

        stale.emit(EngineEventKind::LocalCandidate(candidate(1)));
        stale.emit(EngineEventKind::ConnectionState(PeerState::Failed));
        h.pump().await;

        assert_eq!(h.session.state(), SessionState::OfferSent);
        assert!(h.sent().is_empty());
    }

    #[tokio_timeout_test(10)]
    async fn offer_failure_returns_to_idle() {
        let mut h = Harness::new();
        h.engine.fail_offer(true);
        h.session.initiate().await;

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.sent().is_empty());
        assert_eq!(
            h.engine
                .count(|call| matches!(call, MockCall::ClosePeerConnection { .. })),
            1
        );
    }

    #[tokio_timeout_test(10)]
    async fn rejected_answer_tears_down() {
        let mut h = Harness::new();
        h.engine.fail_remote_description(true);
        h.session.initiate().await;
        h.session
            .handle_signal(SignalingMessage::IceCandidate(candidate(1)))
            .await;
        h.session.handle_signal(answer()).await;

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(h.engine.applied_candidates().is_empty());
        assert_eq!(h.session.pending_candidates(), 0);
    }

    #[tokio_timeout_test(10)]
    async fn offer_publish_failure_is_a_negotiation_fault() {
        let mut h = Harness::new();
        h.bus.set_link_state(LinkState::Down);
        h.session.initiate().await;
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio_timeout_test(10)]
    async fn remote_offer_and_idle_candidates_are_ignored() {
        let mut h = Harness::new();
        h.session
            .handle_signal(SignalingMessage::IceCandidate(candidate(1)))
            .await;
        h.session
            .handle_signal(SignalingMessage::Offer { sdp: "v=0".into() })
            .await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert_eq!(h.session.pending_candidates(), 0);
        assert!(h.engine.calls().is_empty());
    }

    #[tokio_timeout_test(10, paused)]
    async fn control_channel_gates_the_publisher() {
        let mut h = Harness::new();
        h.session.initiate().await;
        h.session.handle_signal(answer()).await;
        h.engine.open_channel("control");
        h.pump().await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!h.engine.sent("control").is_empty());

        h.engine.close_channel("control");
        h.pump().await;
        assert!(!h.session.data_channel_open());
        let frozen = h.engine.sent("control").len();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.engine.sent("control").len(), frozen);
    }

    #[tokio_timeout_test(10, paused)]
    async fn remote_channel_named_control_does_not_drive_the_publisher() {
        let mut h = Harness::new();
        h.session.initiate().await;
        h.session.handle_signal(answer()).await;
        h.engine.emit(EngineEventKind::ConnectionState(PeerState::Connected));
        h.engine.announce_remote_channel("control");
        h.engine.open_remote_channel("control");
        h.pump().await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!h.session.data_channel_open());
        assert!(h.engine.sent("control").is_empty());

        h.engine.open_channel("control");
        h.pump().await;
        assert!(h.session.data_channel_open());

        h.engine.close_remote_channel("control");
        h.pump().await;
        assert!(h.session.data_channel_open());
        tokio::time::sleep(Duration::from_millis(250)).await;
        let local = h.engine.channel("control").expect("local control channel");
        let before = local.sent().len();
        assert!(before > 0);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(local.sent().len() > before);
    }

    #[tokio_timeout_test(10)]
    async fn busy_tears_down_offer() {
        let mut h = Harness::new();
        h.session.initiate().await;
        assert_eq!(h.session.state(), SessionState::OfferSent);

        h.session.handle_signal(SignalingMessage::Busy).await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.data_channel_open());
        assert_eq!(
            h.engine
                .count(|call| matches!(call, MockCall::ClosePeerConnection { attempt: 1 })),
            1
        );
        assert!(h.sent().iter().all(|m| *m != SignalingMessage::Bye));
    }

    #[tokio_timeout_test(10)]
    async fn engine_failure_while_connected_releases_once() {
        let mut h = Harness::new();
        h.session.initiate().await;
        h.session.handle_signal(answer()).await;
        h.engine.emit(EngineEventKind::ConnectionState(PeerState::Connected));
        h.engine.open_channel("control");
        h.pump().await;
        assert_eq!(h.session.state(), SessionState::Connected);
        assert!(h.session.data_channel_open());

        h.engine.emit(EngineEventKind::ConnectionState(PeerState::Failed));
        h.pump().await;
        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.data_channel_open());

        h.engine.emit(EngineEventKind::ConnectionState(PeerState::Closed));
        h.pump().await;
        assert_eq!(
            h.engine
                .count(|call| matches!(call, MockCall::ClosePeerConnection { attempt: 1 })),
            1
        );
    }

    #[tokio_timeout_test(10)]
    async fn engine_close_while_offering_releases_once() {
        let mut h = Harness::new();
        h.session.initiate().await;
        h.engine.emit(EngineEventKind::ConnectionState(PeerState::Closed));
        h.engine.emit(EngineEventKind::ConnectionState(PeerState::Closed));
        h.pump().await;

        assert_eq!(h.session.state(), SessionState::Idle);
        assert!(!h.session.data_channel_open());
        assert_eq!(
            h.engine
                .count(|call| matches!(call, MockCall::ClosePeerConnection { attempt: 1 })),
            1
        );
    }

    #[tokio_timeout_test(10)]
    async fn local_disconnect_sends_bye() {
        let mut h = Harness::new();
        h.session.disconnect().await;
        assert!(h.sent().is_empty());

        h.session.initiate().await;
        h.sent();
        h.session.disconnect().await;
        assert_eq!(h.sent(), vec![SignalingMessage::Bye]);
        assert_eq!(h.session.state(), SessionState::Idle);
    }

    #[tokio_timeout_test(10)]
    async fn data_channel_text_feeds_telemetry() {
        let mut h = Harness::new();
        let telemetry = Arc::clone(&h.session.telemetry);
        h.session.initiate().await;
        h.engine.emit(EngineEventKind::DataChannelMessage {
            label: "telemetry".into(),
            text: "voltage:12.4".into(),
        });
        h.pump().await;
        assert_eq!(telemetry.snapshot().boat_voltage, "12.4");
    }
}
