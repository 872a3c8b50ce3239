use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use test_timeout::tokio_timeout_test;
use tiller_core::engine::mock::MockCall;
use tiller_core::engine::{EngineEventKind, PeerState};
use tiller_core::{
    Config, ControlSetpoint, InitiationPolicy, MockEngine, SessionState, SessionSupervisor,
    SignalingMessage, SupervisorHandle, Topics,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use transport_bus::{Bus, BusMessage, LinkState, LocalBus};

struct Rig {
    bus: Arc<LocalBus>,
    engine: MockEngine,
    topics: Topics,
    handle: SupervisorHandle,
    task: JoinHandle<()>,
}

impl Rig {
    async fn start(policy: InitiationPolicy) -> Self {
        let config = Config {
            initiation: policy,
            ..Config::default()
        };
        let bus = Arc::new(LocalBus::new());
        let engine = MockEngine::new();
        let (handle, task) =
            SessionSupervisor::spawn(&config, bus.clone(), Arc::new(engine.clone()));
        handle
            .status()
            .wait_for(|status| status.link == LinkState::Up)
            .await
            .expect("supervisor running");
        Self {
            bus,
            engine,
            topics: config.topics(),
            handle,
            task,
        }
    }

    fn outbound_signals(&self) -> broadcast::Receiver<BusMessage> {
        self.bus.subscribe(&self.topics.signal_out)
    }

    fn remote_signal(&self, message: SignalingMessage) {
        let payload = message.encode().expect("encodable");
        self.bus
            .publish(&self.topics.signal_in, Bytes::from(payload))
            .expect("link up");
    }

    fn remote_heartbeat(&self) {
        self.bus
            .publish(&self.topics.heartbeat_in, Bytes::from_static(b"alive"))
            .expect("link up");
    }

    async fn wait_status(&self, predicate: impl FnMut(&tiller_core::SupervisorStatus) -> bool) {
        self.handle
            .status()
            .wait_for(predicate)
            .await
            .expect("supervisor running");
    }

    fn peer_closes(&self) -> usize {
        self.engine
            .count(|call| matches!(call, MockCall::ClosePeerConnection { .. }))
    }

    async fn stop(self) {
        self.handle.shutdown();
        self.task.await.expect("supervisor task");
    }
}

async fn next_signal(rx: &mut broadcast::Receiver<BusMessage>) -> SignalingMessage {
    let message = rx.recv().await.expect("outbound signal");
    SignalingMessage::decode(&message.payload).expect("valid signal")
}

async fn until(condition: impl Fn() -> bool) {
    while !condition() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn offer(n: u32) -> SignalingMessage {
    SignalingMessage::Offer {
        sdp: format!("mock-offer-{n}"),
    }
}

#[tokio_timeout_test(10, paused)]
async fn hello_negotiates_publishes_commands_and_bye_releases() {
    let rig = Rig::start(InitiationPolicy::OnHello).await;
    let mut outbound = rig.outbound_signals();

    rig.remote_signal(SignalingMessage::Hello);
    assert_eq!(next_signal(&mut outbound).await, offer(1));

    rig.remote_signal(SignalingMessage::Answer {
        sdp: "v=0 answer".into(),
    });
    until(|| {
        rig.engine
            .count(|call| matches!(call, MockCall::SetRemoteDescription(_)))
            == 1
    })
    .await;
    rig.engine
        .emit(EngineEventKind::ConnectionState(PeerState::Connected));
    rig.engine.open_channel("control");
    rig.wait_status(|s| s.session == SessionState::Connected && s.data_channel_open)
        .await;

    rig.handle
        .setpoints()
        .set(ControlSetpoint::new(0.5, -0.5));
    tokio::time::sleep(Duration::from_millis(300)).await;
    let frames = rig.engine.sent("control");
    assert!(frames.contains(&"M50,1\n".to_string()), "frames {frames:?}");
    assert!(frames.contains(&"R-23\n".to_string()), "frames {frames:?}");

    rig.remote_signal(SignalingMessage::Bye);
    rig.wait_status(|s| s.session == SessionState::Idle && !s.data_channel_open)
        .await;
    assert_eq!(rig.peer_closes(), 1);

    let frozen = rig.engine.sent("control").len();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(rig.engine.sent("control").len(), frozen);
    rig.stop().await;
}

#[tokio_timeout_test(10, paused)]
async fn repeated_hello_restarts_negotiation() {
    let rig = Rig::start(InitiationPolicy::OnHello).await;
    let mut outbound = rig.outbound_signals();

    rig.remote_signal(SignalingMessage::Hello);
    assert_eq!(next_signal(&mut outbound).await, offer(1));
    rig.remote_signal(SignalingMessage::Hello);
    assert_eq!(next_signal(&mut outbound).await, offer(2));

    rig.wait_status(|s| s.attempt == 2 && s.session == SessionState::OfferSent)
        .await;
    assert_eq!(
        rig.engine
            .count(|call| matches!(call, MockCall::ClosePeerConnection { attempt: 1 })),
        1
    );
    rig.stop().await;
}

#[tokio_timeout_test(10, paused)]
async fn connect_policy_waits_for_the_remote_and_link() {
    let rig = Rig::start(InitiationPolicy::OnConnect).await;
    let mut outbound = rig.outbound_signals();
    assert!(rig.engine.calls().is_empty());

    rig.remote_heartbeat();
    assert_eq!(next_signal(&mut outbound).await, offer(1));
    rig.wait_status(|s| s.remote_online && s.session == SessionState::OfferSent)
        .await;

    rig.bus.set_link_state(LinkState::Down);
    rig.wait_status(|s| {
        s.link == LinkState::Down && s.session == SessionState::Idle && !s.remote_online
    })
    .await;
    assert_eq!(rig.peer_closes(), 1);

    rig.bus.set_link_state(LinkState::Up);
    rig.wait_status(|s| s.link == LinkState::Up).await;
    assert_eq!(rig.engine.count(|call| matches!(call, MockCall::CreateOffer)), 1);

    rig.remote_heartbeat();
    assert_eq!(next_signal(&mut outbound).await, offer(2));
    rig.stop().await;
}

#[tokio_timeout_test(10, paused)]
async fn remote_goes_offline_without_heartbeats() {
    let rig = Rig::start(InitiationPolicy::OnHello).await;
    rig.remote_heartbeat();
    rig.wait_status(|s| s.remote_online).await;

    tokio::time::sleep(Duration::from_millis(2_600)).await;
    assert!(!rig.handle.status().borrow().remote_online);
    assert_eq!(rig.handle.status().borrow().session, SessionState::Idle);
    rig.stop().await;
}

#[tokio_timeout_test(10, paused)]
async fn operator_heartbeats_flow_while_linked() {
    let rig = Rig::start(InitiationPolicy::OnHello).await;
    let mut beats = rig.bus.subscribe(&rig.topics.heartbeat_out);
    for _ in 0..2 {
        let beat = beats.recv().await.expect("heartbeat");
        assert_eq!(&beat.payload[..], b"alive");
    }
    rig.stop().await;
}

#[tokio_timeout_test(10, paused)]
async fn local_connect_and_disconnect() {
    let rig = Rig::start(InitiationPolicy::OnHello).await;
    let mut outbound = rig.outbound_signals();

    rig.bus
        .publish(&rig.topics.signal_in, Bytes::from_static(b"not json"))
        .expect("link up");
    rig.handle.connect();
    assert_eq!(next_signal(&mut outbound).await, offer(1));

    rig.handle.disconnect();
    assert_eq!(next_signal(&mut outbound).await, SignalingMessage::Bye);
    rig.wait_status(|s| s.session == SessionState::Idle).await;
    assert_eq!(rig.peer_closes(), 1);
    rig.stop().await;
}

#[tokio_timeout_test(10, paused)]
async fn telemetry_topics_update_the_snapshot() {
    let rig = Rig::start(InitiationPolicy::OnHello).await;
    rig.bus
        .publish(
            "tiller/boat/vehicle/telemetry/stm32:voltage",
            Bytes::from_static(b"12.1"),
        )
        .expect("link up");
    rig.handle
        .telemetry()
        .wait_for(|snapshot| snapshot.boat_voltage == "12.1")
        .await
        .expect("supervisor running");
    assert_eq!(rig.handle.telemetry().borrow().phone_gps, "unknown");
    rig.stop().await;
}

#[tokio_timeout_test(10, paused)]
async fn shutdown_says_bye_to_a_live_session() {
    let rig = Rig::start(InitiationPolicy::OnHello).await;
    let mut outbound = rig.outbound_signals();
    rig.remote_signal(SignalingMessage::Hello);
    assert_eq!(next_signal(&mut outbound).await, offer(1));

    rig.handle.shutdown();
    assert_eq!(next_signal(&mut outbound).await, SignalingMessage::Bye);
    let Rig { task, engine, .. } = rig;
    task.await.expect("supervisor task");
    assert_eq!(
        engine.count(|call| matches!(call, MockCall::ClosePeerConnection { .. })),
        1
    );
}
