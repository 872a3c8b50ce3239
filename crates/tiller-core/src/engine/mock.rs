//! Scripted [`PeerEngine`] for tests: records every primitive invoked and
//! lets the test play the engine's callbacks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    ChannelOrigin, DataChannel, EngineError, EngineEventKind, EngineEventSender, EngineResult,
    IceServer, MediaKind, PeerConnection, PeerEngine, SessionDescription, TransceiverDirection,
};
use crate::signaling::IceCandidate;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreatePeerConnection { attempt: u64, ice_servers: usize },
    AddTransceiver { kind: MediaKind, direction: TransceiverDirection },
    CreateDataChannel { label: String },
    CreateOffer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidate),
    CloseDataChannel { label: String },
    ClosePeerConnection { attempt: u64 },
}

#[derive(Default)]
struct MockState {
    calls: Mutex<Vec<MockCall>>,
    events: Mutex<Option<EngineEventSender>>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    offers: AtomicU64,
    fail_offer: AtomicBool,
    fail_remote_description: AtomicBool,
}

impl MockState {
    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

#[derive(Clone, Default)]
pub struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.state.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&MockCall) -> bool) -> usize {
        self.state.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Candidates applied to any peer connection, in application order.
    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state
            .calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                MockCall::AddIceCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    /// Event sender of the most recently created peer connection.
    pub fn sender(&self) -> Option<EngineEventSender> {
        self.state.events.lock().clone()
    }

    /// Plays an engine callback on the most recent peer connection.
    pub fn emit(&self, kind: EngineEventKind) -> bool {
        match self.sender() {
            Some(sender) => sender.emit(kind),
            None => false,
        }
    }

    /// Marks the newest locally created channel called `label` open and
    /// reports it.
    pub fn open_channel(&self, label: &str) -> bool {
        self.set_channel_state(label, ChannelOrigin::Local, true)
    }

    /// Marks the newest locally created channel called `label` closed and
    /// reports it.
    pub fn close_channel(&self, label: &str) -> bool {
        self.set_channel_state(label, ChannelOrigin::Local, false)
    }

    /// Same as [`open_channel`](Self::open_channel) for a channel the remote
    /// announced.
    pub fn open_remote_channel(&self, label: &str) -> bool {
        self.set_channel_state(label, ChannelOrigin::Remote, true)
    }

    pub fn close_remote_channel(&self, label: &str) -> bool {
        self.set_channel_state(label, ChannelOrigin::Remote, false)
    }

    /// Plays the remote announcing a data channel of its own.
    pub fn announce_remote_channel(&self, label: &str) -> Arc<MockDataChannel> {
        let channel = self.new_channel(label, ChannelOrigin::Remote);
        self.emit(EngineEventKind::RemoteDataChannel(channel.clone()));
        channel
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        self.find_channel(label, ChannelOrigin::Local)
    }

    fn find_channel(&self, label: &str, origin: ChannelOrigin) -> Option<Arc<MockDataChannel>> {
        self.state
            .channels
            .lock()
            .iter()
            .rev()
            .find(|channel| channel.label == label && channel.origin == origin)
            .cloned()
    }

    fn set_channel_state(&self, label: &str, origin: ChannelOrigin, open: bool) -> bool {
        let Some(channel) = self.find_channel(label, origin) else {
            return false;
        };
        channel.open.store(open, Ordering::SeqCst);
        let label = label.to_string();
        self.emit(if open {
            EngineEventKind::DataChannelOpen { label, origin }
        } else {
            EngineEventKind::DataChannelClosed { label, origin }
        })
    }

    /// Text successfully written to every channel called `label`.
    pub fn sent(&self, label: &str) -> Vec<String> {
        self.state
            .channels
            .lock()
            .iter()
            .filter(|channel| channel.label == label)
            .flat_map(|channel| channel.sent())
            .collect()
    }

    pub fn fail_offer(&self, fail: bool) {
        self.state.fail_offer.store(fail, Ordering::SeqCst);
    }

    pub fn fail_remote_description(&self, fail: bool) {
        self.state.fail_remote_description.store(fail, Ordering::SeqCst);
    }

    fn new_channel(&self, label: &str, origin: ChannelOrigin) -> Arc<MockDataChannel> {
        let channel = Arc::new(MockDataChannel {
            label: label.to_string(),
            origin,
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            rejected_sends: AtomicU64::new(0),
            state: Arc::clone(&self.state),
        });
        self.state.channels.lock().push(channel.clone());
        channel
    }
}

#[async_trait]
impl PeerEngine for MockEngine {
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn PeerConnection>> {
        let attempt = events.attempt();
        self.state.record(MockCall::CreatePeerConnection {
            attempt,
            ice_servers: ice_servers.len(),
        });
        *self.state.events.lock() = Some(events);
        Ok(Arc::new(MockPeerConnection {
            attempt,
            engine: self.clone(),
        }))
    }
}

struct MockPeerConnection {
    attempt: u64,
    engine: MockEngine,
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> EngineResult<()> {
        self.engine.state.record(MockCall::AddTransceiver { kind, direction });
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> EngineResult<Arc<dyn DataChannel>> {
        self.engine.state.record(MockCall::CreateDataChannel {
            label: label.to_string(),
        });
        Ok(self.engine.new_channel(label, ChannelOrigin::Local))
    }

    async fn create_offer(&self) -> EngineResult<SessionDescription> {
        self.engine.state.record(MockCall::CreateOffer);
        if self.engine.state.fail_offer.load(Ordering::SeqCst) {
            return Err(EngineError::Description("scripted offer failure".into()));
        }
        let n = self.engine.state.offers.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionDescription::offer(format!("mock-offer-{n}")))
    }

    async fn set_local_description(&self, description: SessionDescription) -> EngineResult<()> {
        self.engine.state.record(MockCall::SetLocalDescription(description));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> EngineResult<()> {
        self.engine.state.record(MockCall::SetRemoteDescription(description));
        if self.engine.state.fail_remote_description.load(Ordering::SeqCst) {
            return Err(EngineError::Description("scripted answer rejection".into()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> EngineResult<()> {
        self.engine.state.record(MockCall::AddIceCandidate(candidate));
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.engine.state.record(MockCall::ClosePeerConnection {
            attempt: self.attempt,
        });
        Ok(())
    }
}

pub struct MockDataChannel {
    label: String,
    origin: ChannelOrigin,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
    rejected_sends: AtomicU64,
    state: Arc<MockState>,
}

impl MockDataChannel {
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    /// Writes attempted while the channel was not open.
    pub fn rejected_sends(&self) -> u64 {
        self.rejected_sends.load(Ordering::SeqCst)
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: &str) -> EngineResult<()> {
        if !self.is_open() {
            self.rejected_sends.fetch_add(1, Ordering::SeqCst);
            return Err(EngineError::DataChannel(format!("{} is not open", self.label)));
        }
        self.sent.lock().push(text.to_string());
        Ok(())
    }

    async fn close(&self) -> EngineResult<()> {
        self.open.store(false, Ordering::SeqCst);
        self.state.record(MockCall::CloseDataChannel {
            label: self.label.clone(),
        });
        Ok(())
    }
}
