//! Seam between the signaling core and a peer-connection engine.
//!
//! The engine owns SDP generation, ICE gathering and the data channels. Its
//! callbacks run on engine-owned tasks and are only ever surfaced as
//! [`EngineEvent`]s pushed into the owning session's queue; nothing here
//! mutates session state directly.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::signaling::IceCandidate;

pub mod mock;
pub mod rtc;

pub use mock::MockEngine;
pub use rtc::WebRtcEngine;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("peer connection setup failed: {0}")]
    Setup(String),
    #[error("session description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("data channel error: {0}")]
    DataChannel(String),
    #[error("peer connection closed")]
    Closed,
}

pub type EngineResult<T> = Result<T, EngineError>;

/// A NAT-traversal server descriptor, forwarded verbatim to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    RecvOnly,
}

/// Which side opened a data channel. Labels are not unique across sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    Local,
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

pub enum EngineEventKind {
    LocalCandidate(IceCandidate),
    ConnectionState(PeerState),
    /// A data channel announced by the remote side.
    RemoteDataChannel(Arc<dyn DataChannel>),
    DataChannelOpen { label: String, origin: ChannelOrigin },
    DataChannelClosed { label: String, origin: ChannelOrigin },
    DataChannelMessage { label: String, text: String },
    Track { kind: MediaKind },
}

impl std::fmt::Debug for EngineEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            Self::ConnectionState(state) => f.debug_tuple("ConnectionState").field(state).finish(),
            Self::RemoteDataChannel(channel) => f
                .debug_tuple("RemoteDataChannel")
                .field(&channel.label())
                .finish(),
            Self::DataChannelOpen { label, origin } => f
                .debug_struct("DataChannelOpen")
                .field("label", label)
                .field("origin", origin)
                .finish(),
            Self::DataChannelClosed { label, origin } => f
                .debug_struct("DataChannelClosed")
                .field("label", label)
                .field("origin", origin)
                .finish(),
            Self::DataChannelMessage { label, text } => f
                .debug_struct("DataChannelMessage")
                .field("label", label)
                .field("len", &text.len())
                .finish(),
            Self::Track { kind } => f.debug_struct("Track").field("kind", kind).finish(),
        }
    }
}

/// An engine callback tagged with the negotiation attempt that produced it.
#[derive(Debug)]
pub struct EngineEvent {
    pub attempt: u64,
    pub kind: EngineEventKind,
}

/// Handed to the engine when a peer connection is opened; every callback
/// funnels through it.
#[derive(Debug, Clone)]
pub struct EngineEventSender {
    attempt: u64,
    tx: mpsc::UnboundedSender<EngineEvent>,
}

impl EngineEventSender {
    pub fn new(attempt: u64, tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    /// Returns false once the owning session has gone away.
    pub fn emit(&self, kind: EngineEventKind) -> bool {
        self.tx
            .send(EngineEvent {
                attempt: self.attempt,
                kind,
            })
            .is_ok()
    }
}

#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn PeerConnection>>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> EngineResult<()>;
    async fn create_data_channel(&self, label: &str) -> EngineResult<Arc<dyn DataChannel>>;
    async fn create_offer(&self) -> EngineResult<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> EngineResult<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> EngineResult<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send_text(&self, text: &str) -> EngineResult<()>;
    async fn close(&self) -> EngineResult<()>;
}
