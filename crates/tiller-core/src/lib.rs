//! Signaling and liveness control plane for a remote-operator terminal.
//!
//! A [`SessionSupervisor`] watches a rendezvous [`transport_bus::Bus`] for the
//! vehicle's heartbeats and signaling messages, negotiates a peer connection
//! through a [`PeerEngine`], and drives the [`CommandPublisher`] while the
//! negotiated control channel is open. Telemetry arriving on a data channel or
//! on the bus is folded into a [`TelemetrySnapshot`].

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod heartbeat;
pub mod ice_buffer;
pub mod session;
pub mod signaling;
pub mod supervisor;
pub mod telemetry;

pub use command::{CommandPublisher, ControlSetpoint, Setpoints};
pub use config::{Config, ConfigError, InitiationPolicy, Topics};
pub use engine::{EngineError, IceServer, MockEngine, PeerEngine, WebRtcEngine};
pub use error::{TillerError, TillerResult};
pub use heartbeat::HeartbeatMonitor;
pub use ice_buffer::IceCandidateBuffer;
pub use session::{SessionState, SignalingSession};
pub use signaling::{IceCandidate, SignalingError, SignalingMessage};
pub use supervisor::{SessionSupervisor, SupervisorHandle, SupervisorStatus};
pub use telemetry::{TelemetryField, TelemetryRouter, TelemetrySnapshot};
