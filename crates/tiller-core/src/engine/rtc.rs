//! [`PeerEngine`] backed by webrtc-rs.

use std::sync::Arc;

use async_trait::async_trait;
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::MediaEngine;
use ::webrtc::api::APIBuilder;
use ::webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use ::webrtc::data_channel::data_channel_message::DataChannelMessage;
use ::webrtc::data_channel::data_channel_state::RTCDataChannelState;
use ::webrtc::data_channel::RTCDataChannel;
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use ::webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use ::webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use ::webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use ::webrtc::track::track_remote::TrackRemote;
use tracing::{debug, trace, warn};

use super::{
    ChannelOrigin, DataChannel, EngineError, EngineEventKind, EngineEventSender, EngineResult,
    IceServer, MediaKind, PeerConnection, PeerEngine, PeerState, SdpKind, SessionDescription,
    TransceiverDirection,
};
use crate::signaling::IceCandidate;

#[derive(Debug, Default, Clone, Copy)]
pub struct WebRtcEngine;

impl WebRtcEngine {
    pub fn new() -> Self {
        Self
    }
}

fn ice_servers_to_rtc(servers: &[IceServer]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn peer_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerState::New,
        RTCPeerConnectionState::Connecting => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
        RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

fn media_kind(kind: RTPCodecType) -> Option<MediaKind> {
    match kind {
        RTPCodecType::Audio => Some(MediaKind::Audio),
        RTPCodecType::Video => Some(MediaKind::Video),
        _ => None,
    }
}

/// Forwards a data channel's open/close/message callbacks as engine events,
/// tagged with the side that opened it.
fn wire_data_channel(
    channel: &Arc<RTCDataChannel>,
    events: &EngineEventSender,
    origin: ChannelOrigin,
) {
    let label = channel.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    channel.on_open(Box::new(move || {
        open_events.emit(EngineEventKind::DataChannelOpen {
            label: open_label.clone(),
            origin,
        });
        Box::pin(async {})
    }));

    let close_events = events.clone();
    let close_label = label.clone();
    channel.on_close(Box::new(move || {
        close_events.emit(EngineEventKind::DataChannelClosed {
            label: close_label.clone(),
            origin,
        });
        Box::pin(async {})
    }));

    let message_events = events.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        if message.is_string {
            match String::from_utf8(message.data.to_vec()) {
                Ok(text) => {
                    message_events.emit(EngineEventKind::DataChannelMessage {
                        label: label.clone(),
                        text,
                    });
                }
                Err(err) => {
                    debug!(
                        target: "tiller::engine",
                        label = %label,
                        error = %err,
                        "dropping non-utf8 data channel message"
                    );
                }
            }
        }
        Box::pin(async {})
    }));
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn create_peer_connection(
        &self,
        ice_servers: &[IceServer],
        events: EngineEventSender,
    ) -> EngineResult<Arc<dyn PeerConnection>> {
        let setup = |err: ::webrtc::Error| EngineError::Setup(err.to_string());
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(setup)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let config = RTCConfiguration {
            ice_servers: ice_servers_to_rtc(ice_servers),
            ..Default::default()
        };
        let peer_connection = Arc::new(api.new_peer_connection(config).await.map_err(setup)?);

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    trace!(target: "tiller::engine", "ice gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        events.emit(EngineEventKind::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(err) => {
                        warn!(
                            target: "tiller::engine",
                            error = %err,
                            "failed to serialize local candidate"
                        );
                    }
                }
            })
        }));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                debug!(
                    target: "tiller::engine",
                    attempt = state_events.attempt(),
                    ?state,
                    "peer connection state"
                );
                state_events.emit(EngineEventKind::ConnectionState(peer_state(state)));
                Box::pin(async {})
            },
        ));

        let channel_events = events.clone();
        peer_connection.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let events = channel_events.clone();
            Box::pin(async move {
                debug!(
                    target: "tiller::engine",
                    label = channel.label(),
                    "remote data channel announced"
                );
                wire_data_channel(&channel, &events, ChannelOrigin::Remote);
                let open = channel.ready_state() == RTCDataChannelState::Open;
                let label = channel.label().to_string();
                events.emit(EngineEventKind::RemoteDataChannel(Arc::new(
                    RtcDataChannel { inner: channel },
                )));
                if open {
                    events.emit(EngineEventKind::DataChannelOpen {
                        label,
                        origin: ChannelOrigin::Remote,
                    });
                }
            })
        }));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if let Some(kind) = media_kind(track.kind()) {
                    track_events.emit(EngineEventKind::Track { kind });
                }
                Box::pin(async {})
            },
        ));

        Ok(Arc::new(RtcPeerConnection {
            inner: peer_connection,
            events,
        }))
    }
}

struct RtcPeerConnection {
    inner: Arc<RTCPeerConnection>,
    events: EngineEventSender,
}

impl RtcPeerConnection {
    fn to_rtc_description(
        description: SessionDescription,
    ) -> EngineResult<RTCSessionDescription> {
        let converted = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        };
        converted.map_err(|err| EngineError::Description(err.to_string()))
    }
}

#[async_trait]
impl PeerConnection for RtcPeerConnection {
    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> EngineResult<()> {
        let codec = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        let direction = match direction {
            TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        };
        self.inner
            .add_transceiver_from_kind(
                codec,
                Some(RTCRtpTransceiverInit {
                    direction,
                    send_encodings: Vec::new(),
                }),
            )
            .await
            .map(|_| ())
            .map_err(|err| EngineError::Setup(err.to_string()))
    }

    async fn create_data_channel(&self, label: &str) -> EngineResult<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let channel = self
            .inner
            .create_data_channel(label, Some(init))
            .await
            .map_err(|err| EngineError::DataChannel(err.to_string()))?;
        wire_data_channel(&channel, &self.events, ChannelOrigin::Local);
        Ok(Arc::new(RtcDataChannel { inner: channel }))
    }

    async fn create_offer(&self) -> EngineResult<SessionDescription> {
        let offer = self
            .inner
            .create_offer(None)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn set_local_description(&self, description: SessionDescription) -> EngineResult<()> {
        let description = Self::to_rtc_description(description)?;
        self.inner
            .set_local_description(description)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> EngineResult<()> {
        let description = Self::to_rtc_description(description)?;
        self.inner
            .set_remote_description(description)
            .await
            .map_err(|err| EngineError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> EngineResult<()> {
        self.inner
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|err| EngineError::Candidate(err.to_string()))
    }

    async fn close(&self) -> EngineResult<()> {
        self.inner
            .close()
            .await
            .map_err(|err| EngineError::Setup(err.to_string()))
    }
}

struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        self.inner.label()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: &str) -> EngineResult<()> {
        self.inner
            .send_text(text.to_string())
            .await
            .map(|_| ())
            .map_err(|err| EngineError::DataChannel(err.to_string()))
    }

    async fn close(&self) -> EngineResult<()> {
        self.inner
            .close()
            .await
            .map_err(|err| EngineError::DataChannel(err.to_string()))
    }
}
