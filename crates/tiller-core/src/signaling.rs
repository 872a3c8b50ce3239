//! Wire codec for messages exchanged over the rendezvous signaling topics.
//!
//! Session control messages carry a `type` tag (`hello`, `bye`, `busy`,
//! `offer`, `answer`). ICE candidates carry no tag and are recognised by the
//! presence of a `candidate` field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Hello,
    Bye,
    Busy,
    Offer { sdp: String },
    Answer { sdp: String },
    IceCandidate(IceCandidate),
}

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("signaling payload is not valid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("signaling payload has neither `type` nor `candidate`")]
    Untyped,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Envelope {
    Hello,
    Bye,
    Busy,
    Offer { sdp: String },
    Answer { sdp: String },
}

impl SignalingMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, SignalingError> {
        let value: Value = serde_json::from_slice(payload)?;
        if value.get("candidate").is_some() {
            return Ok(Self::IceCandidate(serde_json::from_value(value)?));
        }
        if value.get("type").is_none() {
            return Err(SignalingError::Untyped);
        }
        let envelope: Envelope = serde_json::from_value(value)?;
        Ok(match envelope {
            Envelope::Hello => Self::Hello,
            Envelope::Bye => Self::Bye,
            Envelope::Busy => Self::Busy,
            Envelope::Offer { sdp } => Self::Offer { sdp },
            Envelope::Answer { sdp } => Self::Answer { sdp },
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, SignalingError> {
        let bytes = match self {
            Self::IceCandidate(candidate) => serde_json::to_vec(candidate)?,
            Self::Hello => serde_json::to_vec(&Envelope::Hello)?,
            Self::Bye => serde_json::to_vec(&Envelope::Bye)?,
            Self::Busy => serde_json::to_vec(&Envelope::Busy)?,
            Self::Offer { sdp } => serde_json::to_vec(&Envelope::Offer { sdp: sdp.clone() })?,
            Self::Answer { sdp } => serde_json::to_vec(&Envelope::Answer { sdp: sdp.clone() })?,
        };
        Ok(bytes)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Bye => "bye",
            Self::Busy => "busy",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate(_) => "candidate",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tagged_messages() {
        assert_eq!(
            SignalingMessage::decode(br#"{"type":"hello"}"#).unwrap(),
            SignalingMessage::Hello
        );
        assert_eq!(
            SignalingMessage::decode(br#"{"type":"busy","extra":1}"#).unwrap(),
            SignalingMessage::Busy
        );
        assert_eq!(
            SignalingMessage::decode(br#"{"type":"answer","sdp":"v=0\r\n"}"#).unwrap(),
            SignalingMessage::Answer {
                sdp: "v=0\r\n".into()
            }
        );
    }

    #[test]
    fn candidates_are_recognised_without_type() {
        let msg = SignalingMessage::decode(
            br#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0}"#,
        )
        .unwrap();
        let SignalingMessage::IceCandidate(candidate) = msg else {
            panic!("expected candidate, got {msg:?}");
        };
        assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
        assert_eq!(candidate.sdp_mline_index, Some(0));
    }

    #[test]
    fn unknown_shapes_are_errors() {
        assert!(SignalingMessage::decode(b"not json").is_err());
        assert!(matches!(
            SignalingMessage::decode(br#"{"sdp":"x"}"#),
            Err(SignalingError::Untyped)
        ));
        assert!(SignalingMessage::decode(br#"{"type":"renegotiate"}"#).is_err());
        assert!(SignalingMessage::decode(br#"{"type":"offer"}"#).is_err());
    }

    #[test]
    fn encodes_offer_and_candidate_shapes() {
        let offer = SignalingMessage::Offer { sdp: "v=0".into() }.encode().unwrap();
        let value: Value = serde_json::from_slice(&offer).unwrap();
        assert_eq!(value["type"], "offer");
        assert_eq!(value["sdp"], "v=0");

        let candidate = SignalingMessage::IceCandidate(IceCandidate {
            candidate: "candidate:2".into(),
            sdp_mid: Some("1".into()),
            sdp_mline_index: Some(1),
        })
        .encode()
        .unwrap();
        let value: Value = serde_json::from_slice(&candidate).unwrap();
        assert!(value.get("type").is_none());
        assert_eq!(value["sdpMid"], "1");
        assert_eq!(value["sdpMLineIndex"], 1);
    }
}
