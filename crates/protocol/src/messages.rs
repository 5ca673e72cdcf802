//! Session description messages exchanged during signaling.
//!
//! A description travels as the JSON payload of exactly one frame:
//!
//! ```json
//! {"type":"offer","sdp":"v=0\r\n..."}
//! ```
//!
//! This is the same shape WebRTC implementations use for
//! `RTCSessionDescription`, so descriptions can be handed to the peer
//! connection library without reinterpretation.

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Role of a session description in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Sent first, by the initiator.
    Offer,
    /// Sent in reply to an offer, by the responder.
    Answer,
}

impl std::fmt::Display for SdpType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

/// A serialized negotiation message. The `sdp` body is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Whether this is an offer or an answer.
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// Session description body.
    pub sdp: String,
}

impl SessionDescription {
    /// Creates an offer.
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Creates an answer.
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Serializes to JSON bytes, the signaling wire payload.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Deserializes from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProtocolError;

    #[test]
    fn test_wire_shape() {
        let desc = SessionDescription::offer("v=0");
        let json = String::from_utf8(desc.to_json().unwrap()).unwrap();
        assert_eq!(json, r#"{"type":"offer","sdp":"v=0"}"#);
    }

    #[test]
    fn test_parse_answer() {
        let desc = SessionDescription::from_json(br#"{"sdp":"v=0","type":"answer"}"#).unwrap();
        assert_eq!(desc, SessionDescription::answer("v=0"));
        assert_eq!(desc.sdp_type.to_string(), "answer");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let err = SessionDescription::from_json(br#"{"type":"rollback","sdp":""}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }

    #[test]
    fn test_garbage_rejected() {
        let err = SessionDescription::from_json(b"not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Deserialization(_)));
    }
}
