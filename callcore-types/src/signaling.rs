//! Signaling message schemas
//!
//! These messages travel through the messaging platform's call-setup API,
//! which the host application owns. The engine produces and consumes them
//! as typed values; the host moves them as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use uuid::Uuid;

use crate::error::{Result, TypesError};

/// Call identifier
pub type CallId = Uuid;

/// Oldest protocol version this build speaks
pub const MIN_PROTOCOL_VERSION: u32 = 1;

/// Newest protocol version this build speaks
pub const MAX_PROTOCOL_VERSION: u32 = 2;

/// Size of an X25519 public value and of a SHA-256 commitment
pub const EXCHANGE_VALUE_LEN: usize = 32;

/// Messaging-platform account identity of the remote endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        PeerId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        PeerId(id.to_string())
    }
}

/// Key-exchange material carried by signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExchangeMaterial {
    /// SHA-256 of the initiator's public value, sent before the value itself
    Commitment(#[serde(with = "hex_array")] [u8; EXCHANGE_VALUE_LEN]),
    /// An X25519 public value
    PublicValue(#[serde(with = "hex_array")] [u8; EXCHANGE_VALUE_LEN]),
}

impl ExchangeMaterial {
    pub fn is_commitment(&self) -> bool {
        matches!(self, ExchangeMaterial::Commitment(_))
    }
}

/// Supported protocol version range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolRange {
    pub min: u32,
    pub max: u32,
}

impl ProtocolRange {
    /// Range spoken by this build
    pub fn current() -> Self {
        ProtocolRange {
            min: MIN_PROTOCOL_VERSION,
            max: MAX_PROTOCOL_VERSION,
        }
    }

    /// Highest version both ranges share
    pub fn negotiate(&self, other: &ProtocolRange) -> Option<u32> {
        let low = self.min.max(other.min);
        let high = self.max.min(other.max);
        (low <= high).then_some(high)
    }
}

/// Candidate kind advertised to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateKind {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relayed,
}

impl CandidateKind {
    /// Direct candidates reach the peer without a third party
    pub fn is_direct(&self) -> bool {
        !matches!(self, CandidateKind::Relayed)
    }
}

/// Transport candidate as advertised over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateDescriptor {
    pub address: SocketAddr,
    pub kind: CandidateKind,
    pub priority: u32,
}

/// Why a call ended, as told to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndReason {
    /// Normal hangup
    Hangup,
    /// Callee declined
    Declined,
    /// Callee already in a call with this peer
    Busy,
    /// Nobody answered in time
    Missed,
    /// No common protocol version or codec
    Incompatible,
    /// Media path failed and could not be restored
    Disconnected,
}

/// Signaling message types
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "CALL_REQUEST")]
    CallRequest {
        call_id: CallId,
        protocol: ProtocolRange,
        codecs: Vec<String>,
        material: ExchangeMaterial,
    },
    #[serde(rename = "CALL_ACCEPT")]
    CallAccept {
        call_id: CallId,
        protocol_version: u32,
        codec: String,
        material: ExchangeMaterial,
    },
    #[serde(rename = "CALL_DECLINE")]
    CallDecline { call_id: CallId, reason: EndReason },
    #[serde(rename = "KEY_EXCHANGE_MATERIAL")]
    KeyExchangeMaterial {
        call_id: CallId,
        material: ExchangeMaterial,
    },
    #[serde(rename = "CANDIDATES")]
    Candidates {
        call_id: CallId,
        candidates: Vec<CandidateDescriptor>,
    },
    #[serde(rename = "HANGUP")]
    Hangup { call_id: CallId, reason: EndReason },
}

impl SignalingMessage {
    /// Call this message belongs to
    pub fn call_id(&self) -> CallId {
        match self {
            SignalingMessage::CallRequest { call_id, .. }
            | SignalingMessage::CallAccept { call_id, .. }
            | SignalingMessage::CallDecline { call_id, .. }
            | SignalingMessage::KeyExchangeMaterial { call_id, .. }
            | SignalingMessage::Candidates { call_id, .. }
            | SignalingMessage::Hangup { call_id, .. } => *call_id,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::CallRequest { .. } => "call_request",
            SignalingMessage::CallAccept { .. } => "call_accept",
            SignalingMessage::CallDecline { .. } => "call_decline",
            SignalingMessage::KeyExchangeMaterial { .. } => "key_exchange_material",
            SignalingMessage::Candidates { .. } => "candidates",
            SignalingMessage::Hangup { .. } => "hangup",
        }
    }

    /// Structural checks that serde alone cannot express
    pub fn validate(&self) -> Result<()> {
        match self {
            SignalingMessage::CallRequest {
                protocol,
                codecs,
                material,
                ..
            } => {
                if protocol.min > protocol.max {
                    return Err(TypesError::Validation(format!(
                        "protocol range {}..{} is empty",
                        protocol.min, protocol.max
                    )));
                }
                if codecs.is_empty() {
                    return Err(TypesError::MissingField("codecs".to_string()));
                }
                if !material.is_commitment() {
                    return Err(TypesError::InvalidMessage(
                        "call request must carry a commitment".to_string(),
                    ));
                }
            }
            SignalingMessage::CallAccept { codec, material, .. } => {
                if codec.is_empty() {
                    return Err(TypesError::MissingField("codec".to_string()));
                }
                if material.is_commitment() {
                    return Err(TypesError::InvalidMessage(
                        "call accept must carry a public value".to_string(),
                    ));
                }
            }
            SignalingMessage::Candidates { candidates, .. } => {
                if candidates.is_empty() {
                    return Err(TypesError::MissingField("candidates".to_string()));
                }
            }
            SignalingMessage::CallDecline { .. }
            | SignalingMessage::KeyExchangeMaterial { .. }
            | SignalingMessage::Hangup { .. } => {}
        }
        Ok(())
    }
}

/// A signaling message together with the peer it came from or goes to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingEnvelope {
    pub peer: PeerId,
    pub message: SignalingMessage,
    pub sent_at: DateTime<Utc>,
}

impl SignalingEnvelope {
    pub fn new(peer: PeerId, message: SignalingMessage) -> Self {
        SignalingEnvelope {
            peer,
            message,
            sent_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse and validate an envelope received from the messaging layer
    pub fn from_json(json: &str) -> Result<Self> {
        let envelope: SignalingEnvelope = serde_json::from_str(json)?;
        envelope.message.validate()?;
        Ok(envelope)
    }
}

mod hex_array {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>, const N: usize>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let text = String::deserialize(deserializer)?;
        let raw = hex::decode(text).map_err(D::Error::custom)?;
        raw.try_into()
            .map_err(|v: Vec<u8>| D::Error::custom(format!("expected {} bytes, got {}", N, v.len())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SignalingMessage {
        SignalingMessage::CallRequest {
            call_id: Uuid::new_v4(),
            protocol: ProtocolRange::current(),
            codecs: vec!["pcm".to_string()],
            material: ExchangeMaterial::Commitment([7u8; 32]),
        }
    }

    #[test]
    fn test_envelope_json_round_trip() {
        let envelope = SignalingEnvelope::new(PeerId::from("@alice"), request());
        let json = envelope.to_json().unwrap();
        assert!(json.contains("\"type\":\"CALL_REQUEST\""));
        assert!(json.contains(&"07".repeat(32)));

        let parsed = SignalingEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_request_without_commitment_rejected() {
        let message = SignalingMessage::CallRequest {
            call_id: Uuid::new_v4(),
            protocol: ProtocolRange::current(),
            codecs: vec!["pcm".to_string()],
            material: ExchangeMaterial::PublicValue([1u8; 32]),
        };
        assert!(matches!(message.validate(), Err(TypesError::InvalidMessage(_))));
    }

    #[test]
    fn test_short_hex_rejected() {
        let json = r#"{"kind":"public_value","value":"abcd"}"#;
        assert!(serde_json::from_str::<ExchangeMaterial>(json).is_err());
    }

    #[test]
    fn test_protocol_negotiation() {
        let ours = ProtocolRange { min: 1, max: 3 };
        assert_eq!(ours.negotiate(&ProtocolRange { min: 2, max: 5 }), Some(3));
        assert_eq!(ours.negotiate(&ProtocolRange { min: 4, max: 5 }), None);
    }

    #[test]
    fn test_end_reason_wire_names() {
        let json = serde_json::to_string(&EndReason::Incompatible).unwrap();
        assert_eq!(json, "\"INCOMPATIBLE\"");
    }
}
