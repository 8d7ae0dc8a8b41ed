//! Signaling over document mailboxes
//!
//! Offers, answers and ICE candidates travel through three mailbox
//! collections keyed by recipient. A mailbox keeps only the latest message
//! per sender, so receivers must tolerate repeats and missing intermediate
//! writes.

pub mod channel;
pub mod mailbox;
pub mod memory;
pub mod redis;

pub use channel::{SignalingChannel, SignalingHandler, Subscription};
pub use mailbox::{MailboxDocument, MailboxKey, MailboxStore, MailboxWatch};
pub use memory::MemoryMailboxStore;
pub use self::redis::RedisMailboxStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{types::PeerId, Error, Result};

/// The three mailbox collections
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Offer,
    Answer,
    Candidate,
}

impl MessageKind {
    pub const ALL: [Self; 3] = [Self::Offer, Self::Answer, Self::Candidate];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offers",
            Self::Answer => "answers",
            Self::Candidate => "candidates",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    /// Discards a pending offer and returns the connection to stable.
    pub fn rollback() -> Self {
        Self {
            sdp_type: SdpType::Rollback,
            sdp: String::new(),
        }
    }

    /// Reject descriptions with an empty body or an unexpected type.
    pub fn validate(&self, expected: SdpType) -> Result<()> {
        if self.sdp_type != expected {
            return Err(Error::MalformedSignalingPayload(format!(
                "expected {} description, got {}",
                expected.as_str(),
                self.sdp_type.as_str()
            )));
        }
        if self.sdp.trim().is_empty() {
            return Err(Error::MalformedSignalingPayload(format!(
                "{} description has an empty SDP body",
                expected.as_str()
            )));
        }
        Ok(())
    }
}

/// ICE candidate for connection establishment
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Body of a signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalPayload {
    Offer { description: SessionDescription },
    /// `reply_to` is the id of the offer being answered
    Answer {
        description: SessionDescription,
        reply_to: String,
    },
    /// Every candidate gathered so far for the recipient
    Candidates { candidates: Vec<IceCandidate> },
}

impl SignalPayload {
    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        match self {
            Self::Offer { .. } => MessageKind::Offer,
            Self::Answer { .. } => MessageKind::Answer,
            Self::Candidates { .. } => MessageKind::Candidate,
        }
    }
}

/// One mailbox entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingMessage {
    pub id: String,
    pub from: PeerId,
    pub to: PeerId,
    /// Stream session of the sender; changes when the sender restarts
    #[serde(default)]
    pub session_id: String,
    pub sent_at: DateTime<Utc>,
    pub payload: SignalPayload,
}

impl SignalingMessage {
    #[must_use]
    pub fn new(from: PeerId, to: PeerId, payload: SignalPayload) -> Self {
        Self {
            id: nanoid::nanoid!(16),
            from,
            to,
            session_id: String::new(),
            sent_at: Utc::now(),
            payload,
        }
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    #[must_use]
    pub const fn kind(&self) -> MessageKind {
        self.payload.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sdp_validation() {
        let offer = SessionDescription::offer("v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\n");
        assert!(offer.validate(SdpType::Offer).is_ok());
        assert!(matches!(
            offer.validate(SdpType::Answer),
            Err(Error::MalformedSignalingPayload(_))
        ));

        let empty = SessionDescription::answer("  ");
        assert!(matches!(
            empty.validate(SdpType::Answer),
            Err(Error::MalformedSignalingPayload(_))
        ));
    }

    #[test]
    fn test_message_wire_format() {
        let msg = SignalingMessage::new(
            PeerId::from("alice"),
            PeerId::from("bob"),
            SignalPayload::Answer {
                description: SessionDescription::answer("v=0"),
                reply_to: "offer-1".to_string(),
            },
        );

        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["from"], "alice");
        assert_eq!(json["payload"]["type"], "answer");
        assert_eq!(json["payload"]["description"]["type"], "answer");
        assert_eq!(json["payload"]["reply_to"], "offer-1");
        assert_eq!(msg.kind(), MessageKind::Answer);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let payload = SignalPayload::Candidates { candidates: vec![] };
        let a = SignalingMessage::new("a".into(), "b".into(), payload.clone());
        let b = SignalingMessage::new("a".into(), "b".into(), payload);
        assert_ne!(a.id, b.id);
    }
}
