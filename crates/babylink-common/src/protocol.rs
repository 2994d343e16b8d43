//! Wire protocol shared by the baby station and the parent viewer.
//!
//! Every frame on the signaling socket is a JSON object. The four shapes carry
//! no discriminant field; a receiver tells them apart by their top-level key,
//! which is why each envelope rejects unknown fields.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Resolved network location of a discovered baby station.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub address: String,
    pub port: String,
}

impl ServiceDescriptor {
    pub fn new(address: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            port: port.into(),
        }
    }

    /// Builds the `ws://` URL used to open the signaling socket.
    pub fn websocket_url(&self) -> Result<Url> {
        let port: u16 = self
            .port
            .parse()
            .map_err(|_| Error::config(format!("invalid service port {:?}", self.port)))?;
        let host = match self.address.parse::<IpAddr>() {
            Ok(IpAddr::V6(v6)) => format!("[{v6}]"),
            Ok(IpAddr::V4(v4)) => v4.to_string(),
            Err(_) => self.address.clone(),
        };
        Ok(Url::parse(&format!("ws://{host}:{port}"))?)
    }
}

/// Session description kind, serialized the way browsers spell it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    #[serde(rename = "pranswer")]
    PrAnswer,
    Answer,
    Rollback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
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
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IceCandidate {
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    pub candidate: String,
}

/// Application events exchanged alongside the media session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    BabyIsCrying,
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventMessage {
    pub action: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl EventMessage {
    /// An event stamped with the current time.
    pub fn now(action: EventKind) -> Self {
        Self {
            action,
            timestamp: Some(Utc::now()),
        }
    }
}

/// Every message that can travel over the signaling socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    SdpOffer(SessionDescription),
    SdpAnswer(SessionDescription),
    IceCandidate(IceCandidate),
    Event(EventMessage),
}

impl Message {
    /// Serializes the message into its textual frame.
    pub fn to_text(&self) -> Result<String> {
        let text = match self {
            Message::SdpOffer(sdp) => serde_json::to_string(&wire::OfferEnvelope {
                offer_sdp: sdp.clone(),
            })?,
            Message::SdpAnswer(sdp) => serde_json::to_string(&wire::AnswerEnvelope {
                answer_sdp: sdp.clone(),
            })?,
            Message::IceCandidate(candidate) => {
                serde_json::to_string(&wire::IceCandidateEnvelope {
                    ice_candidate: candidate.clone(),
                })?
            }
            Message::Event(event) => serde_json::to_string(event)?,
        };
        Ok(text)
    }
}

/// Top-level envelopes of the structural wire shapes.
pub mod wire {
    use super::{IceCandidate, SessionDescription};
    use serde::{Deserialize, Serialize};

    /// `{"offerSDP": {...}}`
    #[derive(Debug, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct OfferEnvelope {
        #[serde(rename = "offerSDP")]
        pub offer_sdp: SessionDescription,
    }

    /// `{"answerSDP": {...}}`
    #[derive(Debug, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct AnswerEnvelope {
        #[serde(rename = "answerSDP")]
        pub answer_sdp: SessionDescription,
    }

    /// `{"iceCandidate": {...}}`
    #[derive(Debug, Serialize, Deserialize)]
    #[serde(deny_unknown_fields)]
    pub struct IceCandidateEnvelope {
        #[serde(rename = "iceCandidate")]
        pub ice_candidate: IceCandidate,
    }
}

/// Coarse connection progress of a parent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Discovering,
    Resolved,
    Connecting,
    Negotiating,
    Streaming,
    Paused,
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offer_frame_shape() {
        let text = Message::SdpOffer(SessionDescription::offer("v=0")).to_text().unwrap();
        assert_eq!(text, r#"{"offerSDP":{"type":"offer","sdp":"v=0"}}"#);
    }

    #[test]
    fn test_ice_candidate_frame_shape() {
        let text = Message::IceCandidate(IceCandidate {
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            candidate: "candidate:1 1 udp 2122260223 192.168.1.5 50000 typ host".into(),
        })
        .to_text()
        .unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["iceCandidate"]["sdpMid"], "0");
        assert_eq!(value["iceCandidate"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn test_event_frame_without_timestamp() {
        let text = Message::Event(EventMessage {
            action: EventKind::BabyIsCrying,
            timestamp: None,
        })
        .to_text()
        .unwrap();
        assert_eq!(text, r#"{"action":"BABY_IS_CRYING"}"#);
    }

    #[test]
    fn test_websocket_url_ipv4_and_ipv6() {
        let v4 = ServiceDescriptor::new("192.168.1.5", "8080");
        assert_eq!(v4.websocket_url().unwrap().as_str(), "ws://192.168.1.5:8080/");

        let v6 = ServiceDescriptor::new("fe80::1", "10001");
        assert_eq!(v6.websocket_url().unwrap().as_str(), "ws://[fe80::1]:10001/");
    }

    #[test]
    fn test_websocket_url_rejects_bad_port() {
        let bad = ServiceDescriptor::new("192.168.1.5", "http");
        assert!(matches!(bad.websocket_url(), Err(Error::Config(_))));
    }
}
