//! Signaling payloads exchanged with the remote device.
//!
//! The JSON shapes follow the browser `RTCSessionDescriptionInit` and
//! `RTCIceCandidateInit` dictionaries so they can be passed through a
//! signaling channel untouched.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::packet::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SdpType::Offer => f.write_str("offer"),
            SdpType::Answer => f.write_str("answer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> SessionDescription {
        SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> SessionDescription {
        SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// A single trickled ICE candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// The `candidate:...` attribute value. Empty signals end of candidates.
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> IceCandidate {
        IceCandidate {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: Some(0),
        }
    }

    pub fn is_end_of_candidates(&self) -> bool {
        self.candidate.trim().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaSetup {
    #[serde(default)]
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataChannelSetup {
    pub label: String,
}

/// What the signaling channel asks of the local transceivers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalingSetup {
    #[serde(default)]
    pub audio: MediaSetup,
    #[serde(default)]
    pub video: MediaSetup,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datachannel: Option<DataChannelSetup>,
}

impl SignalingSetup {
    pub fn direction(&self, kind: MediaKind) -> Direction {
        match kind {
            MediaKind::Audio => self.audio.direction,
            MediaKind::Video => self.video.direction,
        }
    }
}

/// Which side produces the offer. Fixed for the lifetime of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationRole {
    Offerer,
    Answerer,
}

impl NegotiationRole {
    /// The role the local side takes when it sees a description of `sdp_type`
    /// coming from the remote peer.
    pub fn for_remote(sdp_type: SdpType) -> NegotiationRole {
        match sdp_type {
            SdpType::Offer => NegotiationRole::Answerer,
            SdpType::Answer => NegotiationRole::Offerer,
        }
    }

    /// The role the local side takes when asked to produce a description.
    pub fn for_local(sdp_type: SdpType) -> NegotiationRole {
        match sdp_type {
            SdpType::Offer => NegotiationRole::Offerer,
            SdpType::Answer => NegotiationRole::Answerer,
        }
    }
}

impl fmt::Display for NegotiationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationRole::Offerer => f.write_str("offerer"),
            NegotiationRole::Answerer => f.write_str("answerer"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_uses_browser_json_shape() {
        let json = r#"{"type":"offer","sdp":"v=0\r\n"}"#;
        let desc: SessionDescription = serde_json::from_str(json).unwrap();
        assert_eq!(desc, SessionDescription::offer("v=0\r\n"));
        assert_eq!(serde_json::to_string(&desc).unwrap(), json);
    }

    #[test]
    fn candidate_field_names_match_browser() {
        let json = r#"{"candidate":"candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let c: IceCandidate = serde_json::from_str(json).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
        assert!(!c.is_end_of_candidates());
        assert!(IceCandidate::new("").is_end_of_candidates());
    }

    #[test]
    fn setup_defaults_to_sendrecv() {
        let setup: SignalingSetup = serde_json::from_str("{}").unwrap();
        assert_eq!(setup.direction(MediaKind::Audio), Direction::SendRecv);
        assert_eq!(setup.direction(MediaKind::Video), Direction::SendRecv);
        assert!(setup.datachannel.is_none());
    }

    #[test]
    fn role_follows_first_description() {
        assert_eq!(
            NegotiationRole::for_remote(SdpType::Offer),
            NegotiationRole::for_local(SdpType::Answer)
        );
        assert_eq!(
            NegotiationRole::for_remote(SdpType::Answer),
            NegotiationRole::for_local(SdpType::Offer)
        );
    }
}
