//! Media kinds and the opaque packets relayed between the peer and the consumer.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The two kinds of media a bridged session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub const ALL: [MediaKind; 2] = [MediaKind::Audio, MediaKind::Video];

    /// The token used for this kind on SDP media lines (`m=audio`, `m=video`).
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A serialized RTP or RTCP packet received from the remote peer.
///
/// The payload is never inspected past this point, it is handed to the
/// relay exactly as the transport produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub kind: MediaKind,
    /// `true` for RTCP, `false` for RTP.
    pub is_control: bool,
    pub data: Vec<u8>,
}

impl Packet {
    pub fn media(kind: MediaKind, data: Vec<u8>) -> Packet {
        Packet {
            kind,
            is_control: false,
            data,
        }
    }

    pub fn control(kind: MediaKind, data: Vec<u8>) -> Packet {
        Packet {
            kind,
            is_control: true,
            data,
        }
    }
}
