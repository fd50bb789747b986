use thiserror::Error;

use crate::model::{description::NegotiationRole, packet::MediaKind};

/// Faults found while rewriting a negotiated session description.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SdpError {
    #[error("description has no m={0} line")]
    MissingMediaLine(MediaKind),
    #[error("description has more than one m={0} line")]
    DuplicateMediaLine(MediaKind),
    #[error("malformed media line {0:?}")]
    MalformedMediaLine(String),
}

/// Errors that can occur while bridging a session.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("sdp: {0}")]
    Sdp(#[from] SdpError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// Error reported by the peer connection
    #[error("peer connection: {0}")]
    Peer(String),

    /// A call that contradicts the negotiation role already taken
    #[error("local side is the {role}, cannot {attempted}")]
    RoleMismatch {
        role: NegotiationRole,
        attempted: String,
    },

    #[error("renegotiation is not supported")]
    Renegotiation,

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("session is closed")]
    SessionClosed,

    #[error("signaling: {0}")]
    Signaling(String),

    /// The RTSP consumer misbehaved during the handshake
    #[error("rtsp: {0}")]
    Rtsp(String),

    #[error("config: {0}")]
    Config(String),
}

impl BridgeError {
    /// Whether the error only rejects the call that caused it, leaving the
    /// session alive.
    pub fn is_call_local(&self) -> bool {
        matches!(
            self,
            BridgeError::RoleMismatch { .. } | BridgeError::Renegotiation
        )
    }
}

pub type Result<T, E = BridgeError> = std::result::Result<T, E>;
