//! Peer connection seam
//!
//! The session never touches a WebRTC stack directly. It drives a
//! [`PeerConnection`] with W3C-style calls and reads everything the
//! connection reports back, state changes, candidates and packets alike,
//! from [`PeerConnection::next_event`]. [`RtcPeer`] is the str0m-backed
//! implementation.

use async_trait::async_trait;

use crate::error::Result;
use crate::media::CodecProfile;
use crate::model::description::{Direction, IceCandidate, SessionDescription};
use crate::model::packet::{MediaKind, Packet};

mod rtc;

pub use rtc::{rtp_bytes, RtcPeer, RtcPeerFactory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IceConnectionState::Disconnected
                | IceConnectionState::Failed
                | IceConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerConnectionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PeerConnectionState::Disconnected
                | PeerConnectionState::Failed
                | PeerConnectionState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// Everything a peer connection reports after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A local candidate was discovered.
    LocalCandidate(IceCandidate),
    /// No more local candidates will be discovered.
    GatheringComplete,
    IceConnectionState(IceConnectionState),
    ConnectionState(PeerConnectionState),
    /// The remote side started sending media of this kind.
    TrackOpen(MediaKind),
    /// An inbound RTP or RTCP packet.
    Packet(Packet),
}

#[async_trait]
pub trait PeerConnection: Send {
    /// Requests a transceiver of `profile.kind` that negotiates only `profile`.
    fn add_transceiver(&mut self, profile: &CodecProfile, direction: Direction) -> Result<()>;

    fn create_data_channel(&mut self, label: &str) -> Result<()>;

    async fn create_offer(&mut self) -> Result<SessionDescription>;

    async fn create_answer(&mut self) -> Result<SessionDescription>;

    async fn set_local_description(&mut self, description: &SessionDescription) -> Result<()>;

    async fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()>;

    /// The current local description, including any gathered candidates.
    fn local_description(&self) -> Option<SessionDescription>;

    fn gathering_state(&self) -> GatheringState;

    /// Asks the remote sender of `kind` for a keyframe.
    fn request_keyframe(&mut self, kind: MediaKind) -> Result<()>;

    /// Waits for the next event. Returns `None` once the connection is closed.
    ///
    /// Must be cancel safe: dropping the future before it resolves loses no
    /// event.
    async fn next_event(&mut self) -> Option<PeerEvent>;

    /// Closes the connection. Calling it again has no effect.
    fn close(&mut self);
}

/// Creates one peer connection per session.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(&self, session: &str) -> Result<Box<dyn PeerConnection>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(IceConnectionState::Failed.is_terminal());
        assert!(IceConnectionState::Disconnected.is_terminal());
        assert!(!IceConnectionState::Checking.is_terminal());
        assert!(!IceConnectionState::Completed.is_terminal());
        assert!(PeerConnectionState::Closed.is_terminal());
        assert!(!PeerConnectionState::Connected.is_terminal());
    }
}
