//! Bridges a WebRTC peer connection to a local consumer that only speaks
//! SDP over TCP with plain RTP, or RTSP with interleaved packets.
//!
//! [`Bridge::create_session`] is the entry point. It returns the
//! [`SessionDescriptor`] a media tool needs to read the session, and a
//! [`SessionHandle`] the signaling side drives negotiation through.

pub mod config;
pub mod error;
pub mod media;
pub mod model;
pub mod peer;
pub mod relay;
pub mod sdp;
pub mod server;
pub mod session;
pub mod signaling;
pub mod util;

pub use config::{BridgeConfig, TransportMode};
pub use error::{BridgeError, Result, SdpError};
pub use model::description::{
    DataChannelSetup, Direction, IceCandidate, MediaSetup, SdpType, SessionDescription,
    SignalingSetup,
};
pub use model::descriptor::SessionDescriptor;
pub use model::packet::{MediaKind, Packet};
pub use model::tracks::MediaPorts;
pub use session::{Bridge, BridgeSession};
pub use signaling::{CandidateSender, EndSession, SessionHandle, SignalingChannel};
