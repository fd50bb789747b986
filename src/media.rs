//! Media relay wiring
//!
//! Declares the single codec each transceiver is negotiated with and moves
//! inbound packets from the peer connection into the relay sink.

use tracing::info;

use crate::error::Result;
use crate::model::{description::SignalingSetup, packet::MediaKind, packet::Packet};
use crate::model::tracks::FirstPacketLatch;
use crate::peer::PeerConnection;
use crate::relay::PacketSink;

/// An `a=rtcp-fb` entry advertised for a codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcpFeedback {
    pub kind: &'static str,
    pub parameter: Option<&'static str>,
}

impl RtcpFeedback {
    const fn new(kind: &'static str, parameter: Option<&'static str>) -> RtcpFeedback {
        RtcpFeedback { kind, parameter }
    }
}

const H264_FEEDBACK: [RtcpFeedback; 5] = [
    RtcpFeedback::new("transport-cc", None),
    RtcpFeedback::new("ccm", Some("fir")),
    RtcpFeedback::new("nack", None),
    RtcpFeedback::new("nack", Some("pli")),
    RtcpFeedback::new("goog-remb", None),
];

/// The one codec a transceiver is allowed to negotiate.
///
/// Opus and H.264 constrained baseline are the codecs every WebRTC endpoint
/// must implement, and both can be handed to ffmpeg without transcoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecProfile {
    pub kind: MediaKind,
    pub mime_type: &'static str,
    pub clock_rate: u32,
    pub channels: Option<u8>,
    pub fmtp: Option<&'static str>,
    pub rtcp_feedback: &'static [RtcpFeedback],
}

impl CodecProfile {
    pub fn opus() -> CodecProfile {
        CodecProfile {
            kind: MediaKind::Audio,
            mime_type: "audio/opus",
            clock_rate: 48_000,
            channels: Some(2),
            fmtp: None,
            rtcp_feedback: &[],
        }
    }

    pub fn h264_baseline() -> CodecProfile {
        CodecProfile {
            kind: MediaKind::Video,
            mime_type: "video/H264",
            clock_rate: 90_000,
            channels: None,
            fmtp: Some("level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"),
            rtcp_feedback: &H264_FEEDBACK,
        }
    }

    pub fn for_kind(kind: MediaKind) -> CodecProfile {
        match kind {
            MediaKind::Audio => CodecProfile::opus(),
            MediaKind::Video => CodecProfile::h264_baseline(),
        }
    }

    /// The codec name as it appears in `a=rtpmap`.
    pub fn encoding_name(&self) -> &'static str {
        self.mime_type
            .split_once('/')
            .map(|(_, name)| name)
            .unwrap_or(self.mime_type)
    }

    fn fmtp_value(&self, key: &str) -> Option<&'static str> {
        self.fmtp?
            .split(';')
            .filter_map(|kv| kv.split_once('='))
            .find(|(k, _)| k.trim() == key)
            .map(|(_, v)| v.trim())
    }

    pub fn profile_level_id(&self) -> Option<u32> {
        self.fmtp_value("profile-level-id")
            .and_then(|v| u32::from_str_radix(v, 16).ok())
    }

    pub fn packetization_mode(&self) -> bool {
        self.fmtp_value("packetization-mode") == Some("1")
    }
}

/// Adds the audio and video transceivers to `peer`, each limited to its
/// fixed codec profile.
pub fn attach_transceivers(peer: &mut dyn PeerConnection, setup: &SignalingSetup) -> Result<()> {
    for kind in MediaKind::ALL {
        let profile = CodecProfile::for_kind(kind);
        peer.add_transceiver(&profile, setup.direction(kind))?;
    }
    Ok(())
}

/// Per-session forwarding state.
#[derive(Debug)]
pub struct MediaWiring {
    session: String,
    latch: FirstPacketLatch,
}

impl MediaWiring {
    pub fn new(session: impl Into<String>) -> MediaWiring {
        MediaWiring {
            session: session.into(),
            latch: FirstPacketLatch::default(),
        }
    }

    /// Hands `packet` to the sink. Returns `true` when this was the first
    /// media packet of its kind.
    ///
    /// There is no buffering here, an error from the sink is the caller's
    /// signal to end the session.
    pub async fn forward(&mut self, sink: &mut dyn PacketSink, packet: &Packet) -> Result<bool> {
        let first = !packet.is_control && self.latch.trip(packet.kind);
        if first {
            info!("Session({}): received first {} packet", self.session, packet.kind);
        }

        match packet.kind {
            MediaKind::Audio => sink.send_audio(&packet.data, packet.is_control).await?,
            MediaKind::Video => sink.send_video(&packet.data, packet.is_control).await?,
        }

        Ok(first)
    }

    #[cfg(test)]
    fn has_received(&self, kind: MediaKind) -> bool {
        self.latch.is_tripped(kind)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::error::BridgeError;

    #[derive(Default)]
    struct RecordingSink {
        seen: Vec<(MediaKind, bool, Vec<u8>)>,
        fail_after: Option<usize>,
    }

    impl RecordingSink {
        fn push(&mut self, kind: MediaKind, data: &[u8], is_control: bool) -> Result<()> {
            if self.fail_after == Some(self.seen.len()) {
                return Err(BridgeError::Io(std::io::ErrorKind::BrokenPipe.into()));
            }
            self.seen.push((kind, is_control, data.to_vec()));
            Ok(())
        }
    }

    #[async_trait]
    impl PacketSink for RecordingSink {
        async fn send_audio(&mut self, data: &[u8], is_control: bool) -> Result<()> {
            self.push(MediaKind::Audio, data, is_control)
        }

        async fn send_video(&mut self, data: &[u8], is_control: bool) -> Result<()> {
            self.push(MediaKind::Video, data, is_control)
        }
    }

    #[test]
    fn profiles_match_fixed_codecs() {
        let opus = CodecProfile::opus();
        assert_eq!(opus.encoding_name(), "opus");
        assert_eq!((opus.clock_rate, opus.channels), (48_000, Some(2)));

        let h264 = CodecProfile::h264_baseline();
        assert_eq!(h264.encoding_name(), "H264");
        assert_eq!(h264.profile_level_id(), Some(0x42e01f));
        assert!(h264.packetization_mode());
        let fb: Vec<_> = h264
            .rtcp_feedback
            .iter()
            .map(|f| (f.kind, f.parameter))
            .collect();
        assert_eq!(
            fb,
            vec![
                ("transport-cc", None),
                ("ccm", Some("fir")),
                ("nack", None),
                ("nack", Some("pli")),
                ("goog-remb", None),
            ]
        );
        assert!(!opus.packetization_mode());
        assert_eq!(opus.profile_level_id(), None);
    }

    #[tokio::test]
    async fn forwards_in_order_with_control_tag() {
        let mut wiring = MediaWiring::new("t");
        let mut sink = RecordingSink::default();
        let packets = vec![
            Packet::media(MediaKind::Video, vec![1]),
            Packet::control(MediaKind::Video, vec![2]),
            Packet::media(MediaKind::Audio, vec![3]),
            Packet::media(MediaKind::Video, vec![4]),
            Packet::control(MediaKind::Audio, vec![5]),
        ];

        let mut firsts = vec![];
        for p in &packets {
            firsts.push(wiring.forward(&mut sink, p).await.unwrap());
        }

        let expected: Vec<_> = packets
            .iter()
            .map(|p| (p.kind, p.is_control, p.data.clone()))
            .collect();
        assert_eq!(sink.seen, expected);
        assert_eq!(firsts, vec![true, false, true, false, false]);
    }

    #[tokio::test]
    async fn control_packet_does_not_trip_latch() {
        let mut wiring = MediaWiring::new("t");
        let mut sink = RecordingSink::default();
        let first = wiring
            .forward(&mut sink, &Packet::control(MediaKind::Video, vec![0x80]))
            .await
            .unwrap();
        assert!(!first);
        assert!(!wiring.has_received(MediaKind::Video));
    }

    #[tokio::test]
    async fn sink_error_propagates() {
        let mut wiring = MediaWiring::new("t");
        let mut sink = RecordingSink {
            fail_after: Some(1),
            ..Default::default()
        };
        let p = Packet::media(MediaKind::Audio, vec![9]);
        assert!(wiring.forward(&mut sink, &p).await.is_ok());
        assert!(wiring.forward(&mut sink, &p).await.is_err());
        assert_eq!(sink.seen.len(), 1);
    }
}
