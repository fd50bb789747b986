//! Track bindings
//!
//! Each negotiated transceiver is bound to a fixed relay channel. Even
//! channels carry media, the following odd channel carries that kind's
//! control stream, matching RTSP interleaved numbering.

use crate::model::packet::MediaKind;

/// Relay channel for audio RTP. Audio RTCP goes to `AUDIO_CHANNEL + 1`.
pub const AUDIO_CHANNEL: u8 = 0;
/// Relay channel for video RTP. Video RTCP goes to `VIDEO_CHANNEL + 1`.
pub const VIDEO_CHANNEL: u8 = 2;

/// A negotiated transceiver and the relay channel its packets land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackBinding {
    pub kind: MediaKind,
    pub channel: u8,
}

impl TrackBinding {
    pub fn for_kind(kind: MediaKind) -> TrackBinding {
        let channel = match kind {
            MediaKind::Audio => AUDIO_CHANNEL,
            MediaKind::Video => VIDEO_CHANNEL,
        };
        TrackBinding { kind, channel }
    }

    /// The channel a packet of this track is written to.
    pub fn channel_for(&self, is_control: bool) -> u8 {
        if is_control {
            self.channel + 1
        } else {
            self.channel
        }
    }
}

/// The local UDP ports the consumer is told to listen on.
///
/// RTP for each kind goes to the port itself, RTCP to the port above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediaPorts {
    pub audio: u16,
    pub video: u16,
}

impl MediaPorts {
    pub fn port_for(&self, kind: MediaKind, is_control: bool) -> u16 {
        let base = match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        };
        if is_control {
            base + 1
        } else {
            base
        }
    }
}

/// One-way "first packet received" markers, one per kind.
#[derive(Debug, Default)]
pub struct FirstPacketLatch {
    audio: bool,
    video: bool,
}

impl FirstPacketLatch {
    /// Marks `kind` as seen. Returns `true` only on the first call per kind.
    pub fn trip(&mut self, kind: MediaKind) -> bool {
        let seen = match kind {
            MediaKind::Audio => &mut self.audio,
            MediaKind::Video => &mut self.video,
        };
        !std::mem::replace(seen, true)
    }

    pub fn is_tripped(&self, kind: MediaKind) -> bool {
        match kind {
            MediaKind::Audio => self.audio,
            MediaKind::Video => self.video,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_uses_odd_channel() {
        let audio = TrackBinding::for_kind(MediaKind::Audio);
        let video = TrackBinding::for_kind(MediaKind::Video);
        assert_eq!((audio.channel_for(false), audio.channel_for(true)), (0, 1));
        assert_eq!((video.channel_for(false), video.channel_for(true)), (2, 3));
    }

    #[test]
    fn rtcp_port_follows_rtp_port() {
        let ports = MediaPorts {
            audio: 30000,
            video: 30010,
        };
        assert_eq!(ports.port_for(MediaKind::Audio, true), 30001);
        assert_eq!(ports.port_for(MediaKind::Video, false), 30010);
    }

    #[test]
    fn latch_trips_once_per_kind() {
        let mut latch = FirstPacketLatch::default();
        assert!(latch.trip(MediaKind::Video));
        assert!(!latch.trip(MediaKind::Video));
        assert!(!latch.is_tripped(MediaKind::Audio));
        assert!(latch.trip(MediaKind::Audio));
        assert!(latch.is_tripped(MediaKind::Audio));
    }
}
