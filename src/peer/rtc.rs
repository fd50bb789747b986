//! str0m-backed peer connection.
//!
//! str0m is sans-IO: this module owns the UDP socket and drives the `Rtc`
//! state machine the same way a server loop would, but one event at a time
//! so the session task can interleave it with its other inputs.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use async_trait::async_trait;
use str0m::change::{SdpAnswer, SdpOffer, SdpPendingOffer};
use str0m::media::{
    Direction as RtcDirection, KeyframeRequestKind, MediaKind as RtcMediaKind, Mid, Pt,
};
use str0m::net::{Protocol, Receive};
use str0m::rtp::RtpPacket;
use str0m::{Candidate, Event, IceConnectionState as RtcIceState, Input, Output, Rtc};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use super::{
    GatheringState, IceConnectionState, PeerConnection, PeerConnectionState, PeerEvent,
    PeerFactory,
};
use crate::error::{BridgeError, Result};
use crate::media::CodecProfile;
use crate::model::description::{Direction, IceCandidate, SdpType, SessionDescription};
use crate::model::packet::{MediaKind, Packet};
use crate::sdp::{payload_kinds, PayloadKinds};
use crate::util::{host_candidate, select_host_address};

const H264_PT: u8 = 102;
const H264_RTX_PT: u8 = 103;

pub struct RtcPeer {
    session: String,
    rtc: Rtc,
    socket: UdpSocket,
    local_addr: SocketAddr,
    buf: Vec<u8>,
    events: VecDeque<PeerEvent>,
    pending_media: Vec<(MediaKind, Direction)>,
    pending_channels: Vec<String>,
    pending_offer: Option<SdpPendingOffer>,
    remote_offer: Option<SdpOffer>,
    local: Option<SessionDescription>,
    gathering: GatheringState,
    payload_kinds: PayloadKinds,
    mids: HashMap<Mid, MediaKind>,
    closed: bool,
}

impl RtcPeer {
    /// Binds a UDP socket on the host's routable address.
    pub async fn bind(session: &str) -> Result<RtcPeer> {
        RtcPeer::bind_to(session, select_host_address()?).await
    }

    pub async fn bind_to(session: &str, ip: IpAddr) -> Result<RtcPeer> {
        let socket = UdpSocket::bind(SocketAddr::new(ip, 0)).await?;
        let local_addr = socket.local_addr()?;
        info!("Session({}): bound UDP port {}", session, local_addr);

        Ok(RtcPeer {
            session: session.to_string(),
            rtc: build_rtc(),
            socket,
            local_addr,
            buf: vec![0; 2000],
            events: VecDeque::new(),
            pending_media: vec![],
            pending_channels: vec![],
            pending_offer: None,
            remote_offer: None,
            local: None,
            gathering: GatheringState::New,
            payload_kinds: PayloadKinds::default(),
            mids: HashMap::new(),
            closed: false,
        })
    }

    /// Host candidates are known up front, so gathering completes at once.
    /// The candidates still go out as events for trickling callers.
    fn gather(&mut self) -> Result<()> {
        if self.gathering != GatheringState::New {
            return Ok(());
        }
        self.gathering = GatheringState::Gathering;

        let candidate = host_candidate(self.local_addr)?;
        let line = candidate.to_sdp_string();
        if self.rtc.add_local_candidate(candidate).is_some() {
            self.events
                .push_back(PeerEvent::LocalCandidate(IceCandidate::new(line)));
        }

        self.gathering = GatheringState::Complete;
        self.events.push_back(PeerEvent::GatheringComplete);
        Ok(())
    }

    fn remember_local(&mut self, description: SessionDescription) -> SessionDescription {
        self.payload_kinds.merge(payload_kinds(&description.sdp));
        self.local = Some(description.clone());
        description
    }

    fn fail(&mut self, reason: impl fmt::Debug) {
        warn!("Session({}) peer failed: {:?}", self.session, reason);
        self.rtc.disconnect();
        self.events
            .push_back(PeerEvent::ConnectionState(PeerConnectionState::Failed));
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::IceConnectionStateChange(state) => {
                info!("🔌 Session({}): ICE State = {:?}", self.session, state);
                self.events
                    .push_back(PeerEvent::IceConnectionState(ice_state(state)));
            }
            Event::Connected => {
                info!("Session({}): connected", self.session);
                self.events
                    .push_back(PeerEvent::ConnectionState(PeerConnectionState::Connected));
            }
            Event::MediaAdded(added) => {
                let kind = media_kind(added.kind);
                self.mids.insert(added.mid, kind);
                self.events.push_back(PeerEvent::TrackOpen(kind));
            }
            Event::RtpPacket(packet) => self.handle_rtp(packet),
            Event::ChannelOpen(cid, label) => {
                info!(
                    "Session({}): data channel '{}' open ({:?})",
                    self.session, label, cid
                );
            }
            _ => {}
        }
    }

    // str0m keeps RTCP to itself, so this peer only ever emits media packets.
    fn handle_rtp(&mut self, packet: RtpPacket) {
        let header = &packet.header;
        let pt = *header.payload_type;
        let Some(kind) = self.payload_kinds.kind_of(pt) else {
            debug!("Session({}): RTP with unknown pt {}", self.session, pt);
            return;
        };

        let data = rtp_bytes(
            header.marker,
            pt,
            header.sequence_number,
            header.timestamp,
            *header.ssrc,
            &packet.payload,
        );
        self.events
            .push_back(PeerEvent::Packet(Packet::media(kind, data)));
    }
}

fn build_rtc() -> Rtc {
    let h264 = CodecProfile::h264_baseline();
    let mut config = Rtc::builder()
        .set_rtp_mode(true)
        .clear_codecs()
        .enable_opus(true);
    config.codec_config().add_h264(
        Pt::from(H264_PT),
        Some(Pt::from(H264_RTX_PT)),
        h264.packetization_mode(),
        h264.profile_level_id().unwrap_or(0x42e01f),
    );
    config.build()
}

fn peer_err(e: impl fmt::Display) -> BridgeError {
    BridgeError::Peer(e.to_string())
}

fn media_kind(kind: RtcMediaKind) -> MediaKind {
    match kind {
        RtcMediaKind::Audio => MediaKind::Audio,
        RtcMediaKind::Video => MediaKind::Video,
    }
}

fn rtc_media_kind(kind: MediaKind) -> RtcMediaKind {
    match kind {
        MediaKind::Audio => RtcMediaKind::Audio,
        MediaKind::Video => RtcMediaKind::Video,
    }
}

fn rtc_direction(direction: Direction) -> RtcDirection {
    match direction {
        Direction::SendRecv => RtcDirection::SendRecv,
        Direction::SendOnly => RtcDirection::SendOnly,
        Direction::RecvOnly => RtcDirection::RecvOnly,
        Direction::Inactive => RtcDirection::Inactive,
    }
}

fn ice_state(state: RtcIceState) -> IceConnectionState {
    match state {
        RtcIceState::New => IceConnectionState::New,
        RtcIceState::Checking => IceConnectionState::Checking,
        RtcIceState::Connected => IceConnectionState::Connected,
        RtcIceState::Completed => IceConnectionState::Completed,
        RtcIceState::Disconnected => IceConnectionState::Disconnected,
    }
}

/// Serializes an RTP packet with a plain 12 byte header.
///
/// Header extensions negotiated with the browser mean nothing to the
/// consumer and are not carried over.
pub fn rtp_bytes(marker: bool, pt: u8, seq: u16, timestamp: u32, ssrc: u32, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + payload.len());
    out.push(0x80);
    out.push(((marker as u8) << 7) | (pt & 0x7f));
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(&ssrc.to_be_bytes());
    out.extend_from_slice(payload);
    out
}

#[async_trait]
impl PeerConnection for RtcPeer {
    fn add_transceiver(&mut self, profile: &CodecProfile, direction: Direction) -> Result<()> {
        if *profile != CodecProfile::for_kind(profile.kind) {
            return Err(BridgeError::Peer(format!(
                "{} is not configured for {}",
                profile.mime_type, profile.kind
            )));
        }
        self.pending_media.push((profile.kind, direction));
        Ok(())
    }

    fn create_data_channel(&mut self, label: &str) -> Result<()> {
        self.pending_channels.push(label.to_string());
        Ok(())
    }

    async fn create_offer(&mut self) -> Result<SessionDescription> {
        self.gather()?;

        let mut change = self.rtc.sdp_api();
        for (kind, direction) in self.pending_media.drain(..) {
            change.add_media(rtc_media_kind(kind), rtc_direction(direction), None, None, None);
        }
        for label in self.pending_channels.drain(..) {
            change.add_channel(label);
        }

        let (offer, pending) = change
            .apply()
            .ok_or_else(|| BridgeError::Peer("no media to offer".into()))?;
        self.pending_offer = Some(pending);

        Ok(self.remember_local(SessionDescription::offer(offer.to_sdp_string())))
    }

    async fn create_answer(&mut self) -> Result<SessionDescription> {
        let offer = self
            .remote_offer
            .take()
            .ok_or_else(|| BridgeError::Peer("no remote offer to answer".into()))?;
        self.gather()?;

        if !self.pending_media.is_empty() || !self.pending_channels.is_empty() {
            debug!(
                "Session({}): answering, media follows the remote offer",
                self.session
            );
            self.pending_media.clear();
            self.pending_channels.clear();
        }

        let answer = self.rtc.sdp_api().accept_offer(offer).map_err(peer_err)?;
        Ok(self.remember_local(SessionDescription::answer(answer.to_sdp_string())))
    }

    async fn set_local_description(&mut self, description: &SessionDescription) -> Result<()> {
        // str0m applies the local side when the offer or answer is created.
        match &self.local {
            Some(local) if local.sdp_type == description.sdp_type => Ok(()),
            _ => Err(BridgeError::Peer(format!(
                "{} was not created by this peer",
                description.sdp_type
            ))),
        }
    }

    async fn set_remote_description(&mut self, description: &SessionDescription) -> Result<()> {
        self.payload_kinds.merge(payload_kinds(&description.sdp));

        match description.sdp_type {
            SdpType::Offer => {
                let offer = SdpOffer::from_sdp_string(&description.sdp).map_err(peer_err)?;
                self.remote_offer = Some(offer);
            }
            SdpType::Answer => {
                let pending = self
                    .pending_offer
                    .take()
                    .ok_or_else(|| BridgeError::Peer("answer without a pending offer".into()))?;
                let answer = SdpAnswer::from_sdp_string(&description.sdp).map_err(peer_err)?;
                self.rtc
                    .sdp_api()
                    .accept_answer(pending, answer)
                    .map_err(peer_err)?;
            }
        }
        Ok(())
    }

    async fn add_ice_candidate(&mut self, candidate: &IceCandidate) -> Result<()> {
        if candidate.is_end_of_candidates() {
            return Ok(());
        }
        let line = candidate.candidate.trim();
        let line = line.strip_prefix("a=").unwrap_or(line);
        let remote = Candidate::from_sdp_string(line).map_err(peer_err)?;
        self.rtc.add_remote_candidate(remote);
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        self.local.clone()
    }

    fn gathering_state(&self) -> GatheringState {
        self.gathering
    }

    fn request_keyframe(&mut self, kind: MediaKind) -> Result<()> {
        let mid = self
            .mids
            .iter()
            .find(|(_, k)| **k == kind)
            .map(|(mid, _)| *mid)
            .ok_or_else(|| BridgeError::Peer(format!("no {kind} track yet")))?;

        let mut api = self.rtc.direct_api();
        let Some(stream) = api.stream_rx_by_mid(mid, None) else {
            return Err(BridgeError::Peer(format!("no {kind} receive stream")));
        };
        stream.request_keyframe(KeyframeRequestKind::Pli);
        Ok(())
    }

    async fn next_event(&mut self) -> Option<PeerEvent> {
        loop {
            if self.closed {
                return None;
            }
            if let Some(event) = self.events.pop_front() {
                return Some(event);
            }
            if !self.rtc.is_alive() {
                self.closed = true;
                return Some(PeerEvent::ConnectionState(PeerConnectionState::Closed));
            }

            let timeout = match self.rtc.poll_output() {
                Ok(Output::Timeout(t)) => t,
                Ok(Output::Transmit(transmit)) => {
                    if let Err(e) = self
                        .socket
                        .try_send_to(&transmit.contents, transmit.destination)
                    {
                        debug!("Session({}): UDP send failed: {}", self.session, e);
                    }
                    continue;
                }
                Ok(Output::Event(event)) => {
                    self.handle_event(event);
                    continue;
                }
                Err(e) => {
                    self.fail(e);
                    continue;
                }
            };

            let wait = timeout.saturating_duration_since(Instant::now());
            if wait.is_zero() {
                // Drive time forwards in rtc straight away.
                if let Err(e) = self.rtc.handle_input(Input::Timeout(Instant::now())) {
                    self.fail(e);
                }
                continue;
            }

            // Both branches are cancel safe, nothing is lost if the caller
            // drops this future while waiting here.
            let received = tokio::select! {
                res = self.socket.recv_from(&mut self.buf) => Some(res),
                _ = tokio::time::sleep(wait) => None,
            };

            let now = Instant::now();
            let result = match received {
                Some(Ok((n, source))) => {
                    let Ok(contents) = (&self.buf[..n]).try_into() else {
                        debug!("Session({}): unrecognized datagram from {}", self.session, source);
                        continue;
                    };
                    self.rtc.handle_input(Input::Receive(
                        now,
                        Receive {
                            proto: Protocol::Udp,
                            source,
                            destination: self.local_addr,
                            contents,
                        },
                    ))
                }
                Some(Err(e)) => {
                    self.fail(e);
                    continue;
                }
                None => self.rtc.handle_input(Input::Timeout(now)),
            };

            if let Err(e) = result {
                self.fail(e);
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.events.clear();
        self.rtc.disconnect();
        debug!("Session({}): peer closed", self.session);
    }
}

/// Builds an [`RtcPeer`] bound to the host address for every session.
#[derive(Debug, Default, Clone, Copy)]
pub struct RtcPeerFactory;

#[async_trait]
impl PeerFactory for RtcPeerFactory {
    async fn create(&self, session: &str) -> Result<Box<dyn PeerConnection>> {
        Ok(Box::new(RtcPeer::bind(session).await?))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::model::description::SignalingSetup;

    #[test]
    fn rtp_header_layout() {
        let bytes = rtp_bytes(true, 102, 0x0102, 0x0A0B0C0D, 0xDEADBEEF, &[0xFF]);
        assert_eq!(
            bytes,
            vec![0x80, 0x80 | 102, 0x01, 0x02, 0x0A, 0x0B, 0x0C, 0x0D, 0xDE, 0xAD, 0xBE, 0xEF, 0xFF]
        );
        let plain = rtp_bytes(false, 111, 0, 0, 0, &[]);
        assert_eq!(plain[1], 111);
        assert_eq!(plain.len(), 12);
    }

    #[tokio::test]
    async fn offer_and_answer_carry_fixed_codecs() {
        let localhost = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut offerer = RtcPeer::bind_to("offerer", localhost).await.unwrap();
        let mut answerer = RtcPeer::bind_to("answerer", localhost).await.unwrap();

        crate::media::attach_transceivers(&mut offerer, &SignalingSetup::default()).unwrap();
        let offer = offerer.create_offer().await.unwrap();
        offerer.set_local_description(&offer).await.unwrap();

        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("opus/48000/2"));
        assert!(offer.sdp.contains("H264/90000"));
        assert_eq!(offerer.gathering_state(), GatheringState::Complete);

        answerer.set_remote_description(&offer).await.unwrap();
        let answer = answerer.create_answer().await.unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert!(answer.sdp.contains("m=video"));

        offerer.set_remote_description(&answer).await.unwrap();
        assert_eq!(answerer.gathering_state(), GatheringState::Complete);
        assert_eq!(answerer.events.back(), Some(&PeerEvent::GatheringComplete));
    }

    #[tokio::test]
    async fn answer_needs_an_offer() {
        let mut peer = RtcPeer::bind_to("p", IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        assert!(peer.create_answer().await.is_err());
        assert!(peer
            .set_remote_description(&SessionDescription::answer("v=0"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn closed_peer_yields_nothing() {
        let mut peer = RtcPeer::bind_to("p", IpAddr::V4(Ipv4Addr::LOCALHOST))
            .await
            .unwrap();
        peer.close();
        peer.close();
        assert_eq!(peer.next_event().await, None);
    }
}
