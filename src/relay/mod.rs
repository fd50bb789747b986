//! Local relay
//!
//! The relay owns the single consumer connection. In UDP mode it writes the
//! rewritten SDP down the TCP connection and then sends every packet to the
//! advertised UDP ports on loopback. In interleaved mode it completes an RTSP
//! handshake and then frames every packet onto the same TCP connection.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream, UdpSocket,
    },
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::config::TransportMode;
use crate::error::{BridgeError, Result};
use crate::model::packet::MediaKind;
use crate::model::tracks::{MediaPorts, AUDIO_CHANNEL, VIDEO_CHANNEL};

pub mod rtsp;

/// Where forwarded packets end up.
#[async_trait]
pub trait PacketSink: Send {
    async fn send_audio(&mut self, data: &[u8], is_control: bool) -> Result<()>;
    async fn send_video(&mut self, data: &[u8], is_control: bool) -> Result<()>;
}

pub struct LocalRelay {
    session: String,
    mode: TransportMode,
    reader: Option<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
    udp: Option<UdpSocket>,
    sdp: Option<String>,
    audio_channel: u8,
    video_channel: u8,
    udp_ports: Option<MediaPorts>,
    playing: bool,
    watch: Option<JoinHandle<()>>,
}

impl LocalRelay {
    /// `udp` is only used in [`TransportMode::Udp`].
    pub fn new(
        session: impl Into<String>,
        mode: TransportMode,
        client: TcpStream,
        udp: Option<UdpSocket>,
    ) -> LocalRelay {
        // Packets are small and latency matters more than batching.
        if let Err(e) = client.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        let (reader, writer) = client.into_split();
        LocalRelay {
            session: session.into(),
            mode,
            reader: Some(BufReader::new(reader)),
            writer,
            udp,
            sdp: None,
            audio_channel: AUDIO_CHANNEL,
            video_channel: VIDEO_CHANNEL,
            udp_ports: None,
            playing: false,
            watch: None,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn set_sdp(&mut self, sdp: String) {
        self.sdp = Some(sdp);
    }

    pub fn set_channels(&mut self, audio: u8, video: u8) {
        self.audio_channel = audio;
        self.video_channel = video;
    }

    pub fn set_udp_ports(&mut self, ports: MediaPorts) {
        self.udp_ports = Some(ports);
    }

    /// UDP mode: writes the SDP to the consumer and closes our side of the
    /// TCP connection. The consumer then listens on the ports named in it.
    pub async fn send_sdp(&mut self) -> Result<()> {
        let sdp = self
            .sdp
            .as_deref()
            .ok_or_else(|| BridgeError::Signaling("no sdp to send".into()))?;
        self.writer.write_all(format!("{sdp}\r\n").as_bytes()).await?;
        self.writer.shutdown().await?;
        info!("Session({}): sdp sent", self.session);
        Ok(())
    }

    /// Interleaved mode: serves the consumer's RTSP requests until PLAY.
    pub async fn handle_setup(&mut self) -> Result<()> {
        let sdp = self
            .sdp
            .clone()
            .ok_or_else(|| BridgeError::Signaling("no sdp to describe".into()))?;
        let mut reader = self
            .reader
            .take()
            .ok_or_else(|| BridgeError::Rtsp("consumer connection is already watched".into()))?;

        let result = rtsp::handshake(&mut reader, &mut self.writer, &sdp, &self.session).await;
        self.reader = Some(reader);
        result?;

        self.playing = true;
        Ok(())
    }

    /// Watches the consumer connection for close or error, discarding
    /// anything it sends. `on_close` runs once with the error, if any.
    pub fn watch_client<F>(&mut self, on_close: F)
    where
        F: FnOnce(Option<io::Error>) + Send + 'static,
    {
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        self.watch = Some(tokio::spawn(async move {
            let mut buf = vec![0; 2000];
            loop {
                match reader.read(&mut buf).await {
                    Ok(0) => break on_close(None),
                    Ok(_) => {}
                    Err(e) => break on_close(Some(e)),
                }
            }
        }));
    }

    async fn send(&mut self, kind: MediaKind, data: &[u8], is_control: bool) -> Result<()> {
        match self.mode {
            TransportMode::Udp => {
                let (Some(udp), Some(ports)) = (&self.udp, self.udp_ports) else {
                    debug!("Session({}): dropping {} packet, no udp ports yet", self.session, kind);
                    return Ok(());
                };
                let port = ports.port_for(kind, is_control);
                let target = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
                udp.send_to(data, target).await?;
            }
            TransportMode::TcpInterleaved => {
                if !self.playing {
                    debug!("Session({}): dropping {} packet, not playing", self.session, kind);
                    return Ok(());
                }
                let base = match kind {
                    MediaKind::Audio => self.audio_channel,
                    MediaKind::Video => self.video_channel,
                };
                let channel = if is_control { base + 1 } else { base };
                let frame = rtsp::interleaved_frame(channel, data)?;
                self.writer.write_all(&frame).await?;
            }
        }
        Ok(())
    }

    /// Closes the consumer connection and the UDP socket.
    pub async fn close(mut self) {
        if let Some(watch) = self.watch.take() {
            watch.abort();
        }
        // Already shut down in UDP mode after the SDP went out.
        if let Err(e) = self.writer.shutdown().await {
            debug!("Session({}): consumer shutdown: {}", self.session, e);
        }
        self.udp.take();
    }
}

impl Drop for LocalRelay {
    fn drop(&mut self) {
        if let Some(watch) = self.watch.take() {
            watch.abort();
        }
    }
}

#[async_trait]
impl PacketSink for LocalRelay {
    async fn send_audio(&mut self, data: &[u8], is_control: bool) -> Result<()> {
        self.send(MediaKind::Audio, data, is_control).await
    }

    async fn send_video(&mut self, data: &[u8], is_control: bool) -> Result<()> {
        self.send(MediaKind::Video, data, is_control).await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::{net::TcpListener, sync::oneshot, time::timeout};

    use super::*;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn udp_mode_sends_sdp_then_half_closes() {
        let (mut consumer, accepted) = pair().await;
        let mut relay = LocalRelay::new("t", TransportMode::Udp, accepted, None);
        relay.set_sdp("v=0\r\nm=audio 1 RTP/AVP 0".to_string());
        relay.send_sdp().await.unwrap();

        let mut text = String::new();
        consumer.read_to_string(&mut text).await.unwrap();
        assert_eq!(text, "v=0\r\nm=audio 1 RTP/AVP 0\r\n");
    }

    #[tokio::test]
    async fn udp_mode_routes_rtp_and_rtcp_ports() {
        let (_consumer, accepted) = pair().await;
        let rtp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let base = rtp.local_addr().unwrap().port();
        let rtcp = match UdpSocket::bind(("127.0.0.1", base + 1)).await {
            Ok(s) => s,
            // Neighbouring port taken, nothing meaningful to assert.
            Err(_) => return,
        };

        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut relay = LocalRelay::new("t", TransportMode::Udp, accepted, Some(udp));
        relay.set_udp_ports(MediaPorts {
            audio: base,
            video: base,
        });

        relay.send_audio(&[1, 2, 3], false).await.unwrap();
        relay.send_video(&[4], true).await.unwrap();

        let mut buf = [0u8; 16];
        let n = timeout(Duration::from_secs(2), rtp.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        let n = timeout(Duration::from_secs(2), rtcp.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], &[4]);
    }

    #[tokio::test]
    async fn packets_before_ports_are_dropped() {
        let (_consumer, accepted) = pair().await;
        let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut relay = LocalRelay::new("t", TransportMode::Udp, accepted, Some(udp));
        assert!(relay.send_audio(&[1], false).await.is_ok());
    }

    #[tokio::test]
    async fn interleaved_mode_frames_on_tcp() {
        let (mut consumer, accepted) = pair().await;
        let mut relay = LocalRelay::new("t", TransportMode::TcpInterleaved, accepted, None);
        relay.playing = true;

        relay.send_video(&[9, 9], false).await.unwrap();
        relay.send_audio(&[7], true).await.unwrap();

        let mut buf = [0u8; 11];
        consumer.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [b'$', 2, 0, 2, 9, 9, b'$', 1, 0, 1, 7]);
    }

    #[tokio::test]
    async fn watch_reports_consumer_close() {
        let (consumer, accepted) = pair().await;
        let mut relay = LocalRelay::new("t", TransportMode::Udp, accepted, None);
        let (tx, rx) = oneshot::channel();
        relay.watch_client(move |err| {
            let _ = tx.send(err.is_none());
        });

        drop(consumer);
        let clean = timeout(Duration::from_secs(2), rx).await.unwrap().unwrap();
        assert!(clean);
    }
}
