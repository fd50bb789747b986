//! Session orchestrator
//!
//! [`Bridge::create_session`] sets up the consumer side of a session and
//! returns at once. Everything after that happens in one task per session
//! that owns all of the session's state: it waits for the consumer, starts
//! signaling, serves the [`SessionHandle`] calls, forwards packets and
//! finally tears everything down.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, TransportMode};
use crate::error::{BridgeError, Result};
use crate::media::{attach_transceivers, MediaWiring};
use crate::model::description::{
    NegotiationRole, SdpType, SessionDescription, SignalingSetup,
};
use crate::model::descriptor::SessionDescriptor;
use crate::model::packet::{MediaKind, Packet};
use crate::model::tracks::{MediaPorts, AUDIO_CHANNEL, VIDEO_CHANNEL};
use crate::peer::{
    GatheringState, IceConnectionState, PeerConnection, PeerConnectionState, PeerEvent,
    PeerFactory, RtcPeerFactory,
};
use crate::relay::LocalRelay;
use crate::sdp;
use crate::signaling::{
    CandidateSender, EndSession, SessionCommand, SessionHandle, SignalingChannel,
};
use crate::util::allocate_ports;

/// Creates bridge sessions.
#[derive(Clone)]
pub struct Bridge {
    config: BridgeConfig,
    peers: Arc<dyn PeerFactory>,
}

/// What the caller gets back from [`Bridge::create_session`].
#[derive(Debug, Clone)]
pub struct BridgeSession {
    pub descriptor: SessionDescriptor,
    pub handle: SessionHandle,
    pub ports: MediaPorts,
    pub started_at: DateTime<Utc>,
}

impl Bridge {
    /// A bridge whose sessions use str0m peer connections.
    pub fn new(config: BridgeConfig) -> Bridge {
        Bridge::with_peer_factory(config, Arc::new(RtcPeerFactory))
    }

    pub fn with_peer_factory(config: BridgeConfig, peers: Arc<dyn PeerFactory>) -> Bridge {
        Bridge { config, peers }
    }

    /// Allocates the session's ports and local listener and spawns the
    /// session task. Returns as soon as the consumer can connect.
    pub async fn create_session(
        &self,
        channel: Arc<dyn SignalingChannel>,
        id: &str,
        name: &str,
    ) -> Result<BridgeSession> {
        self.config.check_port_range()?;
        let ports = allocate_ports(
            &mut rand::thread_rng(),
            self.config.port_range_start,
            self.config.port_range_end,
        );

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let udp = match self.config.mode {
            TransportMode::Udp => Some(UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?),
            TransportMode::TcpInterleaved => None,
        };

        let descriptor = SessionDescriptor::new(self.config.mode, port, id, name);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = SessionHandle::new(id, tx);

        info!(
            "Session({}): waiting for consumer on {} (audio {}, video {})",
            id, descriptor.url, ports.audio, ports.video
        );

        let task = SessionTask {
            id: id.to_string(),
            config: self.config.clone(),
            peers: self.peers.clone(),
            channel,
            listener,
            udp,
            ports,
            handle: handle.clone(),
        };
        tokio::spawn(task.run(rx));

        Ok(BridgeSession {
            descriptor,
            handle,
            ports,
            started_at: Utc::now(),
        })
    }
}

/// Why a session ended.
#[derive(Debug)]
enum CloseReason {
    Requested,
    ClientClosed,
    ClientError(String),
    Ice(IceConnectionState),
    Connection(PeerConnectionState),
    PeerGone,
    Failed(String),
    SignalingFailed(String),
    RelayFailed(String),
    NegotiationTimeout,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => f.write_str("close requested"),
            CloseReason::ClientClosed => f.write_str("consumer disconnected"),
            CloseReason::ClientError(e) => write!(f, "consumer socket error: {e}"),
            CloseReason::Ice(s) => write!(f, "ICE state {s:?}"),
            CloseReason::Connection(s) => write!(f, "connection state {s:?}"),
            CloseReason::PeerGone => f.write_str("peer connection ended"),
            CloseReason::Failed(e) => write!(f, "negotiation failed: {e}"),
            CloseReason::SignalingFailed(e) => write!(f, "signaling failed to start: {e}"),
            CloseReason::RelayFailed(e) => write!(f, "relay failed: {e}"),
            CloseReason::NegotiationTimeout => f.write_str("negotiation timed out"),
        }
    }
}

struct SessionTask {
    id: String,
    config: BridgeConfig,
    peers: Arc<dyn PeerFactory>,
    channel: Arc<dyn SignalingChannel>,
    listener: TcpListener,
    udp: Option<UdpSocket>,
    ports: MediaPorts,
    handle: SessionHandle,
}

impl SessionTask {
    async fn run(self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let SessionTask {
            id,
            config,
            peers,
            channel,
            listener,
            udp,
            ports,
            handle,
        } = self;

        let client = match accept_client(&id, &listener, &mut commands, config.client_connect_timeout()).await {
            Ok(Some(client)) => client,
            Ok(None) => {
                info!("Session({}): closed before the consumer connected", id);
                drain(&id, commands).await;
                return;
            }
            Err(e) => {
                warn!("Session({}): no consumer: {}", id, e);
                drain(&id, commands).await;
                return;
            }
        };
        drop(listener);

        let peer = match peers.create(&id).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Session({}): could not create peer connection: {}", id, e);
                drain(&id, commands).await;
                return;
            }
        };

        let mut relay = LocalRelay::new(id.clone(), config.mode, client, udp);
        relay.set_channels(AUDIO_CHANNEL, VIDEO_CHANNEL);
        if config.mode == TransportMode::Udp {
            watch_consumer(&mut relay, &handle);
        }

        start_signaling(channel, handle.clone());

        let negotiation_deadline = config.negotiation_timeout().map(|d| Instant::now() + d);
        let mut state = SessionState::new(id.clone(), config, ports, handle, peer, relay);

        while !state.closed {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => state.handle_command(command).await,
                    None => state.cleanup(CloseReason::Requested).await,
                },
                event = state.peer.next_event() => match event {
                    Some(event) => state.handle_event(event).await,
                    None => state.cleanup(CloseReason::PeerGone).await,
                },
                joined = join_handshake(&mut state.handshake) => {
                    state.finish_handshake(joined).await
                }
                _ = sleep_until(negotiation_deadline), if !state.is_active() => {
                    state.cleanup(CloseReason::NegotiationTimeout).await
                }
            }
        }

        drain(&id, commands).await;
        debug!("Session({}): task done", id);
    }
}

/// Waits for the one consumer connection. `None` if the session was closed
/// first.
async fn accept_client(
    id: &str,
    listener: &TcpListener,
    commands: &mut mpsc::UnboundedReceiver<SessionCommand>,
    limit: Option<Duration>,
) -> Result<Option<TcpStream>> {
    let deadline = limit.map(|d| Instant::now() + d);
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (client, addr) = accepted?;
                info!("Session({}): consumer connected from {}", id, addr);
                return Ok(Some(client));
            }
            command = commands.recv() => match command {
                None | Some(SessionCommand::Close) => return Ok(None),
                Some(command) => refuse(id, command, || {
                    BridgeError::Signaling("consumer is not connected yet".into())
                }).await,
            },
            _ = sleep_until(deadline) => return Err(BridgeError::Timeout("local consumer")),
        }
    }
}

fn watch_consumer(relay: &mut LocalRelay, handle: &SessionHandle) {
    let handle = handle.clone();
    relay.watch_client(move |error| {
        let _ = handle.send(SessionCommand::ClientClosed(error));
    });
}

/// Runs `start_session` off the session task so the channel can drive the
/// handle while it starts.
fn start_signaling(channel: Arc<dyn SignalingChannel>, handle: SessionHandle) {
    tokio::spawn(async move {
        let command = match channel.start_session(handle.clone()).await {
            Ok(end) => SessionCommand::SignalingStarted(end),
            Err(e) => SessionCommand::SignalingFailed(e),
        };
        // The session is already gone, end it here instead.
        if let Err(SessionCommand::SignalingStarted(end)) = handle.send(command) {
            end_session(handle.id(), end).await;
        }
    });
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// An interleaved consumer's RTSP handshake, running on its own task with
/// the relay it talks through.
type Handshake = JoinHandle<(LocalRelay, Result<()>)>;

fn spawn_handshake(mut relay: LocalRelay, limit: Option<Duration>) -> Handshake {
    tokio::spawn(async move {
        let result = match limit {
            Some(limit) => tokio::time::timeout(limit, relay.handle_setup())
                .await
                .unwrap_or(Err(BridgeError::Timeout("rtsp handshake"))),
            None => relay.handle_setup().await,
        };
        (relay, result)
    })
}

async fn join_handshake(
    handshake: &mut Option<Handshake>,
) -> std::result::Result<(LocalRelay, Result<()>), JoinError> {
    match handshake {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn end_session(id: &str, end: Box<dyn EndSession>) {
    if let Err(e) = end.end().await {
        warn!("Session({}): ending signaling failed: {}", id, e);
    }
}

/// Answers a command the session can no longer serve.
async fn refuse(id: &str, command: SessionCommand, error: impl Fn() -> BridgeError) {
    match command {
        SessionCommand::CreateLocalDescription { reply, .. } => {
            let _ = reply.send(Err(error()));
        }
        SessionCommand::SetRemoteDescription { reply, .. } => {
            let _ = reply.send(Err(error()));
        }
        SessionCommand::AddIceCandidate { reply, .. } => {
            let _ = reply.send(Err(error()));
        }
        SessionCommand::SignalingStarted(end) => end_session(id, end).await,
        other => debug!("Session({}): ignoring {:?}", id, other),
    }
}

/// Stops accepting commands and answers whatever is still queued.
async fn drain(id: &str, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
    commands.close();
    while let Ok(command) = commands.try_recv() {
        refuse(id, command, || BridgeError::SessionClosed).await;
    }
}

enum LocalDescription {
    Ready(SessionDescription),
    /// Gathering is still running. Holds the description as created, for
    /// when the peer has no better one once gathering completes.
    Gathering(SessionDescription),
}

struct PendingDescription {
    reply: oneshot::Sender<Result<SessionDescription>>,
    fallback: SessionDescription,
}

enum RemoteDescription {
    Applied,
    /// Applied to the peer once the consumer has sent PLAY.
    AwaitingConsumer(SessionDescription),
}

struct PendingRemote {
    description: SessionDescription,
    reply: oneshot::Sender<Result<()>>,
}

struct SessionState {
    id: String,
    config: BridgeConfig,
    ports: MediaPorts,
    handle: SessionHandle,
    peer: Box<dyn PeerConnection>,
    relay: Option<LocalRelay>,
    wiring: MediaWiring,
    role: Option<NegotiationRole>,
    setup_done: bool,
    local_set: bool,
    remote_set: bool,
    candidates: Option<CandidateSender>,
    pending: Option<PendingDescription>,
    pending_remote: Option<PendingRemote>,
    handshake: Option<Handshake>,
    keyframe_timer: Option<JoinHandle<()>>,
    end_session: Option<Box<dyn EndSession>>,
    closed: bool,
}

impl SessionState {
    fn new(
        id: String,
        config: BridgeConfig,
        ports: MediaPorts,
        handle: SessionHandle,
        peer: Box<dyn PeerConnection>,
        relay: LocalRelay,
    ) -> SessionState {
        SessionState {
            wiring: MediaWiring::new(id.clone()),
            id,
            config,
            ports,
            handle,
            peer,
            relay: Some(relay),
            role: None,
            setup_done: false,
            local_set: false,
            remote_set: false,
            candidates: None,
            pending: None,
            pending_remote: None,
            handshake: None,
            keyframe_timer: None,
            end_session: None,
            closed: false,
        }
    }

    /// Both descriptions are applied and media can flow.
    fn is_active(&self) -> bool {
        self.local_set && self.remote_set
    }

    async fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::CreateLocalDescription {
                sdp_type,
                setup,
                candidates,
                reply,
            } => match self.create_local_description(sdp_type, &setup, candidates).await {
                Ok(LocalDescription::Ready(description)) => {
                    let _ = reply.send(Ok(description));
                }
                Ok(LocalDescription::Gathering(fallback)) => {
                    debug!("Session({}): waiting for gathering", self.id);
                    self.pending = Some(PendingDescription { reply, fallback });
                }
                Err(e) => self.fail(reply, e).await,
            },
            SessionCommand::SetRemoteDescription {
                description,
                setup,
                reply,
            } => match self.set_remote_description(description, &setup).await {
                Ok(RemoteDescription::Applied) => {
                    let _ = reply.send(Ok(()));
                }
                Ok(RemoteDescription::AwaitingConsumer(description)) => {
                    debug!("Session({}): waiting for the rtsp handshake", self.id);
                    self.pending_remote = Some(PendingRemote { description, reply });
                }
                Err(e) => self.fail(reply, e).await,
            },
            SessionCommand::AddIceCandidate { candidate, reply } => {
                let result = self.peer.add_ice_candidate(&candidate).await;
                if let Err(e) = &result {
                    debug!("Session({}): remote candidate rejected: {}", self.id, e);
                }
                let _ = reply.send(result);
            }
            SessionCommand::SignalingStarted(end) => {
                debug!("Session({}): signaling started", self.id);
                self.end_session = Some(end);
            }
            SessionCommand::SignalingFailed(e) => {
                self.cleanup(CloseReason::SignalingFailed(e.to_string())).await
            }
            SessionCommand::ClientClosed(None) => self.cleanup(CloseReason::ClientClosed).await,
            SessionCommand::ClientClosed(Some(e)) => {
                self.cleanup(CloseReason::ClientError(e.to_string())).await
            }
            SessionCommand::RequestKeyframe => {
                if let Err(e) = self.peer.request_keyframe(MediaKind::Video) {
                    debug!("Session({}): keyframe request skipped: {}", self.id, e);
                }
            }
            SessionCommand::Close => self.cleanup(CloseReason::Requested).await,
        }
    }

    /// Replies with `error`. Anything beyond a rejected call ends the session.
    async fn fail<T>(&mut self, reply: oneshot::Sender<Result<T>>, error: BridgeError) {
        warn!("Session({}): {}", self.id, error);
        let reason = (!error.is_call_local()).then(|| CloseReason::Failed(error.to_string()));
        let _ = reply.send(Err(error));
        if let Some(reason) = reason {
            self.cleanup(reason).await;
        }
    }

    fn claim_role(&mut self, role: NegotiationRole, attempted: String) -> Result<()> {
        match self.role {
            Some(current) if current != role => Err(BridgeError::RoleMismatch {
                role: current,
                attempted,
            }),
            _ => {
                self.role = Some(role);
                Ok(())
            }
        }
    }

    fn run_setup(&mut self, setup: &SignalingSetup) -> Result<()> {
        if self.setup_done {
            return Ok(());
        }
        attach_transceivers(&mut *self.peer, setup)?;
        self.setup_done = true;
        Ok(())
    }

    async fn create_local_description(
        &mut self,
        sdp_type: SdpType,
        setup: &SignalingSetup,
        candidates: Option<CandidateSender>,
    ) -> Result<LocalDescription> {
        self.claim_role(
            NegotiationRole::for_local(sdp_type),
            format!("create a local {sdp_type}"),
        )?;
        if self.local_set {
            return Err(BridgeError::Renegotiation);
        }

        if sdp_type == SdpType::Offer {
            self.run_setup(setup)?;
        }
        if let Some(channel) = &setup.datachannel {
            self.peer.create_data_channel(&channel.label)?;
        }

        let streaming = candidates.is_some();
        self.candidates = candidates;

        let description = match sdp_type {
            SdpType::Offer => self.peer.create_offer().await?,
            SdpType::Answer => self.peer.create_answer().await?,
        };
        self.peer.set_local_description(&description).await?;
        self.local_set = true;
        info!("Session({}): local {} set", self.id, sdp_type);

        if streaming {
            return Ok(LocalDescription::Ready(description));
        }
        if self.peer.gathering_state() == GatheringState::Complete {
            let full = self.peer.local_description().unwrap_or(description);
            return Ok(LocalDescription::Ready(full));
        }
        Ok(LocalDescription::Gathering(description))
    }

    async fn set_remote_description(
        &mut self,
        description: SessionDescription,
        setup: &SignalingSetup,
    ) -> Result<RemoteDescription> {
        self.claim_role(
            NegotiationRole::for_remote(description.sdp_type),
            format!("accept a remote {}", description.sdp_type),
        )?;
        if self.remote_set || self.handshake.is_some() {
            return Err(BridgeError::Renegotiation);
        }

        if description.sdp_type == SdpType::Offer {
            self.run_setup(setup)?;
        }

        let rewritten = sdp::rewrite(&description.sdp, self.ports.audio, self.ports.video)?;
        let relay = self.relay.as_mut().ok_or(BridgeError::SessionClosed)?;
        relay.set_sdp(rewritten);

        match relay.mode() {
            TransportMode::Udp => {
                relay.set_udp_ports(self.ports);
                relay.send_sdp().await?;
            }
            TransportMode::TcpInterleaved => {
                if let Some(relay) = self.relay.take() {
                    self.handshake = Some(spawn_handshake(relay, self.config.negotiation_timeout()));
                }
                return Ok(RemoteDescription::AwaitingConsumer(description));
            }
        }

        self.apply_remote(&description).await?;
        Ok(RemoteDescription::Applied)
    }

    async fn apply_remote(&mut self, description: &SessionDescription) -> Result<()> {
        self.peer.set_remote_description(description).await?;
        self.remote_set = true;
        info!("Session({}): remote {} set", self.id, description.sdp_type);
        Ok(())
    }

    /// Takes the relay back from the handshake task and completes the
    /// remote description that was waiting on it.
    async fn finish_handshake(
        &mut self,
        joined: std::result::Result<(LocalRelay, Result<()>), JoinError>,
    ) {
        self.handshake = None;
        let result = match joined {
            Ok((mut relay, result)) => {
                if result.is_ok() {
                    watch_consumer(&mut relay, &self.handle);
                }
                self.relay = Some(relay);
                result
            }
            Err(e) => Err(BridgeError::Rtsp(format!("handshake task: {e}"))),
        };

        let Some(PendingRemote { description, reply }) = self.pending_remote.take() else {
            return;
        };
        let result = match result {
            Ok(()) => self.apply_remote(&description).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                let _ = reply.send(Ok(()));
            }
            Err(e) => self.fail(reply, e).await,
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                if let Some(tx) = &self.candidates {
                    if tx.send(candidate).is_err() {
                        debug!("Session({}): candidate receiver dropped", self.id);
                        self.candidates = None;
                    }
                }
            }
            PeerEvent::GatheringComplete => {
                if let Some(pending) = self.pending.take() {
                    let description = self.peer.local_description().unwrap_or(pending.fallback);
                    let _ = pending.reply.send(Ok(description));
                }
            }
            PeerEvent::IceConnectionState(state) => {
                info!("Session({}): ICE {:?}", self.id, state);
                if state.is_terminal() {
                    self.cleanup(CloseReason::Ice(state)).await;
                }
            }
            PeerEvent::ConnectionState(state) => {
                info!("Session({}): connection {:?}", self.id, state);
                if state.is_terminal() {
                    self.cleanup(CloseReason::Connection(state)).await;
                }
            }
            PeerEvent::TrackOpen(kind) => info!("Session({}): {} track open", self.id, kind),
            PeerEvent::Packet(packet) => self.forward(packet).await,
        }
    }

    async fn forward(&mut self, packet: Packet) {
        let Some(relay) = self.relay.as_mut() else {
            return;
        };
        match self.wiring.forward(relay, &packet).await {
            Ok(true) if packet.kind == MediaKind::Video => self.start_keyframe_timer(),
            Ok(_) => {}
            Err(e) => self.cleanup(CloseReason::RelayFailed(e.to_string())).await,
        }
    }

    fn start_keyframe_timer(&mut self) {
        let Some(period) = self.config.keyframe_interval() else {
            return;
        };
        if self.keyframe_timer.is_some() {
            return;
        }
        let handle = self.handle.clone();
        self.keyframe_timer = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            // The first tick is immediate.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if handle.send(SessionCommand::RequestKeyframe).is_err() {
                    break;
                }
            }
        }));
    }

    /// Releases everything the session holds. Runs its effects once, later
    /// calls return immediately.
    async fn cleanup(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("Session({}): cleaning up, {}", self.id, reason);

        self.peer.close();
        // Dropping the handshake task drops the relay it holds.
        if let Some(handshake) = self.handshake.take() {
            handshake.abort();
        }
        if let Some(relay) = self.relay.take() {
            relay.close().await;
        }
        if let Some(timer) = self.keyframe_timer.take() {
            timer.abort();
        }
        self.candidates = None;
        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(BridgeError::SessionClosed));
        }
        if let Some(pending) = self.pending_remote.take() {
            let _ = pending.reply.send(Err(BridgeError::SessionClosed));
        }
        if let Some(end) = self.end_session.take() {
            end_session(&self.id, end).await;
        }
    }
}
