//! Signaling session handler
//!
//! A [`SignalingChannel`] is whatever carries offers, answers and
//! candidates to the remote device. The bridge hands it a [`SessionHandle`]
//! once the local consumer is connected; the channel drives negotiation
//! through the handle and gives back an [`EndSession`] that runs when the
//! session is torn down.

use std::io;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{BridgeError, Result};
use crate::model::description::{IceCandidate, SdpType, SessionDescription, SignalingSetup};

/// Receives local candidates as they are discovered.
pub type CandidateSender = mpsc::UnboundedSender<IceCandidate>;

/// Runs once when the session ends. Failures are logged, never propagated.
#[async_trait]
pub trait EndSession: Send {
    async fn end(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Starts negotiation for one session. Resolves once the channel has
    /// taken over the session.
    async fn start_session(&self, session: SessionHandle) -> Result<Box<dyn EndSession>>;
}

type Reply<T> = oneshot::Sender<Result<T>>;

/// Messages the session task acts on.
pub(crate) enum SessionCommand {
    CreateLocalDescription {
        sdp_type: SdpType,
        setup: SignalingSetup,
        candidates: Option<CandidateSender>,
        reply: Reply<SessionDescription>,
    },
    SetRemoteDescription {
        description: SessionDescription,
        setup: SignalingSetup,
        reply: Reply<()>,
    },
    AddIceCandidate {
        candidate: IceCandidate,
        reply: Reply<()>,
    },
    SignalingStarted(Box<dyn EndSession>),
    SignalingFailed(BridgeError),
    ClientClosed(Option<io::Error>),
    RequestKeyframe,
    Close,
}

/// Cheap handle to a running session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    id: String,
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub(crate) fn new(id: impl Into<String>, commands: mpsc::UnboundedSender<SessionCommand>) -> SessionHandle {
        SessionHandle {
            id: id.into(),
            commands,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> SessionCommand) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .map_err(|_| BridgeError::SessionClosed)?;
        rx.await.map_err(|_| BridgeError::SessionClosed)?
    }

    /// Creates the local offer or answer and sets it as the local
    /// description.
    ///
    /// With `candidates`, the description comes back as soon as it exists
    /// and every local candidate is sent on the channel once, in discovery
    /// order. Without, the call waits for gathering to finish and the
    /// returned description embeds every candidate.
    pub async fn create_local_description(
        &self,
        sdp_type: SdpType,
        setup: SignalingSetup,
        candidates: Option<CandidateSender>,
    ) -> Result<SessionDescription> {
        self.call(|reply| SessionCommand::CreateLocalDescription {
            sdp_type,
            setup,
            candidates,
            reply,
        })
        .await
    }

    /// Hands the remote description to the consumer, rewritten for the
    /// session's ports, then applies it to the peer connection.
    pub async fn set_remote_description(
        &self,
        description: SessionDescription,
        setup: SignalingSetup,
    ) -> Result<()> {
        self.call(|reply| SessionCommand::SetRemoteDescription {
            description,
            setup,
            reply,
        })
        .await
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.call(|reply| SessionCommand::AddIceCandidate { candidate, reply })
            .await
    }

    /// Tears the session down. Safe to call any number of times.
    pub fn close(&self) {
        let _ = self.commands.send(SessionCommand::Close);
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Hands back the command if the session task is gone.
    pub(crate) fn send(&self, command: SessionCommand) -> std::result::Result<(), SessionCommand> {
        self.commands.send(command).map_err(|e| e.0)
    }
}

impl std::fmt::Debug for SessionCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionCommand::CreateLocalDescription { .. } => "CreateLocalDescription",
            SessionCommand::SetRemoteDescription { .. } => "SetRemoteDescription",
            SessionCommand::AddIceCandidate { .. } => "AddIceCandidate",
            SessionCommand::SignalingStarted(_) => "SignalingStarted",
            SessionCommand::SignalingFailed(_) => "SignalingFailed",
            SessionCommand::ClientClosed(_) => "ClientClosed",
            SessionCommand::RequestKeyframe => "RequestKeyframe",
            SessionCommand::Close => "Close",
        };
        f.write_str(name)
    }
}
