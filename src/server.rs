//! HTTP signaling front.
//!
//! A remote device POSTs its offer to `/offer`. The bridge opens a session,
//! logs where the consumer should connect and, once the consumer is there
//! and the answer is ready, responds with the answer and the session
//! descriptor.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, ensure, Context};
use async_trait::async_trait;
use rouille::{router, Request, Response, Server};
use serde::Serialize;
use tokio::runtime::Runtime;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::model::description::{SdpType, SessionDescription, SignalingSetup};
use crate::model::descriptor::SessionDescriptor;
use crate::session::Bridge;
use crate::signaling::{EndSession, SessionHandle, SignalingChannel};

type AnswerSender = oneshot::Sender<Result<SessionDescription>>;

pub fn main(config: BridgeConfig) -> anyhow::Result<()> {
    let runtime = Arc::new(
        tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("building the tokio runtime")?,
    );
    let bridge = Bridge::new(config.clone());

    let server = Server::new(&config.http_bind, move |request| {
        web_request(request, &runtime, &bridge)
    })
    .map_err(|e| anyhow!("starting the web server on {}: {}", config.http_bind, e))?;

    info!("Signaling front listening on http://{}", server.server_addr());
    info!("Transport mode {:?}", config.mode);

    server.run();
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OfferResponse {
    answer: SessionDescription,
    descriptor: SessionDescriptor,
    started_at: String,
}

fn web_request(request: &Request, runtime: &Runtime, bridge: &Bridge) -> Response {
    router!(request,
        (GET) (/health) => {
            Response::text("ok")
        },
        (POST) (/offer) => {
            match handle_offer(request, runtime, bridge) {
                Ok(body) => Response::json(&body),
                Err(e) => {
                    warn!("Offer failed: {:#}", e);
                    Response::text(format!("{e:#}")).with_status_code(400)
                }
            }
        },
        _ => Response::empty_404()
    )
}

fn handle_offer(request: &Request, runtime: &Runtime, bridge: &Bridge) -> anyhow::Result<OfferResponse> {
    let data = request.data().context("request body already consumed")?;
    let offer: SessionDescription = serde_json::from_reader(data).context("parsing the offer")?;
    ensure!(
        offer.sdp_type == SdpType::Offer,
        "expected an offer, got an {}",
        offer.sdp_type
    );

    let id = format!("{:08x}", rand::random::<u32>());
    let (tx, rx) = oneshot::channel();
    let channel = Arc::new(OfferChannel {
        offer,
        answer: Mutex::new(Some(tx)),
    });

    runtime.block_on(async {
        let session = bridge.create_session(channel, &id, "webrtc").await?;
        info!("Session({}): consumer url {}", id, session.descriptor.url);
        info!(
            "Session({}): ffmpeg {}",
            id,
            session.descriptor.input_arguments.join(" ")
        );

        let answer = rx.await.map_err(|_| BridgeError::SessionClosed)??;
        Ok::<_, anyhow::Error>(OfferResponse {
            answer,
            descriptor: session.descriptor,
            started_at: session.started_at.to_rfc3339(),
        })
    })
}

/// Answers a single offer that arrived over HTTP.
struct OfferChannel {
    offer: SessionDescription,
    answer: Mutex<Option<AnswerSender>>,
}

impl OfferChannel {
    fn take_sender(&self) -> Option<AnswerSender> {
        self.answer.lock().ok().and_then(|mut sender| sender.take())
    }
}

async fn answer_offer(session: &SessionHandle, offer: SessionDescription) -> Result<SessionDescription> {
    session
        .set_remote_description(offer, SignalingSetup::default())
        .await?;
    session
        .create_local_description(SdpType::Answer, SignalingSetup::default(), None)
        .await
}

#[async_trait]
impl SignalingChannel for OfferChannel {
    async fn start_session(&self, session: SessionHandle) -> Result<Box<dyn EndSession>> {
        let result = answer_offer(&session, self.offer.clone()).await;
        let failure = result.as_ref().err().map(|e| e.to_string());

        if let Some(sender) = self.take_sender() {
            let _ = sender.send(result);
        }

        match failure {
            Some(e) => Err(BridgeError::Signaling(e)),
            None => Ok(Box::new(LoggedEnd {
                id: session.id().to_string(),
            })),
        }
    }
}

struct LoggedEnd {
    id: String,
}

#[async_trait]
impl EndSession for LoggedEnd {
    async fn end(self: Box<Self>) -> Result<()> {
        info!("Session({}): ended", self.id);
        Ok(())
    }
}
