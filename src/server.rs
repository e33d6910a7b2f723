//! HTTP control surface
//!
//! rouille serves the page and the JSON endpoints on its own threads. Every
//! request that touches a call or the transform is forwarded as a [`Command`]
//! to a single controller thread, which owns a current-thread tokio runtime
//! and with it the only [`CallSession`].

use std::{
    io::Read,
    sync::mpsc::{self as std_mpsc, SyncSender},
    thread,
};

use chrono::{DateTime, Utc};
use rouille::{router, Request, Response, Server};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    call::{
        endpoint::Role,
        session::{CallConfig, CallSession, EndpointSnapshot},
    },
    config::DemoConfig,
    model::codec::{prefer_codec, video_capabilities, CodecPreference},
    transform::{self, pipeline::PipelineStats},
};

const INDEX_HTML: &str = include_str!("../static/index.html");

/// Frame count used for HTTP-triggered transforms when the configuration
/// leaves it unbounded.
const HTTP_TRANSFORM_FRAMES: u64 = 90;

/// Work the controller thread performs on behalf of an HTTP request.
pub enum Command {
    Call {
        codec: Option<CodecPreference>,
        reply: SyncSender<Result<CallStatus, String>>,
    },
    HangUp {
        reply: SyncSender<Result<CallStatus, String>>,
    },
    Status {
        reply: SyncSender<CallStatus>,
    },
    Transform {
        reply: SyncSender<Result<PipelineStats, String>>,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CallStatus {
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    /// Live snapshots during a call, the final ones after hang-up.
    pub endpoints: Vec<EndpointSnapshot>,
    pub last_transform: Option<PipelineStats>,
}

/// One entry of the codec selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CodecOption {
    pub value: String,
    pub label: String,
}

#[derive(Debug, Default, Deserialize)]
struct CallRequest {
    #[serde(default)]
    codec: Option<String>,
}

/// Starts the controller thread and serves HTTP until the process exits.
pub fn serve(config: DemoConfig) -> anyhow::Result<()> {
    let http_addr = config.http_addr.clone();
    let commands = spawn_controller(config);

    let server = Server::new(http_addr.as_str(), move |request| {
        web_request(request, &commands)
    })
    .map_err(|e| anyhow::anyhow!("starting the web server on {}: {}", http_addr, e))?;

    info!("Control surface listening on http://{}", server.server_addr());
    server.run();

    Ok(())
}

/// Spawns the controller thread. Commands sent after it exits are answered
/// with 503 by the HTTP layer.
pub fn spawn_controller(config: DemoConfig) -> mpsc::UnboundedSender<Command> {
    let (tx, rx) = mpsc::unbounded_channel();
    thread::spawn(move || run(config, rx));
    tx
}

fn run(config: DemoConfig, rx: mpsc::UnboundedReceiver<Command>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start the controller runtime: {}", e);
            return;
        }
    };

    runtime.block_on(Controller::new(config).serve(rx));
    debug!("Controller stopped");
}

struct Controller {
    config: DemoConfig,
    session: Option<CallSession>,
    last_call: Vec<EndpointSnapshot>,
    last_transform: Option<PipelineStats>,
}

impl Controller {
    fn new(config: DemoConfig) -> Self {
        Self {
            config,
            session: None,
            last_call: vec![],
            last_transform: None,
        }
    }

    async fn serve(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.recv().await {
            match command {
                Command::Call { codec, reply } => {
                    let result = self.call(codec).await;
                    let _ = reply.send(result);
                }
                Command::HangUp { reply } => {
                    let result = self.hang_up().await;
                    let _ = reply.send(result);
                }
                Command::Status { reply } => {
                    let _ = reply.send(self.status());
                }
                Command::Transform { reply } => {
                    let result = self.transform().await;
                    let _ = reply.send(result);
                }
            }
        }

        if let Some(session) = self.session.take() {
            session.hang_up().await;
        }
    }

    async fn call(&mut self, codec: Option<CodecPreference>) -> Result<CallStatus, String> {
        if self.session.is_some() {
            return Err("a call is already active".to_string());
        }

        let session = CallSession::call(CallConfig {
            bind_ip: self.config.endpoint_ip(),
            codec_preference: codec,
        })
        .await
        .map_err(|e| e.to_string())?;

        self.last_call.clear();
        self.session = Some(session);
        Ok(self.status())
    }

    async fn hang_up(&mut self) -> Result<CallStatus, String> {
        let session = self.session.take().ok_or("no call is active")?;

        let (pc1, pc2) = session.hang_up().await;
        self.last_call = vec![pc1, pc2];
        Ok(self.status())
    }

    async fn transform(&mut self) -> Result<PipelineStats, String> {
        let mut capture = self.config.capture;
        capture.frames = capture.frames.or(Some(HTTP_TRANSFORM_FRAMES));

        let stats = transform::run(capture).await.map_err(|e| e.to_string())?;
        self.last_transform = Some(stats);
        Ok(stats)
    }

    fn status(&self) -> CallStatus {
        match &self.session {
            Some(session) => CallStatus {
                active: true,
                started_at: Some(session.started_at()),
                endpoints: vec![
                    session.snapshot(Role::Initiator),
                    session.snapshot(Role::Responder),
                ],
                last_transform: self.last_transform,
            },
            None => CallStatus {
                active: false,
                started_at: None,
                endpoints: self.last_call.clone(),
                last_transform: self.last_transform,
            },
        }
    }
}

/// The codec selector's options, in capability order.
pub fn codec_options() -> Vec<CodecOption> {
    video_capabilities()
        .into_iter()
        .map(|capability| CodecOption {
            value: capability.selector_value(),
            label: match &capability.sdp_fmtp_line {
                Some(fmtp) => format!("{} ({})", capability.name(), fmtp),
                None => capability.name().to_string(),
            },
        })
        .collect()
}

pub fn web_request(request: &Request, commands: &mpsc::UnboundedSender<Command>) -> Response {
    debug!("{} {}", request.method(), request.raw_url());

    router!(request,
        (GET) (/) => {
            Response::html(INDEX_HTML)
        },
        (GET) (/codecs) => {
            Response::json(&codec_options())
        },
        (GET) (/status) => {
            match ask(commands, |reply| Command::Status { reply }) {
                Some(status) => Response::json(&status),
                None => unavailable(),
            }
        },
        (POST) (/call) => {
            let codec = match read_codec(request) {
                Ok(codec) => codec,
                Err(e) => return Response::text(e).with_status_code(400),
            };
            match ask(commands, |reply| Command::Call { codec, reply }) {
                Some(Ok(status)) => Response::json(&status),
                Some(Err(e)) => Response::text(e).with_status_code(409),
                None => unavailable(),
            }
        },
        (POST) (/hangup) => {
            match ask(commands, |reply| Command::HangUp { reply }) {
                Some(Ok(status)) => Response::json(&status),
                Some(Err(e)) => Response::text(e).with_status_code(409),
                None => unavailable(),
            }
        },
        (POST) (/transform) => {
            match ask(commands, |reply| Command::Transform { reply }) {
                Some(Ok(stats)) => Response::json(&stats),
                Some(Err(e)) => Response::text(e).with_status_code(500),
                None => unavailable(),
            }
        },
        _ => Response::empty_404()
    )
}

/// Sends a command and blocks this HTTP thread until the controller answers.
fn ask<T>(
    commands: &mpsc::UnboundedSender<Command>,
    command: impl FnOnce(SyncSender<T>) -> Command,
) -> Option<T> {
    let (reply, answer) = std_mpsc::sync_channel(1);
    if commands.send(command(reply)).is_err() {
        warn!("Controller is gone");
        return None;
    }
    answer.recv().ok()
}

fn read_codec(request: &Request) -> Result<Option<CodecPreference>, String> {
    let mut body = String::new();
    if let Some(mut data) = request.data() {
        data.read_to_string(&mut body)
            .map_err(|e| format!("reading request body: {e}"))?;
    }

    let call: CallRequest = if body.trim().is_empty() {
        CallRequest::default()
    } else {
        serde_json::from_str(&body).map_err(|e| format!("invalid call request: {e}"))?
    };

    let Some(value) = call.codec else {
        return Ok(None);
    };
    let preference = CodecPreference::parse_selector(&value).map_err(|e| e.to_string())?;
    if let Some(preference) = &preference {
        prefer_codec(&video_capabilities(), preference).map_err(|e| e.to_string())?;
    }

    Ok(preference)
}

fn unavailable() -> Response {
    Response::text("controller unavailable").with_status_code(503)
}
