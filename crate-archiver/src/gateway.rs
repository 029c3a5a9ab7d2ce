use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hagfish_types::gateway::{op, CloseBehavior};
use hagfish_types::{close_behavior, GatewayPayload, Hello, Identify, Ready, Resume};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::{encode, FrameDecoder, Transport};
use crate::error::{Error, Result};
use crate::rate::RateLimiter;

const DEFAULT_GATEWAY: &str = "wss://gateway.discord.gg";
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// lifecycle and dispatch stream one connection emits to the orchestrator
#[derive(Debug)]
pub enum GatewayEvent {
    Connecting,
    ConnectionLost {
        was_connected: bool,
        code: u16,
        reason: String,
    },
    Dispatch {
        kind: String,
        data: Value,
        /// false while the server replays missed events after a resume
        live: bool,
    },
    /// a resume failed; a fresh session is being established
    SessionLost,
    /// unrecoverable; the owning account must be dropped
    Fatal(Error),
}

/// handle to one account's gateway session
pub struct Gateway {
    destroy: CancellationToken,
    commands: mpsc::UnboundedSender<GatewayPayload>,
    ready: Arc<AtomicBool>,
}

impl Gateway {
    pub fn connect(
        name: String,
        token: String,
        transport: Transport,
        events: mpsc::Sender<GatewayEvent>,
    ) -> Gateway {
        let destroy = CancellationToken::new();
        let ready = Arc::new(AtomicBool::new(false));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let driver = Driver {
            name,
            token,
            transport,
            events,
            commands: commands_rx,
            destroy: destroy.clone(),
            ready: ready.clone(),
            send_limiter: RateLimiter::gateway_send(),
            resume: None,
        };
        tokio::spawn(driver.run());
        Gateway {
            destroy,
            commands: commands_tx,
            ready,
        }
    }

    /// queue an outbound payload; sending while not ready is a programming
    /// error
    pub fn send(&self, payload: GatewayPayload) -> Result<()> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(Error::BadStatic("gateway send while not ready"));
        }
        self.commands
            .send(payload)
            .map_err(|_| Error::BadStatic("gateway driver is gone"))
    }

    /// idempotent; closes the transport with 1000 and stops the driver
    pub fn destroy(&self) {
        self.destroy.cancel();
    }
}

struct ResumeState {
    session_id: String,
    seq: u64,
    url: String,
}

enum SessionEnd {
    Destroyed,
    Reconnect {
        was_connected: bool,
        code: u16,
        reason: String,
    },
    Fatal(Error),
}

struct Driver {
    name: String,
    token: String,
    transport: Transport,
    events: mpsc::Sender<GatewayEvent>,
    commands: mpsc::UnboundedReceiver<GatewayPayload>,
    destroy: CancellationToken,
    ready: Arc<AtomicBool>,
    send_limiter: RateLimiter,
    resume: Option<ResumeState>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            if self.destroy.is_cancelled() {
                break;
            }
            let _ = self.events.send(GatewayEvent::Connecting).await;

            let base = self
                .resume
                .as_ref()
                .map(|r| r.url.clone())
                .unwrap_or_else(|| DEFAULT_GATEWAY.to_owned());
            let url = format!("{}/?{}", base, self.transport.url_params());

            let connect = tokio_tungstenite::connect_async(url.as_str());
            let ws = tokio::select! {
                _ = self.destroy.cancelled() => break,
                ws = connect => ws,
            };
            let ws = match ws {
                Ok((ws, _)) => ws,
                Err(err) => {
                    warn!("[{}] gateway failed to connect, retrying: {err}", self.name);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            };

            let end = self.session(ws).await;
            self.ready.store(false, Ordering::SeqCst);
            match end {
                SessionEnd::Destroyed => break,
                SessionEnd::Reconnect {
                    was_connected,
                    code,
                    reason,
                } => {
                    debug!("[{}] connection lost ({code} {reason}), reconnecting", self.name);
                    let _ = self
                        .events
                        .send(GatewayEvent::ConnectionLost {
                            was_connected,
                            code,
                            reason,
                        })
                        .await;
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
                SessionEnd::Fatal(err) => {
                    let _ = self.events.send(GatewayEvent::Fatal(err)).await;
                    break;
                }
            }
        }
    }

    /// drive one transport session from hello to close
    async fn session(&mut self, mut ws: Ws) -> SessionEnd {
        let mut decoder = FrameDecoder::new(self.transport);

        // the first payload must be HELLO
        let hello = match self.next_payload(&mut ws, &mut decoder).await {
            Ok(Some(payload)) if payload.op == op::HELLO => {
                match payload.d.map(serde_json::from_value::<Hello>) {
                    Some(Ok(hello)) => hello,
                    _ => return SessionEnd::Fatal(Error::Protocol("malformed HELLO".into())),
                }
            }
            Ok(Some(_)) => {
                return SessionEnd::Fatal(Error::Protocol("expected HELLO first".into()))
            }
            Ok(None) => {
                return SessionEnd::Reconnect {
                    was_connected: false,
                    code: 1006,
                    reason: "closed before HELLO".into(),
                }
            }
            Err(end) => return end,
        };

        let interval = Duration::from_millis(hello.heartbeat_interval);
        let mut resuming = self.resume.is_some();
        if let Err(end) = self.identify_or_resume(&mut ws).await {
            return end;
        }

        // fresh sessions are live immediately; resumed sessions replay
        // missed dispatches first
        let mut live = !resuming;
        let mut acked = true;
        let mut saw_dispatch = false;

        let first_beat = interval.mul_f64(rand::random::<f64>());
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + first_beat, interval);

        loop {
            tokio::select! {
                _ = self.destroy.cancelled() => {
                    let _ = close_with(&mut ws, 1000).await;
                    return SessionEnd::Destroyed;
                }
                _ = heartbeat.tick() => {
                    if !acked {
                        // zombie connection: restart with saved resume state
                        let _ = close_with(&mut ws, 1000).await;
                        return SessionEnd::Reconnect {
                            was_connected: saw_dispatch,
                            code: 1006,
                            reason: "heartbeat ack missed".into(),
                        };
                    }
                    acked = false;
                    if let Err(end) = self.send_heartbeat(&mut ws).await {
                        return end;
                    }
                }
                Some(payload) = self.commands.recv() => {
                    if let Err(end) = self.send_payload(&mut ws, &payload).await {
                        return end;
                    }
                }
                frame = ws.next() => {
                    let payload = match self.decode_frame(&mut ws, &mut decoder, frame).await {
                        Ok(Some(payload)) => payload,
                        Ok(None) => continue,
                        Err(end) => return end,
                    };
                    match payload.op {
                        op::DISPATCH => {
                            if let Some(seq) = payload.s {
                                if let Some(resume) = &mut self.resume {
                                    resume.seq = seq;
                                }
                            }
                            let kind = payload.t.unwrap_or_default();
                            let data = payload.d.unwrap_or(Value::Null);

                            if !saw_dispatch && !resuming && kind != "READY" {
                                let _ = close_with(&mut ws, 4000).await;
                                return SessionEnd::Fatal(Error::Protocol(format!(
                                    "first dispatch was {kind}, expected READY"
                                )));
                            }
                            saw_dispatch = true;

                            match kind.as_str() {
                                "READY" => {
                                    if let Ok(ready) = serde_json::from_value::<Ready>(data.clone()) {
                                        info!("[{}] session ready (v{})", self.name, ready.v);
                                        self.resume = Some(ResumeState {
                                            session_id: ready.session_id,
                                            seq: payload.s.unwrap_or(0),
                                            url: ready
                                                .resume_gateway_url
                                                .unwrap_or_else(|| DEFAULT_GATEWAY.to_owned()),
                                        });
                                    }
                                    self.ready.store(true, Ordering::SeqCst);
                                    live = true;
                                }
                                "RESUMED" => {
                                    info!("[{}] session resumed", self.name);
                                    self.ready.store(true, Ordering::SeqCst);
                                    live = true;
                                }
                                _ => {}
                            }
                            let _ = self
                                .events
                                .send(GatewayEvent::Dispatch { kind, data, live })
                                .await;
                        }
                        op::HEARTBEAT => {
                            if let Err(end) = self.send_heartbeat(&mut ws).await {
                                return end;
                            }
                        }
                        op::HEARTBEAT_ACK => acked = true,
                        op::RECONNECT => {
                            let _ = close_with(&mut ws, 1000).await;
                            return SessionEnd::Reconnect {
                                was_connected: saw_dispatch,
                                code: 1000,
                                reason: "server requested reconnect".into(),
                            };
                        }
                        op::INVALID_SESSION => {
                            let resumable = payload
                                .d
                                .as_ref()
                                .and_then(Value::as_bool)
                                .unwrap_or(false);
                            if resumable {
                                if let Err(end) = self.identify_or_resume(&mut ws).await {
                                    return end;
                                }
                            } else {
                                // resume state is dead; start a fresh session
                                self.resume = None;
                                self.ready.store(false, Ordering::SeqCst);
                                let _ = self.events.send(GatewayEvent::SessionLost).await;
                                resuming = false;
                                saw_dispatch = false;
                                live = false;
                                if let Err(end) = self.identify_or_resume(&mut ws).await {
                                    return end;
                                }
                            }
                        }
                        other => debug!("[{}] unhandled gateway op {other}", self.name),
                    }
                }
            }
        }
    }

    async fn identify_or_resume(&mut self, ws: &mut Ws) -> std::result::Result<(), SessionEnd> {
        let payload = match &self.resume {
            Some(resume) => GatewayPayload::new(
                op::RESUME,
                serde_json::json!(Resume {
                    token: self.token.clone(),
                    session_id: resume.session_id.clone(),
                    seq: resume.seq,
                }),
            ),
            None => GatewayPayload::new(
                op::IDENTIFY,
                serde_json::json!(Identify {
                    token: self.token.clone(),
                    properties: Default::default(),
                    intents: hagfish_types::gateway::intents::ARCHIVER,
                }),
            ),
        };
        self.send_payload(ws, &payload).await
    }

    async fn send_heartbeat(&mut self, ws: &mut Ws) -> std::result::Result<(), SessionEnd> {
        let seq = self.resume.as_ref().map(|r| r.seq);
        let payload = GatewayPayload::new(op::HEARTBEAT, serde_json::json!(seq));
        self.send_payload(ws, &payload).await
    }

    async fn send_payload(
        &mut self,
        ws: &mut Ws,
        payload: &GatewayPayload,
    ) -> std::result::Result<(), SessionEnd> {
        self.send_limiter.acquire().await;
        let text = match encode(payload) {
            Ok(text) => text,
            Err(err) => return Err(SessionEnd::Fatal(err)),
        };
        ws.send(WsMessage::text(text)).await.map_err(|err| {
            SessionEnd::Reconnect {
                was_connected: self.ready.load(Ordering::SeqCst),
                code: 1006,
                reason: format!("send failed: {err}"),
            }
        })
    }

    /// await the next inbound payload, used only for the HELLO handshake
    async fn next_payload(
        &mut self,
        ws: &mut Ws,
        decoder: &mut FrameDecoder,
    ) -> std::result::Result<Option<GatewayPayload>, SessionEnd> {
        loop {
            let frame = tokio::select! {
                _ = self.destroy.cancelled() => {
                    let _ = close_with(ws, 1000).await;
                    return Err(SessionEnd::Destroyed);
                }
                frame = ws.next() => frame,
            };
            match self.decode_frame(ws, decoder, frame).await {
                Ok(Some(payload)) => return Ok(Some(payload)),
                Ok(None) => continue,
                Err(SessionEnd::Reconnect { code, reason, .. }) => {
                    return Err(SessionEnd::Reconnect {
                        was_connected: false,
                        code,
                        reason,
                    })
                }
                Err(end) => return Err(end),
            }
        }
    }

    /// turn one transport frame into zero-or-one payload, applying the
    /// close-code policy
    async fn decode_frame(
        &mut self,
        ws: &mut Ws,
        decoder: &mut FrameDecoder,
        frame: Option<std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
    ) -> std::result::Result<Option<GatewayPayload>, SessionEnd> {
        let was_connected = self.ready.load(Ordering::SeqCst);
        let message = match frame {
            None => {
                return Err(SessionEnd::Reconnect {
                    was_connected,
                    code: 1006,
                    reason: "connection reset".into(),
                })
            }
            Some(Err(err)) => {
                return Err(SessionEnd::Reconnect {
                    was_connected,
                    code: 1006,
                    reason: format!("transport error: {err}"),
                })
            }
            Some(Ok(message)) => message,
        };

        let decoded = match message {
            WsMessage::Text(text) => decoder.decode_text(&text).map(Some),
            WsMessage::Binary(bytes) => decoder.decode_binary(&bytes),
            WsMessage::Close(frame) => {
                let (code, reason) = match frame {
                    Some(CloseFrame { code, reason }) => (code.into(), reason.to_string()),
                    None => (1005u16, String::new()),
                };
                return Err(match close_behavior(code) {
                    CloseBehavior::Reconnect => SessionEnd::Reconnect {
                        was_connected,
                        code,
                        reason,
                    },
                    CloseBehavior::AuthFailed => SessionEnd::Fatal(Error::AuthFailed),
                    CloseBehavior::Fatal => {
                        SessionEnd::Fatal(Error::GatewayClosed { code, reason })
                    }
                });
            }
            // tungstenite answers pings itself
            _ => return Ok(None),
        };

        match decoded {
            Ok(payload) => Ok(payload),
            Err(err) => {
                // a broken frame poisons the stream; close cleanly and resume
                warn!("[{}] gateway decode error: {err}", self.name);
                let _ = close_with(ws, 1000).await;
                Err(SessionEnd::Reconnect {
                    was_connected,
                    code: 1000,
                    reason: "decode error".into(),
                })
            }
        }
    }
}

async fn close_with(ws: &mut Ws, code: u16) -> Result<()> {
    ws.close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    }))
    .await?;
    Ok(())
}
