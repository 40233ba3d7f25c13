//! Agent session state machine
//!
//! One session per connected agent: authentication, a single registration,
//! keepalive, and demultiplexing of inbound frames onto the virtual
//! connection table. The session owns the WebSocket; all outbound frames
//! funnel through a dedicated writer task fed by a bounded channel.

use crate::{tcp, RelayState};
use burrow_control::{ControlHandle, ControlMessage, RegistryError, Tunnel, VconnEvent};
use burrow_proto::{Frame, FrameCodec, RequestId};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, warn};

/// Outbound frame buffer per session. A slow agent fills this and then
/// blocks senders, which trips the control-channel send deadline instead
/// of growing memory without bound.
const WRITER_BUFFER: usize = 256;

/// Keepalive ping cadence; a pong must arrive before the next tick.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive malformed frames tolerated before the channel is closed.
const MAX_PROTOCOL_VIOLATIONS: u32 = 8;

enum Flow {
    Continue,
    Close,
}

/// Drive one agent control channel to completion.
pub async fn run(state: Arc<RelayState>, ws: WebSocketStream<TcpStream>, peer: SocketAddr) {
    let conn_id = format!("agent-{}", uuid::Uuid::new_v4());
    info!(%peer, conn_id, "Agent control channel connected");

    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::channel(WRITER_BUFFER);
    let writer = tokio::spawn(writer_task(sink, rx, conn_id.clone()));

    let mut session = Session {
        control: ControlHandle::new(tx.clone()),
        tx: tx.clone(),
        authenticated: state.config.auth_token.is_none(),
        auth_acknowledged: false,
        tunnel: None,
        conn_id: conn_id.clone(),
        state,
    };

    session.read_loop(stream, &tx).await;
    session.teardown().await;

    // Ask the writer to close the socket cleanly; if its queue is jammed,
    // cut it off.
    if tx.try_send(ControlMessage::Close).is_err() {
        writer.abort();
    }

    info!(conn_id, "Agent control channel closed");
}

struct Session {
    state: Arc<RelayState>,
    control: ControlHandle,
    /// Direct handle to the writer queue, for sends that must claim their
    /// queue position before shared state changes.
    tx: mpsc::Sender<ControlMessage>,
    conn_id: String,
    authenticated: bool,
    auth_acknowledged: bool,
    tunnel: Option<Arc<Tunnel>>,
}

impl Session {
    async fn read_loop(
        &mut self,
        mut stream: SplitStream<WebSocketStream<TcpStream>>,
        tx: &mpsc::Sender<ControlMessage>,
    ) {
        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        keepalive.tick().await; // consume the immediate first tick
        let mut pong_seen = true;
        let mut violations: u32 = 0;

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    if !pong_seen {
                        warn!(conn_id = %self.conn_id, "Keepalive missed, terminating control channel");
                        return;
                    }
                    pong_seen = false;
                    if tx.send(ControlMessage::Ping).await.is_err() {
                        return;
                    }
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => match FrameCodec::decode(&text) {
                        Ok(frame) => {
                            violations = 0;
                            if let Flow::Close = self.handle_frame(frame).await {
                                return;
                            }
                        }
                        Err(e) => {
                            violations += 1;
                            warn!(conn_id = %self.conn_id, error = %e, violations, "Dropping malformed frame");
                            if violations >= MAX_PROTOCOL_VIOLATIONS {
                                error!(conn_id = %self.conn_id, "Persistent protocol violations, closing channel");
                                return;
                            }
                        }
                    },
                    Some(Ok(Message::Pong(_))) => pong_seen = true,
                    // tungstenite queues the matching pong on its own
                    Some(Ok(Message::Ping(_))) => {}
                    Some(Ok(Message::Close(_))) => {
                        debug!(conn_id = %self.conn_id, "Agent closed control channel");
                        return;
                    }
                    Some(Ok(_)) => {
                        violations += 1;
                        debug!(conn_id = %self.conn_id, "Ignoring non-text message on control channel");
                        if violations >= MAX_PROTOCOL_VIOLATIONS {
                            return;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(conn_id = %self.conn_id, error = %e, "Control channel read error");
                        return;
                    }
                    None => {
                        debug!(conn_id = %self.conn_id, "Control channel stream ended");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_frame(&mut self, frame: Frame) -> Flow {
        match frame {
            Frame::Auth { token } => self.handle_auth(token).await,
            _ if !self.authenticated => {
                warn!(conn_id = %self.conn_id, "Frame received before authentication");
                let _ = self
                    .control
                    .send(Frame::AuthFailed {
                        message: "Authentication required".to_string(),
                    })
                    .await;
                Flow::Close
            }
            Frame::Register {
                name,
                target,
                target_port,
                tunnel_type,
                protocol,
                device_info,
            } => {
                self.handle_register(name, target, target_port, tunnel_type, protocol, device_info)
                    .await
            }
            Frame::TcpListen { port } => match self.tunnel.clone() {
                Some(tunnel) => {
                    tcp::handle_tcp_listen(self.state.clone(), tunnel, port).await;
                    Flow::Continue
                }
                None => self.close_unregistered("tcp-listen").await,
            },
            Frame::Data { request_id, data } => match self.tunnel.as_ref() {
                Some(tunnel) => {
                    tunnel.stats.add_bytes_out(data.len() as u64);
                    self.state
                        .vconns
                        .deliver(&request_id, VconnEvent::Data(Bytes::from(data)))
                        .await;
                    Flow::Continue
                }
                None => self.close_unregistered("data").await,
            },
            Frame::End { request_id } => match self.tunnel.as_ref() {
                Some(_) => {
                    self.finish_vconn(&request_id, VconnEvent::End).await;
                    Flow::Continue
                }
                None => self.close_unregistered("end").await,
            },
            Frame::Error {
                request_id: Some(request_id),
                message,
            } => match self.tunnel.as_ref() {
                Some(_) => {
                    self.finish_vconn(&request_id, VconnEvent::Error(message)).await;
                    Flow::Continue
                }
                None => self.close_unregistered("error").await,
            },
            Frame::Error {
                request_id: None,
                message,
            } => {
                warn!(conn_id = %self.conn_id, message, "Agent reported session error");
                Flow::Continue
            }
            other => {
                // Server-to-agent frame types arriving from an agent
                warn!(conn_id = %self.conn_id, frame = frame_name(&other), "Dropping unexpected frame");
                Flow::Continue
            }
        }
    }

    async fn handle_auth(&mut self, token: String) -> Flow {
        match self.state.config.auth_token.clone() {
            Some(expected) => {
                if self.authenticated {
                    // Only the first auth frame is honored
                    debug!(conn_id = %self.conn_id, "Ignoring repeated auth frame");
                    return Flow::Continue;
                }
                if token == expected {
                    self.authenticated = true;
                    self.auth_acknowledged = true;
                    info!(conn_id = %self.conn_id, "Agent authenticated");
                    let _ = self.control.send(self.auth_success()).await;
                    Flow::Continue
                } else {
                    warn!(conn_id = %self.conn_id, "Agent presented an invalid token");
                    let _ = self
                        .control
                        .send(Frame::AuthFailed {
                            message: "Invalid authentication token".to_string(),
                        })
                        .await;
                    Flow::Close
                }
            }
            None => {
                if self.auth_acknowledged {
                    debug!(conn_id = %self.conn_id, "Ignoring repeated auth frame");
                } else {
                    self.auth_acknowledged = true;
                    let _ = self.control.send(self.auth_success()).await;
                }
                Flow::Continue
            }
        }
    }

    fn auth_success(&self) -> Frame {
        Frame::AuthSuccess {
            domain: self.state.config.domain.clone(),
            ws_port: self.state.config.ws_port,
        }
    }

    async fn handle_register(
        &mut self,
        name: String,
        target: String,
        target_port: u16,
        tunnel_type: burrow_proto::TunnelType,
        protocol: String,
        device_info: Option<std::collections::BTreeMap<String, String>>,
    ) -> Flow {
        if self.tunnel.is_some() {
            warn!(conn_id = %self.conn_id, "Second register frame on one session");
            let _ = self
                .control
                .send(Frame::Error {
                    request_id: None,
                    message: "Tunnel already registered on this session".to_string(),
                })
                .await;
            return Flow::Close;
        }

        let tunnel = Arc::new(Tunnel::new(
            name.clone(),
            tunnel_type,
            protocol.clone(),
            target,
            target_port,
            self.control.clone(),
            device_info.unwrap_or_default(),
        ));

        // Claim the writer slot before the tunnel becomes routable: the
        // confirmation must precede any frame a public listener could
        // dispatch once the registry entry exists.
        let permit = match self.tx.reserve().await {
            Ok(permit) => permit,
            Err(_) => return Flow::Close,
        };

        match self.state.tunnels.register(tunnel.clone()) {
            Ok(()) => {
                let access_url = format!("http://{}.{}", name, self.state.config.domain);
                info!(
                    conn_id = %self.conn_id,
                    tunnel = %name,
                    mode = %tunnel_type,
                    access_url,
                    "Tunnel registered"
                );
                permit.send(ControlMessage::Frame(Frame::Registered {
                    name: name.clone(),
                    tunnel_type,
                    protocol,
                    access_url: access_url.clone(),
                    message: format!("Tunnel '{}' is live at {}", name, access_url),
                }));
                self.state.dynamic_ports.acquire(&self.state, target_port);
                self.tunnel = Some(tunnel);
                Flow::Continue
            }
            Err(RegistryError::NameInUse(_)) => {
                let _ = self
                    .control
                    .send(Frame::Error {
                        request_id: None,
                        message: "Tunnel name already in use".to_string(),
                    })
                    .await;
                Flow::Close
            }
            Err(RegistryError::EmptyName) => {
                let _ = self
                    .control
                    .send(Frame::Error {
                        request_id: None,
                        message: "Tunnel name must not be empty".to_string(),
                    })
                    .await;
                Flow::Close
            }
        }
    }

    /// Deliver a terminal event, then drop the table entry.
    async fn finish_vconn(&self, request_id: &RequestId, event: VconnEvent) {
        self.state.vconns.deliver(request_id, event).await;
        self.state.vconns.remove(request_id);
    }

    async fn close_unregistered(&self, frame_type: &str) -> Flow {
        warn!(conn_id = %self.conn_id, frame_type, "Frame received before registration");
        let _ = self
            .control
            .send(Frame::Error {
                request_id: None,
                message: "Register a tunnel before sending traffic frames".to_string(),
            })
            .await;
        Flow::Close
    }

    /// Release everything the session owned, in an order that leaves no
    /// window for new traffic to reach a dying tunnel: listeners first,
    /// then the registry entry, then the in-flight virtual connections,
    /// then the dynamic-listener reference.
    async fn teardown(&mut self) {
        let Some(tunnel) = self.tunnel.take() else {
            return;
        };

        let listeners = tunnel.close_tcp_listeners();
        self.state.tunnels.unregister(&tunnel.name);
        let vconns = self.state.vconns.remove_tunnel(&tunnel.name);
        self.state.dynamic_ports.release(tunnel.target_port);

        info!(
            conn_id = %self.conn_id,
            tunnel = %tunnel.name,
            listeners,
            vconns,
            "Tunnel torn down"
        );
    }
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Auth { .. } => "auth",
        Frame::Register { .. } => "register",
        Frame::TcpListen { .. } => "tcp-listen",
        Frame::AuthSuccess { .. } => "auth-success",
        Frame::AuthFailed { .. } => "auth-failed",
        Frame::Registered { .. } => "registered",
        Frame::TcpListening { .. } => "tcp-listening",
        Frame::TcpError { .. } => "tcp-error",
        Frame::TcpConnect { .. } => "tcp-connect",
        Frame::HttpRequest { .. } => "http-request",
        Frame::HttpUpgrade { .. } => "http-upgrade",
        Frame::Command { .. } => "command",
        Frame::Data { .. } => "data",
        Frame::End { .. } => "end",
        Frame::Error { .. } => "error",
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut rx: mpsc::Receiver<ControlMessage>,
    conn_id: String,
) {
    while let Some(message) = rx.recv().await {
        let outgoing = match message {
            ControlMessage::Frame(frame) => match FrameCodec::encode(&frame) {
                Ok(text) => Message::Text(text),
                Err(e) => {
                    error!(conn_id, error = %e, "Failed to encode outbound frame");
                    continue;
                }
            },
            ControlMessage::Ping => Message::Ping(Vec::new()),
            ControlMessage::Close => break,
        };

        if let Err(e) = sink.send(outgoing).await {
            debug!(conn_id, error = %e, "Control channel write failed");
            break;
        }
    }

    let _ = sink.close().await;
    debug!(conn_id, "Writer task ended");
}
