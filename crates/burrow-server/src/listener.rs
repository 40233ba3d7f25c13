//! Public listeners and connection dispatch
//!
//! One accept loop per public port (the default HTTP port plus every
//! dynamic port). Each accepted connection has its request head parsed
//! once, then is dispatched: agent control upgrade, public protocol
//! upgrade, or plain HTTP.

use crate::request::{read_head, RequestHead};
use crate::{http, session, upgrade, ws, RelayState};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Deadline for a client to deliver its complete request head.
const HEAD_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Listener errors
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Bind a listener with `SO_REUSEADDR` so ports in TIME_WAIT rebind
/// immediately after a restart.
pub fn bind_reuse(addr: SocketAddr) -> std::io::Result<TcpListener> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;
    socket.set_nonblocking(true)?;

    TcpListener::from_std(socket.into())
}

/// Accept loop for a public HTTP+Upgrade port.
pub async fn run_public_listener(state: Arc<RelayState>, port: u16) -> Result<(), ListenerError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = bind_reuse(addr).map_err(|source| ListenerError::Bind { addr, source })?;
    info!(port, "Public listener bound");

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    handle_public_connection(state, stream, peer, port).await;
                });
            }
            Err(e) => {
                error!(port, error = %e, "Failed to accept public connection");
            }
        }
    }
}

/// Accept loop for the dedicated agent control port. Legacy agents connect
/// here directly; any path is accepted as long as the request is a
/// WebSocket upgrade.
pub async fn run_control_listener(state: Arc<RelayState>, port: u16) -> Result<(), ListenerError> {
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = bind_reuse(addr).map_err(|source| ListenerError::Bind { addr, source })?;
    info!(port, "Agent control listener bound");

    loop {
        match listener.accept().await {
            Ok((mut stream, peer)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    let mut buf = BytesMut::with_capacity(4096);
                    let head = match read_request_head(&mut stream, &mut buf).await {
                        Some(head) => head,
                        None => return,
                    };
                    match ws::accept_websocket(stream, &head).await {
                        Ok(ws_stream) => session::run(state, ws_stream, peer).await,
                        Err(e) => debug!(%peer, error = %e, "Agent handshake failed"),
                    }
                });
            }
            Err(e) => {
                error!(port, error = %e, "Failed to accept control connection");
            }
        }
    }
}

async fn read_request_head(stream: &mut TcpStream, buf: &mut BytesMut) -> Option<RequestHead> {
    let head_len = match tokio::time::timeout(HEAD_READ_TIMEOUT, read_head(stream, buf)).await {
        Ok(Ok(len)) => len,
        Ok(Err(e)) => {
            debug!(error = %e, "Failed to read request head");
            return None;
        }
        Err(_) => {
            debug!("Timed out reading request head");
            return None;
        }
    };

    let head_bytes = buf.split_to(head_len);
    match RequestHead::parse(&head_bytes) {
        Ok(head) => Some(head),
        Err(e) => {
            debug!(error = %e, "Malformed request head");
            None
        }
    }
}

async fn handle_public_connection(
    state: Arc<RelayState>,
    mut stream: TcpStream,
    peer: SocketAddr,
    port: u16,
) {
    let mut buf = BytesMut::with_capacity(4096);
    let head = match read_request_head(&mut stream, &mut buf).await {
        Some(head) => head,
        None => return,
    };

    debug!(%peer, port, method = %head.method, target = %head.target, "Public request");

    if is_agent_endpoint(&state, &head, port) {
        match ws::accept_websocket(stream, &head).await {
            Ok(ws_stream) => session::run(state, ws_stream, peer).await,
            Err(e) => debug!(%peer, error = %e, "Agent handshake failed"),
        }
        return;
    }

    if head.wants_upgrade() {
        upgrade::handle_upgrade(state, stream, head, peer, port).await;
    } else {
        http::handle_http(state, stream, head, buf, peer, port).await;
    }
}

/// The agent control endpoint on the shared public port: a WebSocket
/// upgrade for `/ws*` addressed to the base domain itself.
fn is_agent_endpoint(state: &RelayState, head: &RequestHead, port: u16) -> bool {
    if port != state.config.http_port || !head.wants_upgrade() {
        return false;
    }
    if !head.target.starts_with("/ws") {
        return false;
    }
    let host = match head.host() {
        Some(host) => host.split(':').next().unwrap_or(host),
        None => return false,
    };
    host.eq_ignore_ascii_case(&state.config.domain)
}

/// Write a complete HTML response and close.
pub(crate) async fn write_html_response<S>(
    stream: &mut S,
    status: u16,
    reason: &str,
    html: &str,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        html.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(html.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Log-and-continue wrapper used when a listener's failure must not take
/// the process down (dynamic ports).
pub async fn run_public_listener_logged(state: Arc<RelayState>, port: u16) {
    if let Err(e) = run_public_listener(state, port).await {
        warn!(port, error = %e, "Public listener stopped");
    }
}
