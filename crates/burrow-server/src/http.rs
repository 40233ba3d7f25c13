//! Public HTTP routing and response relay
//!
//! A public request is buffered fully, forwarded to the owning agent as an
//! `http-request` frame, and the agent's raw response bytes are parsed and
//! streamed back onto the public socket.

use crate::listener::write_html_response;
use crate::pages;
use crate::request::{read_body, RequestHead};
use crate::response::{encode_head, ResponseEvent, ResponseParser};
use crate::RelayState;
use burrow_control::{Tunnel, VconnEvent, VconnKind};
use burrow_proto::{Frame, RequestId};
use bytes::BytesMut;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Deadline for the first upstream response byte.
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for the public client to deliver its request body.
const BODY_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Handle one plain HTTP request on a public port.
pub async fn handle_http(
    state: Arc<RelayState>,
    mut stream: TcpStream,
    head: RequestHead,
    mut buf: BytesMut,
    peer: SocketAddr,
    port: u16,
) {
    let label = match head.host_label() {
        Some(label) => label.to_string(),
        None => {
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            return;
        }
    };

    let arrival_port = if port != state.config.http_port {
        Some(port)
    } else {
        None
    };
    let tunnel = match state.tunnels.resolve(&label, arrival_port, false) {
        Some(tunnel) => tunnel,
        None => {
            debug!(%peer, label, "No tunnel for public request");
            let html = pages::tunnel_offline(&label);
            let _ = write_html_response(&mut stream, 200, "OK", &html).await;
            return;
        }
    };

    let body = match tokio::time::timeout(
        BODY_READ_TIMEOUT,
        read_body(&mut stream, &mut buf, &head),
    )
    .await
    {
        Ok(Ok(body)) => body,
        Ok(Err(e)) => {
            debug!(%peer, error = %e, "Failed to read request body");
            let _ = stream
                .write_all(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            return;
        }
        Err(_) => {
            debug!(%peer, "Timed out reading request body");
            let _ = stream
                .write_all(b"HTTP/1.1 408 Request Timeout\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .await;
            return;
        }
    };

    tunnel.stats.record_request();
    tunnel
        .stats
        .add_bytes_in((head.head_len + body.len()) as u64);

    let id = RequestId::generate();
    let rx = state.vconns.insert(id.clone(), VconnKind::Http, &tunnel.name);

    debug!(
        tunnel = %tunnel.name,
        request_id = %id,
        method = %head.method,
        target = %head.target,
        "Forwarding public request"
    );

    let frame = Frame::HttpRequest {
        request_id: id.clone(),
        method: head.method.clone(),
        url: head.target.clone(),
        headers: head.headers.clone(),
        body,
    };
    if tunnel.control.send(frame).await.is_err() {
        warn!(tunnel = %tunnel.name, request_id = %id, "Control channel gone before dispatch");
        state.vconns.remove(&id);
        let html = pages::bad_gateway(&tunnel.name);
        let _ = write_html_response(&mut stream, 502, "Bad Gateway", &html).await;
        return;
    }

    relay_response(state, tunnel, id, stream, rx).await;
}

/// Stream the agent's response events back to the public socket.
async fn relay_response(
    state: Arc<RelayState>,
    tunnel: Arc<Tunnel>,
    id: RequestId,
    mut stream: TcpStream,
    mut rx: mpsc::Receiver<VconnEvent>,
) {
    let mut parser = ResponseParser::new();
    let mut headers_sent = false;
    let mut first = true;

    loop {
        let event = if first {
            match tokio::time::timeout(FIRST_BYTE_TIMEOUT, rx.recv()).await {
                Ok(event) => event,
                Err(_) => {
                    warn!(tunnel = %tunnel.name, request_id = %id, "Upstream response timed out");
                    state.vconns.remove(&id);
                    let html = pages::gateway_timeout(&tunnel.name);
                    let _ = write_html_response(&mut stream, 504, "Gateway Timeout", &html).await;
                    return;
                }
            }
        } else {
            rx.recv().await
        };
        first = false;

        match event {
            Some(VconnEvent::Data(bytes)) => {
                let events = match parser.push(&bytes) {
                    Ok(events) => events,
                    Err(e) => {
                        warn!(tunnel = %tunnel.name, request_id = %id, error = %e, "Malformed upstream response");
                        state.vconns.remove(&id);
                        if !headers_sent {
                            let html = pages::bad_gateway(&tunnel.name);
                            let _ =
                                write_html_response(&mut stream, 502, "Bad Gateway", &html).await;
                        }
                        return;
                    }
                };

                for event in events {
                    let result = match event {
                        ResponseEvent::Head(upstream) => {
                            headers_sent = true;
                            stream.write_all(&encode_head(&upstream)).await
                        }
                        ResponseEvent::Body(body) => stream.write_all(&body).await,
                    };
                    if result.is_err() {
                        debug!(tunnel = %tunnel.name, request_id = %id, "Public client went away");
                        state.vconns.remove(&id);
                        return;
                    }
                }
                let _ = stream.flush().await;
            }
            Some(VconnEvent::End) => {
                state.vconns.remove(&id);
                if !headers_sent {
                    // Upstream produced nothing before closing
                    let html = pages::bad_gateway(&tunnel.name);
                    let _ = write_html_response(&mut stream, 502, "Bad Gateway", &html).await;
                    return;
                }
                let _ = stream.flush().await;
                let _ = stream.shutdown().await;
                return;
            }
            Some(VconnEvent::Error(message)) => {
                warn!(tunnel = %tunnel.name, request_id = %id, message, "Upstream reported an error");
                state.vconns.remove(&id);
                if !headers_sent {
                    let html = pages::bad_gateway(&tunnel.name);
                    let _ = write_html_response(&mut stream, 502, "Bad Gateway", &html).await;
                }
                // After headers: truncated close
                return;
            }
            None => {
                // Entry removed by tunnel teardown
                if !headers_sent {
                    let html = pages::bad_gateway(&tunnel.name);
                    let _ = write_html_response(&mut stream, 502, "Bad Gateway", &html).await;
                }
                return;
            }
        }
    }
}
