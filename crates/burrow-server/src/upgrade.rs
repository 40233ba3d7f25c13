//! Public protocol-upgrade routing
//!
//! Covers WebSocket and any generic `Upgrade` pattern: the public socket
//! is hijacked and enters a raw byte relay once the `http-upgrade` frame
//! has been dispatched. The upstream's own 101 response travels back as
//! ordinary `data` frames and is written to the socket untouched.

use crate::listener::write_html_response;
use crate::pages;
use crate::relay::run_raw_relay;
use crate::request::RequestHead;
use crate::RelayState;
use burrow_proto::{Frame, RequestId};
use burrow_control::VconnKind;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Handle an HTTP upgrade request on a public port.
pub async fn handle_upgrade(
    state: Arc<RelayState>,
    mut stream: TcpStream,
    mut head: RequestHead,
    peer: SocketAddr,
    port: u16,
) {
    let label = head.host_label().map(str::to_string);

    // On a dynamic port the port-only fallback is allowed: the port exists
    // precisely because some tunnel advertised it.
    let is_dynamic = port != state.config.http_port;
    let arrival_port = if is_dynamic { Some(port) } else { None };

    let tunnel = label
        .as_deref()
        .and_then(|label| state.tunnels.resolve(label, arrival_port, is_dynamic));
    let tunnel = match tunnel {
        Some(tunnel) => tunnel,
        None => {
            debug!(%peer, port, "No tunnel for upgrade request");
            let html = pages::tunnel_offline(label.as_deref().unwrap_or("this address"));
            let _ = write_html_response(&mut stream, 200, "OK", &html).await;
            return;
        }
    };

    // The upstream service should believe it is being spoken to directly.
    head.set_host(format!("{}:{}", tunnel.target_host, tunnel.target_port));

    tunnel.stats.record_request();
    tunnel.stats.add_bytes_in(head.head_len as u64);

    let id = RequestId::generate();
    let rx = state
        .vconns
        .insert(id.clone(), VconnKind::Upgrade, &tunnel.name);

    debug!(
        tunnel = %tunnel.name,
        request_id = %id,
        target = %head.target,
        "Forwarding upgrade request"
    );

    let frame = Frame::HttpUpgrade {
        request_id: id.clone(),
        method: head.method.clone(),
        url: head.target.clone(),
        headers: head.headers.clone(),
    };
    if tunnel.control.send(frame).await.is_err() {
        warn!(tunnel = %tunnel.name, request_id = %id, "Control channel gone before upgrade dispatch");
        state.vconns.remove(&id);
        let html = pages::bad_gateway(&tunnel.name);
        let _ = write_html_response(&mut stream, 502, "Bad Gateway", &html).await;
        return;
    }

    run_raw_relay(tunnel, state.vconns.clone(), id, stream, rx).await;
}
