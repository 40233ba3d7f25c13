//! Raw TCP tunnel listeners
//!
//! A registered tunnel may ask the relay to listen on a public TCP port.
//! Every accepted connection becomes a virtual connection relayed over the
//! tunnel's control channel.

use crate::listener::bind_reuse;
use crate::relay::run_raw_relay;
use crate::RelayState;
use burrow_control::{TcpListenerHandle, Tunnel, VconnKind};
use burrow_proto::{Frame, ListenStatus, RequestId};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Handle a `tcp-listen` request from a registered tunnel.
pub async fn handle_tcp_listen(state: Arc<RelayState>, tunnel: Arc<Tunnel>, port: u16) {
    if tunnel.owns_tcp_port(port) {
        debug!(tunnel = %tunnel.name, port, "Tunnel already owns requested port");
        let _ = tunnel
            .control
            .send(Frame::TcpListening {
                port,
                status: ListenStatus::Already,
            })
            .await;
        return;
    }

    if port < 1024 && port != 80 && port != 443 {
        warn!(tunnel = %tunnel.name, port, "Rejected privileged port request");
        let _ = tunnel
            .control
            .send(Frame::TcpError {
                port,
                message: "Privileged port not allowed".to_string(),
            })
            .await;
        return;
    }

    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    let listener = match bind_reuse(addr) {
        Ok(listener) => listener,
        Err(e) => {
            warn!(tunnel = %tunnel.name, port, error = %e, "TCP tunnel bind failed");
            let _ = tunnel
                .control
                .send(Frame::TcpError {
                    port,
                    message: format!("Failed to bind port {}: {}", port, e),
                })
                .await;
            return;
        }
    };

    info!(tunnel = %tunnel.name, port, "TCP tunnel listener opened");

    let task = tokio::spawn(accept_loop(state, tunnel.clone(), listener, port));
    tunnel.add_tcp_listener(port, TcpListenerHandle::new(task));

    let _ = tunnel
        .control
        .send(Frame::TcpListening {
            port,
            status: ListenStatus::Ok,
        })
        .await;
}

async fn accept_loop(state: Arc<RelayState>, tunnel: Arc<Tunnel>, listener: TcpListener, port: u16) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(tunnel = %tunnel.name, port, %peer, "Accepted TCP tunnel connection");
                tokio::spawn(handle_tcp_connection(
                    state.clone(),
                    tunnel.clone(),
                    stream,
                    peer,
                    port,
                ));
            }
            Err(e) => {
                error!(tunnel = %tunnel.name, port, error = %e, "TCP accept error");
            }
        }
    }
}

async fn handle_tcp_connection(
    state: Arc<RelayState>,
    tunnel: Arc<Tunnel>,
    stream: TcpStream,
    peer: SocketAddr,
    port: u16,
) {
    let id = RequestId::generate();
    let rx = state.vconns.insert(id.clone(), VconnKind::Tcp, &tunnel.name);

    let connect = Frame::TcpConnect {
        request_id: id.clone(),
        port,
        remote_address: peer.to_string(),
    };
    if tunnel.control.send(connect).await.is_err() {
        debug!(tunnel = %tunnel.name, request_id = %id, "Control channel gone, dropping TCP connection");
        state.vconns.remove(&id);
        return;
    }

    run_raw_relay(tunnel, state.vconns.clone(), id, stream, rx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerConfig;
    use burrow_control::{ControlHandle, ControlMessage};
    use burrow_proto::TunnelType;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn test_state() -> Arc<RelayState> {
        Arc::new(RelayState::new(ServerConfig {
            domain: "tunnel.example.com".to_string(),
            http_port: 80,
            ws_port: 8081,
            api_port: 8082,
            auth_token: None,
        }))
    }

    fn make_tunnel(tx: mpsc::Sender<ControlMessage>) -> Arc<Tunnel> {
        Arc::new(Tunnel::new(
            "foo".to_string(),
            TunnelType::Tcp,
            "ssh".to_string(),
            "127.0.0.1".to_string(),
            2222,
            ControlHandle::new(tx),
            BTreeMap::new(),
        ))
    }

    async fn expect_frame(rx: &mut mpsc::Receiver<ControlMessage>) -> Frame {
        match rx.recv().await {
            Some(ControlMessage::Frame(frame)) => frame,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_privileged_port_rejected() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(8);
        let tunnel = make_tunnel(tx);

        handle_tcp_listen(state, tunnel, 22).await;

        match expect_frame(&mut rx).await {
            Frame::TcpError { port, message } => {
                assert_eq!(port, 22);
                assert_eq!(message, "Privileged port not allowed");
            }
            other => panic!("expected tcp-error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_listen_accept_and_connect_frame() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(32);
        let tunnel = make_tunnel(tx);

        // Bind an ephemeral port by asking the OS for one first
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        handle_tcp_listen(state.clone(), tunnel.clone(), port).await;

        match expect_frame(&mut rx).await {
            Frame::TcpListening { status, .. } => assert_eq!(status, ListenStatus::Ok),
            other => panic!("expected tcp-listening, got {:?}", other),
        }
        assert!(tunnel.owns_tcp_port(port));

        // A public connection produces a tcp-connect frame with a fresh id
        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        match expect_frame(&mut rx).await {
            Frame::TcpConnect {
                request_id,
                port: reported,
                remote_address,
            } => {
                assert_eq!(request_id.as_str().len(), 32);
                assert_eq!(reported, port);
                assert!(remote_address.starts_with("127.0.0.1:"));
            }
            other => panic!("expected tcp-connect, got {:?}", other),
        }
        assert_eq!(state.vconns.count(), 1);

        tunnel.close_tcp_listeners();
    }

    #[tokio::test]
    async fn test_duplicate_port_reports_already() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(32);
        let tunnel = make_tunnel(tx);

        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        handle_tcp_listen(state.clone(), tunnel.clone(), port).await;
        let _ = expect_frame(&mut rx).await;

        handle_tcp_listen(state, tunnel.clone(), port).await;
        match expect_frame(&mut rx).await {
            Frame::TcpListening { status, .. } => assert_eq!(status, ListenStatus::Already),
            other => panic!("expected tcp-listening already, got {:?}", other),
        }

        tunnel.close_tcp_listeners();
    }

    #[tokio::test]
    async fn test_bind_conflict_reports_tcp_error() {
        let state = test_state();
        let (tx, mut rx) = mpsc::channel(8);
        let tunnel = make_tunnel(tx);

        // Hold the port so the tunnel's bind fails
        let holder = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let port = holder.local_addr().unwrap().port();

        handle_tcp_listen(state, tunnel.clone(), port).await;

        match expect_frame(&mut rx).await {
            Frame::TcpError { port: reported, .. } => assert_eq!(reported, port),
            other => panic!("expected tcp-error, got {:?}", other),
        }
        // Failed bind leaves nothing recorded
        assert!(!tunnel.owns_tcp_port(port));
    }
}
