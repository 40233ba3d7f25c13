//! Bidirectional raw-byte relay
//!
//! Shared by upgraded HTTP connections and raw TCP tunnels: bytes from the
//! public socket become `data` frames toward the agent, and the agent's
//! `data` events are written back untouched. A terminal event on either
//! side closes the other.

use burrow_control::{Tunnel, VconnEvent, VconnTable};
use burrow_proto::{Frame, RequestId};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

const READ_BUFFER: usize = 8192;

/// Relay until either side terminates, then remove the virtual connection
/// and close the public socket.
pub async fn run_raw_relay(
    tunnel: Arc<Tunnel>,
    vconns: VconnTable,
    id: RequestId,
    stream: TcpStream,
    mut rx: mpsc::Receiver<VconnEvent>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let mut buf = vec![0u8; READ_BUFFER];

    loop {
        tokio::select! {
            result = read_half.read(&mut buf) => match result {
                Ok(0) => {
                    debug!(request_id = %id, "Public side closed");
                    let _ = tunnel
                        .control
                        .send(Frame::End { request_id: id.clone() })
                        .await;
                    break;
                }
                Ok(n) => {
                    tunnel.stats.add_bytes_in(n as u64);
                    let frame = Frame::Data {
                        request_id: id.clone(),
                        data: buf[..n].to_vec(),
                    };
                    if tunnel.control.send(frame).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(request_id = %id, error = %e, "Public side read error");
                    let _ = tunnel
                        .control
                        .send(Frame::Error {
                            request_id: Some(id.clone()),
                            message: e.to_string(),
                        })
                        .await;
                    break;
                }
            },
            event = rx.recv() => match event {
                Some(VconnEvent::Data(bytes)) => {
                    if write_half.write_all(&bytes).await.is_err()
                        || write_half.flush().await.is_err()
                    {
                        let _ = tunnel
                            .control
                            .send(Frame::End { request_id: id.clone() })
                            .await;
                        break;
                    }
                }
                Some(VconnEvent::End) => {
                    debug!(request_id = %id, "Agent side ended relay");
                    break;
                }
                Some(VconnEvent::Error(message)) => {
                    debug!(request_id = %id, message, "Agent side reported relay error");
                    break;
                }
                // Entry removed out from under us (tunnel teardown)
                None => break,
            },
        }
    }

    vconns.remove(&id);
    let _ = write_half.shutdown().await;
}
