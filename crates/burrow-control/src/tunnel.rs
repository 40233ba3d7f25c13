//! Tunnel model and control-channel handle

use burrow_proto::{Frame, TunnelType};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// How long an outbound frame may wait on the writer channel before the
/// control channel is considered stalled. Exceeding this terminates the
/// session rather than buffering without bound.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Message consumed by a session's writer task.
#[derive(Debug)]
pub enum ControlMessage {
    /// Encode and send a frame to the agent.
    Frame(Frame),
    /// Send a transport-level keepalive ping.
    Ping,
    /// Send a close frame and stop the writer.
    Close,
}

/// Control-channel send errors
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Control channel closed")]
    Closed,

    #[error("Control channel stalled (backpressure limit exceeded)")]
    Stalled,
}

/// Cloneable handle to a tunnel's control channel.
///
/// All frames destined for an agent funnel through the session's writer
/// task via this handle; the channel is bounded so a slow agent exerts
/// backpressure instead of exhausting memory.
#[derive(Debug, Clone)]
pub struct ControlHandle {
    tx: mpsc::Sender<ControlMessage>,
}

impl ControlHandle {
    pub fn new(tx: mpsc::Sender<ControlMessage>) -> Self {
        Self { tx }
    }

    /// Queue a frame for the agent.
    pub async fn send(&self, frame: Frame) -> Result<(), ControlError> {
        match tokio::time::timeout(SEND_TIMEOUT, self.tx.send(ControlMessage::Frame(frame))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ControlError::Closed),
            Err(_) => Err(ControlError::Stalled),
        }
    }

    /// Ask the writer task to close the channel. Best-effort; a channel
    /// that is already gone counts as closed.
    pub async fn close(&self) {
        let _ = self.tx.send(ControlMessage::Close).await;
    }
}

/// Traffic counters for one tunnel. Monotonically increasing.
#[derive(Debug, Default)]
pub struct TunnelStats {
    requests: AtomicU64,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl TunnelStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_in(&self, n: u64) {
        self.bytes_in.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes_out(&self, n: u64) {
        self.bytes_out.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a tunnel's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub requests: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

/// Handle to a TCP accept loop owned by a tunnel.
///
/// Aborting the task drops the listener, which closes the socket and stops
/// new connections from binding to a dying tunnel.
#[derive(Debug)]
pub struct TcpListenerHandle {
    task: JoinHandle<()>,
}

impl TcpListenerHandle {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    pub fn close(&self) {
        self.task.abort();
    }
}

/// One registered tunnel.
///
/// A tunnel's lifetime is bounded by its control channel: it is created
/// when an agent's `register` frame is accepted and torn down when the
/// channel closes for any reason.
#[derive(Debug)]
pub struct Tunnel {
    pub name: String,
    pub mode: TunnelType,
    pub protocol: String,
    pub target_host: String,
    pub target_port: u16,
    pub control: ControlHandle,
    pub connected_at: chrono::DateTime<chrono::Utc>,
    pub client_info: BTreeMap<String, String>,
    pub stats: TunnelStats,
    tcp_listeners: Mutex<HashMap<u16, TcpListenerHandle>>,
}

impl Tunnel {
    pub fn new(
        name: String,
        mode: TunnelType,
        protocol: String,
        target_host: String,
        target_port: u16,
        control: ControlHandle,
        client_info: BTreeMap<String, String>,
    ) -> Self {
        Self {
            name,
            mode,
            protocol,
            target_host,
            target_port,
            control,
            connected_at: chrono::Utc::now(),
            client_info,
            stats: TunnelStats::default(),
            tcp_listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Record ownership of a TCP listener. Returns false (and leaves the
    /// existing listener untouched) if the port is already owned.
    pub fn add_tcp_listener(&self, port: u16, handle: TcpListenerHandle) -> bool {
        let mut listeners = self.tcp_listeners.lock().unwrap();
        if listeners.contains_key(&port) {
            return false;
        }
        listeners.insert(port, handle);
        true
    }

    pub fn owns_tcp_port(&self, port: u16) -> bool {
        self.tcp_listeners.lock().unwrap().contains_key(&port)
    }

    /// Ports this tunnel currently listens on.
    pub fn tcp_ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.tcp_listeners.lock().unwrap().keys().copied().collect();
        ports.sort_unstable();
        ports
    }

    /// Close every TCP listener this tunnel owns. Returns how many were
    /// closed. Called before the registry entry is removed so no new
    /// connection can reach a dying tunnel.
    pub fn close_tcp_listeners(&self) -> usize {
        let mut listeners = self.tcp_listeners.lock().unwrap();
        let count = listeners.len();
        for (port, handle) in listeners.drain() {
            debug!(tunnel = %self.name, port, "Closing owned TCP listener");
            handle.close();
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_tunnel(name: &str, target_port: u16) -> Tunnel {
        let (tx, _rx) = mpsc::channel(8);
        Tunnel::new(
            name.to_string(),
            TunnelType::Web,
            "http".to_string(),
            "127.0.0.1".to_string(),
            target_port,
            ControlHandle::new(tx),
            BTreeMap::new(),
        )
    }

    #[test]
    fn test_stats_monotonic() {
        let stats = TunnelStats::default();
        stats.record_request();
        stats.add_bytes_in(100);
        stats.add_bytes_out(50);
        stats.record_request();
        stats.add_bytes_in(20);

        let snap = stats.snapshot();
        assert_eq!(snap.requests, 2);
        assert_eq!(snap.bytes_in, 120);
        assert_eq!(snap.bytes_out, 50);
    }

    #[test]
    fn test_stats_snapshot_serializes_camel_case() {
        let stats = TunnelStats::default();
        stats.add_bytes_in(7);

        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["bytesIn"], 7);
        assert_eq!(json["bytesOut"], 0);
        assert_eq!(json["requests"], 0);
    }

    #[tokio::test]
    async fn test_tcp_listener_ownership() {
        let tunnel = test_tunnel("foo", 3000);
        assert!(!tunnel.owns_tcp_port(5432));

        let task = tokio::spawn(async { std::future::pending::<()>().await });
        assert!(tunnel.add_tcp_listener(5432, TcpListenerHandle::new(task)));
        assert!(tunnel.owns_tcp_port(5432));

        // Second listener on the same port is refused
        let task2 = tokio::spawn(async { std::future::pending::<()>().await });
        assert!(!tunnel.add_tcp_listener(5432, TcpListenerHandle::new(task2)));

        assert_eq!(tunnel.tcp_ports(), vec![5432]);
        assert_eq!(tunnel.close_tcp_listeners(), 1);
        assert!(!tunnel.owns_tcp_port(5432));
    }

    #[tokio::test]
    async fn test_control_handle_send_and_close() {
        let (tx, mut rx) = mpsc::channel(8);
        let handle = ControlHandle::new(tx);

        handle
            .send(Frame::End {
                request_id: burrow_proto::RequestId::from("aa"),
            })
            .await
            .unwrap();
        handle.close().await;

        assert!(matches!(rx.recv().await, Some(ControlMessage::Frame(_))));
        assert!(matches!(rx.recv().await, Some(ControlMessage::Close)));
    }

    #[tokio::test]
    async fn test_control_handle_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = ControlHandle::new(tx);

        let result = handle
            .send(Frame::End {
                request_id: burrow_proto::RequestId::from("aa"),
            })
            .await;
        assert!(matches!(result, Err(ControlError::Closed)));
    }
}
