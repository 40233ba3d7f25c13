//! Virtual-connection table
//!
//! Tracks every in-flight public connection multiplexed over a control
//! channel and routes agent frames back to the public-side task that owns
//! the socket.

use burrow_proto::RequestId;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// What kind of public endpoint a virtual connection feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VconnKind {
    Http,
    Upgrade,
    Tcp,
}

impl VconnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            VconnKind::Http => "http",
            VconnKind::Upgrade => "upgrade",
            VconnKind::Tcp => "tcp",
        }
    }
}

/// Event delivered to a public-side task.
#[derive(Debug, Clone, PartialEq)]
pub enum VconnEvent {
    Data(Bytes),
    End,
    Error(String),
}

/// Per-vconn event buffer. Bounds how far an agent can run ahead of a slow
/// public client before the session's demux loop starts waiting.
const EVENT_BUFFER: usize = 64;

struct Vconn {
    kind: VconnKind,
    tunnel: String,
    tx: mpsc::Sender<VconnEvent>,
}

/// Table of in-flight virtual connections keyed by request id.
#[derive(Clone)]
pub struct VconnTable {
    entries: Arc<DashMap<RequestId, Vconn>>,
}

impl VconnTable {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Register a new virtual connection. The returned receiver yields the
    /// agent's `data`/`end`/`error` events; it is closed when the entry is
    /// removed.
    pub fn insert(
        &self,
        id: RequestId,
        kind: VconnKind,
        tunnel: &str,
    ) -> mpsc::Receiver<VconnEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        trace!(request_id = %id, kind = kind.as_str(), tunnel, "Registered virtual connection");
        self.entries.insert(
            id,
            Vconn {
                kind,
                tunnel: tunnel.to_string(),
                tx,
            },
        );
        rx
    }

    /// Deliver an event to the public side of a virtual connection.
    ///
    /// The sender is copied out of the map before the (suspending) send so
    /// no shard lock is held across it. Returns false when the id is
    /// unknown or the public side is gone; a dead public side also removes
    /// the entry.
    pub async fn deliver(&self, id: &RequestId, event: VconnEvent) -> bool {
        let tx = match self.entries.get(id) {
            Some(entry) => entry.tx.clone(),
            None => {
                debug!(request_id = %id, "Dropping frame for unknown virtual connection");
                return false;
            }
        };

        if tx.send(event).await.is_err() {
            debug!(request_id = %id, "Public side gone, removing virtual connection");
            self.entries.remove(id);
            return false;
        }
        true
    }

    /// Remove a virtual connection. Idempotent. Dropping the entry closes
    /// the event channel, which terminates the public-side task and closes
    /// its socket.
    pub fn remove(&self, id: &RequestId) -> bool {
        self.entries.remove(id).is_some()
    }

    /// Remove every virtual connection belonging to a tunnel. Used at
    /// tunnel teardown to terminate all of its in-flight connections.
    pub fn remove_tunnel(&self, tunnel: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, vconn| vconn.tunnel != tunnel);
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(tunnel, removed, "Removed virtual connections for closed tunnel");
        }
        removed
    }

    pub fn kind(&self, id: &RequestId) -> Option<VconnKind> {
        self.entries.get(id).map(|e| e.kind)
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}

impl Default for VconnTable {
    fn default() -> Self {
        Self::new()
    }
}
