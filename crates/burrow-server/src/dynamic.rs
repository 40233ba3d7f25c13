//! Dynamic public listeners
//!
//! Frontend dev stacks reference their origin port (`ws://host:5173/...`
//! for HMR), so the relay mirrors each tunnel's target port with an
//! HTTP+Upgrade listener when that port is a plain user port. Listeners
//! are reference-counted across tunnels sharing a target port.

use crate::listener::run_public_listener_logged;
use crate::{RelayState, ServerConfig};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};

struct DynamicListener {
    refcount: usize,
    task: JoinHandle<()>,
}

/// Reference-counted set of dynamic public listeners.
pub struct DynamicPortManager {
    listeners: Mutex<HashMap<u16, DynamicListener>>,
}

impl DynamicPortManager {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(HashMap::new()),
        }
    }

    /// Ports that are never dynamically managed: the relay's own service
    /// ports plus the standard web ports a fronting proxy owns.
    pub fn is_reserved(config: &ServerConfig, port: u16) -> bool {
        port == config.http_port
            || port == config.ws_port
            || port == config.api_port
            || port == 80
            || port == 443
    }

    /// Acquire a reference on a port's listener, opening it on the first
    /// acquisition. A failed bind (port held by another process) is logged
    /// inside the listener task and swallowed; the refcount is tracked
    /// either way so release stays balanced.
    pub fn acquire(&self, state: &Arc<RelayState>, port: u16) {
        if Self::is_reserved(&state.config, port) {
            debug!(port, "Skipping dynamic listener for reserved port");
            return;
        }

        let mut listeners = self.listeners.lock().unwrap();
        if let Some(listener) = listeners.get_mut(&port) {
            listener.refcount += 1;
            debug!(port, refcount = listener.refcount, "Dynamic listener reference added");
            return;
        }

        info!(port, "Opening dynamic listener");
        let task = tokio::spawn(run_public_listener_logged(state.clone(), port));
        listeners.insert(port, DynamicListener { refcount: 1, task });
    }

    /// Release a reference; the last release closes the listener.
    pub fn release(&self, port: u16) {
        let mut listeners = self.listeners.lock().unwrap();
        let Some(listener) = listeners.get_mut(&port) else {
            return;
        };

        listener.refcount -= 1;
        if listener.refcount == 0 {
            info!(port, "Closing dynamic listener");
            if let Some(listener) = listeners.remove(&port) {
                listener.task.abort();
            }
        } else {
            debug!(port, refcount = listener.refcount, "Dynamic listener reference released");
        }
    }

    /// Current refcount for a port (0 when unmanaged).
    pub fn refcount(&self, port: u16) -> usize {
        self.listeners
            .lock()
            .unwrap()
            .get(&port)
            .map(|l| l.refcount)
            .unwrap_or(0)
    }

    pub fn count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }
}

impl Default for DynamicPortManager {
    fn default() -> Self {
        Self::new()
    }
}
