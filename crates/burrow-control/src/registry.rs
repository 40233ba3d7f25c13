//! Tunnel registry
//!
//! Maps tunnel names to live tunnels and enforces name uniqueness. Also
//! answers the routing question for public traffic: which tunnel serves a
//! given host label and arrival port.

use crate::tunnel::Tunnel;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Tunnel name '{0}' is already in use")]
    NameInUse(String),

    #[error("Tunnel name must not be empty")]
    EmptyName,
}

struct Entry {
    /// Registration order, used for deterministic port-only resolution.
    seq: u64,
    tunnel: Arc<Tunnel>,
}

/// Registry of live tunnels keyed by name.
///
/// Lookups copy the `Arc` out under the read lock and act afterwards, so a
/// concurrent unregister can never leave a caller holding a lock across
/// I/O. Mutations never suspend.
pub struct TunnelRegistry {
    entries: RwLock<HashMap<String, Entry>>,
    next_seq: AtomicU64,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a tunnel. Fails if the name is empty or already taken.
    pub fn register(&self, tunnel: Arc<Tunnel>) -> Result<(), RegistryError> {
        if tunnel.name.is_empty() {
            return Err(RegistryError::EmptyName);
        }

        let mut entries = self.entries.write().unwrap();
        if entries.contains_key(&tunnel.name) {
            warn!(name = %tunnel.name, "Rejected duplicate tunnel registration");
            return Err(RegistryError::NameInUse(tunnel.name.clone()));
        }

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        info!(
            name = %tunnel.name,
            mode = %tunnel.mode,
            target_port = tunnel.target_port,
            "Registered tunnel"
        );
        entries.insert(tunnel.name.clone(), Entry { seq, tunnel });
        Ok(())
    }

    /// Remove a tunnel entry. Idempotent; returns the tunnel if it was
    /// present. The caller is responsible for having closed the tunnel's
    /// listeners beforehand.
    pub fn unregister(&self, name: &str) -> Option<Arc<Tunnel>> {
        let removed = self.entries.write().unwrap().remove(name);
        match &removed {
            Some(_) => info!(name = %name, "Unregistered tunnel"),
            None => debug!(name = %name, "Unregister for unknown tunnel"),
        }
        removed.map(|e| e.tunnel)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Tunnel>> {
        self.entries
            .read()
            .unwrap()
            .get(name)
            .map(|e| e.tunnel.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().unwrap().contains_key(name)
    }

    /// All live tunnels in registration order.
    pub fn list(&self) -> Vec<Arc<Tunnel>> {
        let entries = self.entries.read().unwrap();
        let mut all: Vec<(u64, Arc<Tunnel>)> =
            entries.values().map(|e| (e.seq, e.tunnel.clone())).collect();
        all.sort_by_key(|(seq, _)| *seq);
        all.into_iter().map(|(_, t)| t).collect()
    }

    pub fn count(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    /// Resolve the tunnel serving a public connection.
    ///
    /// `label` is the first DNS label of the Host header; `arrival_port` is
    /// set when the connection came in on a dynamic (non-default) listener.
    /// Precedence: exact (name, port) match, then name-only, then — only
    /// when `allow_port_fallback` is set — the first-registered tunnel
    /// whose target port matches the arrival port.
    pub fn resolve(
        &self,
        label: &str,
        arrival_port: Option<u16>,
        allow_port_fallback: bool,
    ) -> Option<Arc<Tunnel>> {
        let entries = self.entries.read().unwrap();

        if let Some(port) = arrival_port {
            if let Some(entry) = entries.get(label) {
                if entry.tunnel.target_port == port {
                    return Some(entry.tunnel.clone());
                }
            }
        }

        if let Some(entry) = entries.get(label) {
            return Some(entry.tunnel.clone());
        }

        if allow_port_fallback {
            if let Some(port) = arrival_port {
                return entries
                    .values()
                    .filter(|e| e.tunnel.target_port == port)
                    .min_by_key(|e| e.seq)
                    .map(|e| e.tunnel.clone());
            }
        }

        None
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::ControlHandle;
    use burrow_proto::TunnelType;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;

    fn make_tunnel(name: &str, target_port: u16) -> Arc<Tunnel> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(Tunnel::new(
            name.to_string(),
            TunnelType::Web,
            "http".to_string(),
            "127.0.0.1".to_string(),
            target_port,
            ControlHandle::new(tx),
            BTreeMap::new(),
        ))
    }

    #[test]
    fn test_register_and_get() {
        let registry = TunnelRegistry::new();
        registry.register(make_tunnel("foo", 3000)).unwrap();

        let tunnel = registry.get("foo").unwrap();
        assert_eq!(tunnel.name, "foo");
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = TunnelRegistry::new();
        registry.register(make_tunnel("foo", 3000)).unwrap();

        let result = registry.register(make_tunnel("foo", 4000));
        assert!(matches!(result, Err(RegistryError::NameInUse(_))));

        // Existing tunnel remains intact
        assert_eq!(registry.get("foo").unwrap().target_port, 3000);
    }

    #[test]
    fn test_empty_name_rejected() {
        let registry = TunnelRegistry::new();
        let result = registry.register(make_tunnel("", 3000));
        assert!(matches!(result, Err(RegistryError::EmptyName)));
    }

    #[test]
    fn test_unregister_idempotent() {
        let registry = TunnelRegistry::new();
        registry.register(make_tunnel("foo", 3000)).unwrap();

        assert!(registry.unregister("foo").is_some());
        assert!(registry.unregister("foo").is_none());
        assert_eq!(registry.count(), 0);
    }

    #[test]
    fn test_name_uniqueness_after_unregister() {
        let registry = TunnelRegistry::new();
        registry.register(make_tunnel("foo", 3000)).unwrap();
        registry.unregister("foo");

        // Name is free again
        registry.register(make_tunnel("foo", 4000)).unwrap();
        assert_eq!(registry.get("foo").unwrap().target_port, 4000);
    }

    #[test]
    fn test_list_in_registration_order() {
        let registry = TunnelRegistry::new();
        registry.register(make_tunnel("charlie", 1)).unwrap();
        registry.register(make_tunnel("alpha", 2)).unwrap();
        registry.register(make_tunnel("bravo", 3)).unwrap();

        let names: Vec<String> = registry.list().iter().map(|t| t.name.clone()).collect();
        assert_eq!(names, vec!["charlie", "alpha", "bravo"]);
    }

    #[test]
    fn test_resolve_name_only() {
        let registry = TunnelRegistry::new();
        registry.register(make_tunnel("foo", 3000)).unwrap();

        let tunnel = registry.resolve("foo", None, false).unwrap();
        assert_eq!(tunnel.name, "foo");
        assert!(registry.resolve("bar", None, false).is_none());
    }

    #[test]
    fn test_resolve_exact_beats_name_only() {
        let registry = TunnelRegistry::new();
        registry.register(make_tunnel("foo", 3000)).unwrap();
        registry.register(make_tunnel("foo2", 5173)).unwrap();

        // Arrival on port 5173 with label "foo": no (foo, 5173) tunnel, so
        // name-only still picks foo.
        let tunnel = registry.resolve("foo", Some(5173), false).unwrap();
        assert_eq!(tunnel.name, "foo");
    }

    #[test]
    fn test_resolve_port_fallback_requires_flag() {
        let registry = TunnelRegistry::new();
        registry.register(make_tunnel("foo", 5173)).unwrap();

        assert!(registry.resolve("unknown", Some(5173), false).is_none());
        let tunnel = registry.resolve("unknown", Some(5173), true).unwrap();
        assert_eq!(tunnel.name, "foo");
    }

    #[test]
    fn test_resolve_port_fallback_first_registered() {
        let registry = TunnelRegistry::new();
        registry.register(make_tunnel("second", 5173)).unwrap();
        registry.register(make_tunnel("third", 5173)).unwrap();

        // First registered wins, deterministically
        let tunnel = registry.resolve("unknown", Some(5173), true).unwrap();
        assert_eq!(tunnel.name, "second");

        registry.unregister("second");
        let tunnel = registry.resolve("unknown", Some(5173), true).unwrap();
        assert_eq!(tunnel.name, "third");
    }
}
