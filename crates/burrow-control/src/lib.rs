//! Shared control-plane state for the Burrow relay
//!
//! Holds the two structures every data path touches: the tunnel registry
//! (name → live tunnel) and the virtual-connection table (request id →
//! public-side endpoint). Both are safe for concurrent access and never
//! suspend while mutating.

pub mod registry;
pub mod tunnel;
pub mod vconn;

pub use registry::{RegistryError, TunnelRegistry};
pub use tunnel::{ControlError, ControlHandle, ControlMessage, StatsSnapshot, TcpListenerHandle, Tunnel, TunnelStats};
pub use vconn::{VconnEvent, VconnKind, VconnTable};
