//! Burrow control-channel protocol
//!
//! Defines the frames exchanged between the relay and its agents, and the
//! codec that puts them on the wire. Frames travel as single JSON records
//! over a message-oriented transport; binary payloads are base64-encoded so
//! the channel stays text-safe and debuggable from any agent language.

pub mod codec;
pub mod frames;

pub use codec::{CodecError, FrameCodec};
pub use frames::{CommandAction, Frame, Headers, ListenStatus, RequestId, TunnelType};
