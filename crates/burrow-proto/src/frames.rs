//! Protocol frame types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// HTTP headers as they appear on the wire (a JSON object).
pub type Headers = BTreeMap<String, String>;

/// Identifier pairing a public-side connection with the agent-side stream.
///
/// Generated as a cryptographically random 128-bit value so an agent cannot
/// guess ids belonging to other connections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(format!("{:032x}", rand::random::<u128>()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Tunnel mode declared at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelType {
    Web,
    Tcp,
}

impl TunnelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelType::Web => "web",
            TunnelType::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TunnelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome reported for a `tcp-listen` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenStatus {
    Ok,
    Already,
}

/// Action carried by a `command` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Stop,
    Restart,
}

/// One control-channel frame.
///
/// A single enum covers both directions; the session layer enforces which
/// side may send what. The `type` tag and camelCase field names match the
/// wire contract agents already speak.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Frame {
    // Agent -> server
    Auth {
        token: String,
    },
    Register {
        name: String,
        target: String,
        target_port: u16,
        tunnel_type: TunnelType,
        protocol: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        device_info: Option<BTreeMap<String, String>>,
    },
    TcpListen {
        port: u16,
    },

    // Server -> agent
    AuthSuccess {
        domain: String,
        ws_port: u16,
    },
    AuthFailed {
        message: String,
    },
    Registered {
        name: String,
        tunnel_type: TunnelType,
        protocol: String,
        access_url: String,
        message: String,
    },
    TcpListening {
        port: u16,
        status: ListenStatus,
    },
    TcpError {
        port: u16,
        message: String,
    },
    TcpConnect {
        request_id: RequestId,
        port: u16,
        remote_address: String,
    },
    HttpRequest {
        request_id: RequestId,
        method: String,
        url: String,
        headers: Headers,
        #[serde(with = "base64_payload")]
        body: Vec<u8>,
    },
    HttpUpgrade {
        request_id: RequestId,
        method: String,
        url: String,
        headers: Headers,
    },
    Command {
        action: CommandAction,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    // Both directions
    Data {
        request_id: RequestId,
        #[serde(with = "base64_payload")]
        data: Vec<u8>,
    },
    End {
        request_id: RequestId,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<RequestId>,
        message: String,
    },
}

// Serde helper keeping binary payloads as base64 strings on the wire.
mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}
