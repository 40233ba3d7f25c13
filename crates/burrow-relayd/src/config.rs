//! Relay configuration
//!
//! Settings come from an optional JSON file, overridden per field by
//! environment variables and CLI flags (handled by clap in `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Relay daemon configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    /// Base DNS domain for tunnels (`<name>.<domain>`)
    pub domain: String,
    /// Public HTTP port
    pub http_port: u16,
    /// Dedicated agent control-channel port
    pub ws_port: u16,
    /// Management API port
    pub api_port: u16,
    /// Shared auth token for agents and the API; null disables auth
    pub auth_token: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            domain: "localhost".to_string(),
            http_port: 80,
            ws_port: 8081,
            api_port: 8082,
            auth_token: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from a JSON file, or defaults when no file is
    /// given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };

        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: RelayConfig = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RelayConfig::default();
        assert_eq!(config.domain, "localhost");
        assert_eq!(config.http_port, 80);
        assert_eq!(config.ws_port, 8081);
        assert_eq!(config.api_port, 8082);
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{"domain": "tunnel.example.com", "authToken": "T"}"#;
        let config: RelayConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.domain, "tunnel.example.com");
        assert_eq!(config.auth_token.as_deref(), Some("T"));
        // Unspecified keys keep their defaults
        assert_eq!(config.http_port, 80);
        assert_eq!(config.api_port, 8082);
    }

    #[test]
    fn test_load_missing_path_is_default() {
        let config = RelayConfig::load(None).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_load_round_trip() {
        let config = RelayConfig {
            domain: "t.example.net".to_string(),
            http_port: 8080,
            ws_port: 9001,
            api_port: 9002,
            auth_token: Some("secret".to_string()),
        };

        let path = std::env::temp_dir().join(format!("burrow-config-{}.json", std::process::id()));
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = RelayConfig::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_load_rejects_malformed_file() {
        let path = std::env::temp_dir().join(format!("burrow-bad-{}.json", std::process::id()));
        std::fs::write(&path, "{not json").unwrap();

        let result = RelayConfig::load(Some(&path));
        std::fs::remove_file(&path).ok();
        assert!(result.is_err());
    }
}
