//! Client configuration.
//!
//! Settings are read from a JSON file; every field is optional:
//!
//! ```text
//! {
//!   "endpoint": "127.0.0.1:9000",
//!   "read_buffer_size": 256,
//!   "max_message_len": 16777216,
//!   "nodelay": true
//! }
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::socket::Endpoint;

/// Bytes requested per socket read.
const DEFAULT_READ_BUFFER_SIZE: usize = 256;

/// Maximum size of one incoming message (16MB) so a peer that never sends a
/// delimiter cannot grow the accumulator without bound.
const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Settings for `XmlSocketClient`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientConfig {
    /// Default peer for the command-line client.
    pub endpoint: Option<Endpoint>,
    /// Size of the fixed receive chunk, in bytes.
    pub read_buffer_size: usize,
    /// Longest accepted incoming message; `None` disables the limit.
    pub max_message_len: Option<usize>,
    /// Set `TCP_NODELAY` on new connections.
    pub nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            max_message_len: Some(DEFAULT_MAX_MESSAGE_LEN),
            nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Read and validate a JSON config file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Like `load`, but returns defaults when the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    /// Reject settings the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.read_buffer_size == 0 {
            bail!("read_buffer_size must be greater than zero");
        }
        if self.max_message_len == Some(0) {
            bail!("max_message_len must be greater than zero (use null to disable the limit)");
        }
        Ok(())
    }
}

/// Resolve the default config file path.
///
/// Resolution order:
/// 1. `$XDG_CONFIG_HOME/xmlsocket/config.json`
/// 2. Platform config dir (`~/Library/Application Support` on macOS)
/// 3. `./xmlsocket.json` (fallback)
pub fn default_config_path() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join("xmlsocket").join("config.json");
    }

    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("xmlsocket").join("config.json");
    }

    PathBuf::from("xmlsocket.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn temp_config(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!(
            "xmlsocket-config-{}-{}.json",
            name,
            std::process::id()
        ));
        std::fs::write(&path, contents).expect("Failed to write temp config");
        path
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.read_buffer_size, 256);
        assert_eq!(config.max_message_len, Some(16 * 1024 * 1024));
        assert!(config.nodelay);
        assert!(config.endpoint.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"endpoint": "localhost:843", "nodelay": false}"#).unwrap();

        assert_eq!(
            config,
            ClientConfig {
                endpoint: Some(Endpoint::new("localhost", 843)),
                nodelay: false,
                ..ClientConfig::default()
            }
        );
    }

    #[test]
    fn test_null_disables_message_limit() {
        let config: ClientConfig = serde_json::from_str(r#"{"max_message_len": null}"#).unwrap();
        assert_eq!(config.max_message_len, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_field_rejected() {
        assert!(serde_json::from_str::<ClientConfig>(r#"{"buffer": 1}"#).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = ClientConfig {
            read_buffer_size: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ClientConfig {
            max_message_len: Some(0),
            ..ClientConfig::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("max_message_len"), "unexpected error: {}", err);
    }

    #[test]
    fn test_load_from_file() {
        let path = temp_config("load", r#"{"read_buffer_size": 4096}"#);
        let config = ClientConfig::load(&path).expect("load failed");
        let _ = std::fs::remove_file(&path);

        assert_eq!(config.read_buffer_size, 4096);
    }

    #[test]
    fn test_load_reports_invalid_file() {
        let path = temp_config("invalid", r#"{"read_buffer_size": 0}"#);
        let result = ClientConfig::load(&path);
        let _ = std::fs::remove_file(&path);

        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let path = std::env::temp_dir().join("xmlsocket-config-does-not-exist.json");
        let config = ClientConfig::load_or_default(&path).expect("defaults expected");
        assert_eq!(config, ClientConfig::default());
    }

    #[test]
    fn test_default_config_path_format() {
        let path = default_config_path();
        let filename = path.file_name().unwrap().to_str().unwrap();
        assert!(
            filename == "config.json" || filename == "xmlsocket.json",
            "Unexpected config filename: {}",
            filename
        );
    }
}
