//! Client configuration at `~/.ptylink/config.toml`.
//!
//! `[relay]` and `[terminal]` map onto the client library's settings;
//! `[store]` locates the binding file. CLI flags override the relay section.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use ptylink_client::{FileBindingStore, RelayConfig, TerminalConfig};
use serde::Deserialize;
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,

    #[serde(default)]
    pub terminal: TerminalConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Binding persistence settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    /// Binding file; `~/.ptylink/bindings.json` when unset.
    #[serde(default)]
    pub bindings_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &str) -> Result<Self> {
        let path = Path::new(path);
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Open the binding store this config points at.
    pub fn binding_store(&self) -> Result<FileBindingStore> {
        match &self.store.bindings_path {
            Some(path) => Ok(FileBindingStore::new(path.clone())),
            None => FileBindingStore::default_location()
                .map_err(|e| anyhow::anyhow!("{e}"))
                .context("failed to locate binding store"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.relay.url, "ws://127.0.0.1:8787/ws");
        assert!(cfg.relay.device_id.is_none());
        assert_eq!(cfg.terminal, TerminalConfig::default());
        assert!(cfg.store.bindings_path.is_none());
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[relay]
url = "wss://relay.example.com/ws"
device_id = "desk-1"

[terminal]
unbind_delay_ms = 750

[store]
bindings_path = "/tmp/ptylink-bindings.json"
"#;
        let cfg: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.relay.url, "wss://relay.example.com/ws");
        assert_eq!(cfg.relay.device_id.as_deref(), Some("desk-1"));
        assert_eq!(cfg.terminal.unbind_delay_ms, 750);
        assert_eq!(cfg.terminal.ring_capacity, TerminalConfig::default().ring_capacity);
        assert_eq!(
            cfg.binding_store().unwrap().path(),
            Path::new("/tmp/ptylink-bindings.json")
        );
    }

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.relay, RelayConfig::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[relay\nurl = ").unwrap();
        assert!(Config::load(path.to_str().unwrap()).is_err());
    }
}
