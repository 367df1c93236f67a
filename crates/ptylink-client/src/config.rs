//! Tunables for the terminal service: `[terminal]` section of the config TOML.

use std::time::Duration;

use serde::Deserialize;

use crate::ring_buffer::DEFAULT_RING_CAPACITY;

/// Terminal service configuration. Every field has a default so a partial
/// `[terminal]` table is valid.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TerminalConfig {
    /// Replay buffer capacity per session, in bytes.
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Chunk size used by `send_large_text`, in bytes.
    #[serde(default = "default_large_text_chunk")]
    pub large_text_chunk: usize,
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    #[serde(default = "default_write_initial_backoff_ms")]
    pub write_initial_backoff_ms: u64,
    /// Delay before a finalized session's unbind is sent to the producer.
    #[serde(default = "default_unbind_delay_ms")]
    pub unbind_delay_ms: u64,
    #[serde(default = "default_bind_ack_timeout_ms")]
    pub bind_ack_timeout_ms: u64,
    #[serde(default = "default_bootstrap_min_interval_ms")]
    pub bootstrap_min_interval_ms: u64,
    /// Live output broadcast buffer per session, in chunks.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            ring_capacity: default_ring_capacity(),
            large_text_chunk: default_large_text_chunk(),
            write_attempts: default_write_attempts(),
            write_initial_backoff_ms: default_write_initial_backoff_ms(),
            unbind_delay_ms: default_unbind_delay_ms(),
            bind_ack_timeout_ms: default_bind_ack_timeout_ms(),
            bootstrap_min_interval_ms: default_bootstrap_min_interval_ms(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl TerminalConfig {
    pub fn unbind_delay(&self) -> Duration {
        Duration::from_millis(self.unbind_delay_ms)
    }

    pub fn bind_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.bind_ack_timeout_ms)
    }

    pub fn bootstrap_min_interval(&self) -> Duration {
        Duration::from_millis(self.bootstrap_min_interval_ms)
    }

    pub fn write_initial_backoff(&self) -> Duration {
        Duration::from_millis(self.write_initial_backoff_ms)
    }
}

/// Relay connection settings: `[relay]` section of the config TOML.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_url")]
    pub url: String,
    /// Producer device that owns the PTYs.
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: default_relay_url(),
            device_id: None,
            rpc_timeout_ms: default_rpc_timeout_ms(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
        }
    }
}

impl RelayConfig {
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn reconnect_initial(&self) -> Duration {
        Duration::from_millis(self.reconnect_initial_ms)
    }

    pub fn reconnect_max(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_ms.max(self.reconnect_initial_ms))
    }
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8787/ws".into()
}
fn default_rpc_timeout_ms() -> u64 {
    30_000
}
fn default_reconnect_initial_ms() -> u64 {
    500
}
fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_ring_capacity() -> usize {
    DEFAULT_RING_CAPACITY
}
fn default_large_text_chunk() -> usize {
    2 * 1024 * 1024
}
fn default_write_attempts() -> u32 {
    3
}
fn default_write_initial_backoff_ms() -> u64 {
    100
}
fn default_unbind_delay_ms() -> u64 {
    1000
}
fn default_bind_ack_timeout_ms() -> u64 {
    10_000
}
fn default_bootstrap_min_interval_ms() -> u64 {
    1000
}
fn default_broadcast_capacity() -> usize {
    1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_table_uses_defaults() {
        let cfg: TerminalConfig = toml::from_str("unbind_delay_ms = 250\n").unwrap();
        assert_eq!(cfg.unbind_delay(), Duration::from_millis(250));
        assert_eq!(cfg.ring_capacity, 8 * 1024 * 1024);
        assert_eq!(cfg.write_attempts, 3);
        assert_eq!(cfg.write_initial_backoff(), Duration::from_millis(100));
    }

    #[test]
    fn relay_section_defaults() {
        let relay: RelayConfig = toml::from_str("device_id = \"desk-1\"\n").unwrap();
        assert_eq!(relay.device_id.as_deref(), Some("desk-1"));
        assert_eq!(relay.url, "ws://127.0.0.1:8787/ws");
        assert_eq!(relay.rpc_timeout(), Duration::from_secs(30));
        assert_eq!(relay.reconnect_initial(), Duration::from_millis(500));
        assert_eq!(relay.reconnect_max(), Duration::from_secs(30));
    }

    #[test]
    fn empty_table_equals_default() {
        let cfg: TerminalConfig = toml::from_str("").unwrap();
        assert_eq!(cfg, TerminalConfig::default());
    }
}
