//! CLI subcommand implementations.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ptylink_client::{TerminalService, WsRelayTransport};
use tracing::debug;

use crate::config::Config;

pub mod attach;
pub mod bindings;
pub mod kill;
pub mod send;
pub mod sessions;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial the relay and build a terminal service over it.
pub async fn connect(cfg: &Config) -> Result<TerminalService> {
    if cfg.relay.device_id.is_none() {
        anyhow::bail!("no producer device configured (use --device or [relay] device_id)");
    }
    debug!(url = %cfg.relay.url, "connecting to relay");
    let relay = Arc::new(WsRelayTransport::connect(cfg.relay.clone()));
    relay
        .wait_connected(CONNECT_TIMEOUT)
        .await
        .context("relay connection failed")?;

    let store = cfg.binding_store()?;
    Ok(TerminalService::new(relay, Box::new(store), cfg.terminal.clone()))
}
