//! ptylink-client: terminal sessions on a remote producer, reached over a relay.
//!
//! [`TerminalService`] owns every session's state: the registry, replay
//! rings, bind readiness, last-known sizes and deferred-unbind timers. It
//! drives the producer through any [`ptylink_core::RelayTransport`];
//! [`WsRelayTransport`] is the WebSocket implementation.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ptylink_client::{FileBindingStore, RelayConfig, TerminalConfig, TerminalService, WsRelayTransport};
//!
//! # async fn example() -> ptylink_core::PtyResult<()> {
//! let relay = Arc::new(WsRelayTransport::connect(RelayConfig {
//!     url: "wss://relay.example.com/ws".into(),
//!     device_id: Some("desk-1".into()),
//!     ..Default::default()
//! }));
//! relay.wait_connected(Duration::from_secs(10)).await?;
//!
//! let store = FileBindingStore::default_location()?;
//! let terminals = TerminalService::new(relay, Box::new(store), TerminalConfig::default());
//! terminals.ensure_session("job-42", true).await?;
//! terminals.resize("job-42", 120, 40).await?;
//! terminals.write("job-42", b"cargo test\r").await?;
//! # Ok(())
//! # }
//! ```

pub mod binder;
pub mod bindings;
pub mod config;
pub mod fanout;
pub mod rebinder;
pub mod registry;
pub mod resize;
pub mod ring_buffer;
pub mod service;
pub mod transport;
pub mod write_path;

#[cfg(test)]
mod testing;

pub use bindings::{
    Binding, BindingIndex, BindingStore, ContextKind, FileBindingStore, MemoryBindingStore,
    TerminalContext,
};
pub use config::{RelayConfig, TerminalConfig};
pub use fanout::{OutputStream, TerminalOutput};
pub use registry::{SessionLifecycle, TerminalSession};
pub use ring_buffer::ByteRing;
pub use service::TerminalService;
pub use transport::WsRelayTransport;
pub use write_path::{chunk_large_text, RetryPolicy};

pub use ptylink_core::{PtyError, PtyResult};
