//! Abstract relay transport contract for ptylink.
//!
//! The terminal client drives a remote producer exclusively through this
//! trait. Implementations own reconnection, request correlation, and
//! per-request timeouts; they surface inbound output, exit notifications,
//! and connection changes through an [`EventHub`], which never drops events
//! for a subscriber that falls behind.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::PtyResult;
use crate::messages::{SessionMetadata, SessionStatus, StartResponse};

/// Boxed `Send` future returned by transport operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Connection state of the relay link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Out-of-band events delivered by the relay.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    /// Raw PTY output. `session_id` is `None` for untagged frames.
    Output {
        session_id: Option<String>,
        data: Bytes,
    },
    /// The producer's PTY exited.
    Exit {
        session_id: String,
        code: Option<i32>,
    },
    Connection(ConnectionState),
}

/// Lossless fan-out of relay events to every subscriber.
///
/// Each subscriber gets its own unbounded queue, so a slow consumer delays
/// output but never loses it. Closed subscribers are pruned on publish.
#[derive(Default)]
pub struct EventHub {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<RelayEvent>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RelayEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Deliver an event to every live subscriber; returns how many got it.
    pub fn publish(&self, event: RelayEvent) -> usize {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }
}

/// Request/response relay to the producer that owns the PTYs.
pub trait RelayTransport: Send + Sync {
    /// Current link state.
    fn connection_state(&self) -> ConnectionState;

    /// Whether the link is currently usable.
    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Identity of the paired producer, if known.
    fn producer_device_id(&self) -> Option<String>;

    /// Subscribe to inbound relay events.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<RelayEvent>;

    fn start<'a>(
        &'a self,
        job_id: &'a str,
        shell: Option<&'a str>,
    ) -> BoxFuture<'a, PtyResult<StartResponse>>;

    fn get_status<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, PtyResult<SessionStatus>>;

    fn get_metadata<'a>(&'a self, session_id: &'a str)
        -> BoxFuture<'a, PtyResult<SessionMetadata>>;

    fn get_active_sessions(&self) -> BoxFuture<'_, PtyResult<Vec<String>>>;

    /// Deliver input bytes, already base64-encoded.
    fn write<'a>(&'a self, session_id: &'a str, data_b64: String) -> BoxFuture<'a, PtyResult<()>>;

    fn resize<'a>(&'a self, session_id: &'a str, cols: u16, rows: u16)
        -> BoxFuture<'a, PtyResult<()>>;

    fn kill<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, PtyResult<()>>;

    /// Best-effort viewer detach notification.
    fn detach<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, PtyResult<()>>;

    /// Request binary streaming for a session; resolves on the producer's ack.
    fn bind_binary<'a>(
        &'a self,
        producer_device_id: &'a str,
        session_id: &'a str,
        include_snapshot: bool,
    ) -> BoxFuture<'a, PtyResult<()>>;

    /// Fire-and-forget unbind of a session's binary stream.
    fn unbind_binary(&self, session_id: &str) -> PtyResult<()>;
}
