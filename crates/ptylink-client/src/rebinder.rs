//! Reconnection rebinding.
//!
//! Losing the relay link clears every session's readiness at once so views
//! can show a reconnecting state. When the link comes back, sessions that
//! were bound before are rebound without a snapshot: the local ring already
//! holds their recent history.

use ptylink_core::ConnectionState;
use tracing::{debug, info, warn};

use crate::service::TerminalService;

impl TerminalService {
    pub(crate) async fn on_connection_change(&self, conn: ConnectionState) {
        match conn {
            ConnectionState::Disconnected | ConnectionState::Reconnecting => {
                let cleared = {
                    let mut state = self.inner.state.lock().await;
                    state.binder.clear_readiness()
                };
                if !cleared.is_empty() {
                    info!(?conn, sessions = cleared.len(), "relay link lost, output streams paused");
                }
            }
            ConnectionState::Connected => {
                let service = self.clone();
                tokio::spawn(async move { service.rebind_all().await });
            }
        }
    }

    /// Rebind every previously bound session that is not ready.
    pub(crate) async fn rebind_all(&self) {
        let candidates = {
            let state = self.inner.state.lock().await;
            state
                .binder
                .rebind_candidates()
                .into_iter()
                .filter(|id| state.registry.contains(id))
                .collect::<Vec<_>>()
        };
        if candidates.is_empty() {
            debug!("relay link restored, nothing to rebind");
            return;
        }
        info!(sessions = candidates.len(), "relay link restored, rebinding output streams");

        for session_id in candidates {
            if let Err(e) = self.bind_session(&session_id, false).await {
                warn!(session_id = %session_id, error = %e, "rebind failed");
            }
        }
    }
}
