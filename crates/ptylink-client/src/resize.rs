//! Resize coalescing while a session's bind handshake is in flight.
//!
//! The first resize for a session always reaches the producer. Once it
//! succeeds it is complete; if the size was sane it triggers the initial
//! bind, otherwise the bind waits for the next sane coalesced size. Until the
//! bind is acknowledged, later resizes only update the last-known size; the
//! bind ack reissues that size so the producer PTY matches the local view.

use std::collections::{HashMap, HashSet};

use ptylink_core::PtyResult;
use tracing::{debug, warn};

use crate::service::TerminalService;

const MIN_COLS: u16 = 10;
const MIN_ROWS: u16 = 5;

/// What to do with one resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeDecision {
    /// Session is ready: pass through.
    Forward,
    /// First resize for the session: pass through, then maybe bind.
    ForwardFirst,
    /// Not ready yet: keep the size, skip the producer.
    Coalesce,
    /// Like `Coalesce`, and the size is the first sane one after a tiny
    /// first resize: start the bind now.
    CoalesceThenBind,
}

#[derive(Debug, Default)]
pub struct ResizeCoalescer {
    last_known: HashMap<String, (u16, u16)>,
    first_in_flight: HashSet<String>,
    first_done: HashSet<String>,
    /// First resize done but too small to bind with.
    bind_deferred: HashSet<String>,
}

impl ResizeCoalescer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `(cols, rows)` and decide whether to forward it.
    pub fn plan(&mut self, session_id: &str, cols: u16, rows: u16, ready: bool) -> ResizeDecision {
        self.last_known
            .insert(session_id.to_string(), (cols, rows));
        if ready {
            return ResizeDecision::Forward;
        }
        if self.first_done.contains(session_id) {
            if is_sane((cols, rows)) && self.bind_deferred.remove(session_id) {
                return ResizeDecision::CoalesceThenBind;
            }
            return ResizeDecision::Coalesce;
        }
        if self.first_in_flight.contains(session_id) {
            return ResizeDecision::Coalesce;
        }
        self.first_in_flight.insert(session_id.to_string());
        ResizeDecision::ForwardFirst
    }

    /// Finish the first resize. A success always completes it; the size to
    /// bind with is returned only when the last-known size is sane, otherwise
    /// the bind is deferred to the next sane resize.
    pub fn complete_first(&mut self, session_id: &str, succeeded: bool) -> Option<(u16, u16)> {
        self.first_in_flight.remove(session_id);
        if !succeeded {
            return None;
        }
        self.first_done.insert(session_id.to_string());
        let size = self.last_known.get(session_id).copied()?;
        if !is_sane(size) {
            debug!(session_id, cols = size.0, rows = size.1, "first resize too small to start streaming");
            self.bind_deferred.insert(session_id.to_string());
            return None;
        }
        Some(size)
    }

    pub fn last_known_size(&self, session_id: &str) -> Option<(u16, u16)> {
        self.last_known.get(session_id).copied()
    }

    #[cfg(test)]
    pub fn first_resize_completed(&self, session_id: &str) -> bool {
        self.first_done.contains(session_id)
    }

    /// Require a fresh first resize (new PTY behind the same id), keeping the
    /// last-known size.
    pub fn reset_first(&mut self, session_id: &str) {
        self.first_done.remove(session_id);
        self.first_in_flight.remove(session_id);
        self.bind_deferred.remove(session_id);
    }

    pub fn forget(&mut self, session_id: &str) {
        self.last_known.remove(session_id);
        self.reset_first(session_id);
    }

    pub fn clear(&mut self) {
        self.last_known.clear();
        self.first_in_flight.clear();
        self.first_done.clear();
        self.bind_deferred.clear();
    }
}

fn is_sane((cols, rows): (u16, u16)) -> bool {
    cols > MIN_COLS && rows > MIN_ROWS
}

impl TerminalService {
    /// Resize the remote PTY for `job_id`, coalescing while the session is
    /// not yet streaming.
    pub async fn resize(&self, job_id: &str, cols: u16, rows: u16) -> PtyResult<()> {
        let (session_id, decision) = {
            let mut state = self.inner.state.lock().await;
            let session_id = state.session_id_for_job(job_id)?;
            let ready = state.binder.is_ready(&session_id);
            let decision = state.resize.plan(&session_id, cols, rows, ready);
            (session_id, decision)
        };

        match decision {
            ResizeDecision::Coalesce => {
                debug!(session_id = %session_id, cols, rows, "resize coalesced until bind completes");
                Ok(())
            }
            ResizeDecision::CoalesceThenBind => {
                debug!(session_id = %session_id, cols, rows, "first sane size, binding output stream");
                self.spawn_initial_bind(session_id);
                Ok(())
            }
            ResizeDecision::Forward => {
                self.inner
                    .transport
                    .resize(&session_id, cols, rows)
                    .await
            }
            ResizeDecision::ForwardFirst => {
                let result = self
                    .inner
                    .transport
                    .resize(&session_id, cols, rows)
                    .await;
                let bind_size = {
                    let mut state = self.inner.state.lock().await;
                    state.resize.complete_first(&session_id, result.is_ok())
                };
                result?;

                if let Some((cols, rows)) = bind_size {
                    debug!(session_id = %session_id, cols, rows, "first resize complete, binding output stream");
                    self.spawn_initial_bind(session_id);
                }
                Ok(())
            }
        }
    }

    fn spawn_initial_bind(&self, session_id: String) {
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = service.bind_session(&session_id, true).await {
                warn!(session_id = %session_id, error = %e, "initial bind failed");
            }
        });
    }
}
