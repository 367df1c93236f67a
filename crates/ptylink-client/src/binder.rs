//! Binary stream bind state per session.
//!
//! `Unbound → BindRequested → Bound`; disconnect detection drops every
//! session back to `Unbound` without touching replay buffers. Sessions whose
//! bind was ever acknowledged stay in the "was bound" set until finalized so
//! the reconnection path knows what to rebind. Deferred unbind timers live
//! here, keyed by session id, so finalization and reset can abort them.

use std::collections::{HashMap, HashSet};

use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    BindRequested,
    Bound,
}

#[derive(Debug, Default)]
pub struct BinaryBinder {
    states: HashMap<String, BindState>,
    was_bound: HashSet<String>,
    pending_unbinds: HashMap<String, JoinHandle<()>>,
    /// Most recently acknowledged bind; receives untagged output frames.
    current: Option<String>,
}

impl BinaryBinder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, session_id: &str) -> BindState {
        self.states
            .get(session_id)
            .copied()
            .unwrap_or(BindState::Unbound)
    }

    /// Readiness flag: true only after an acknowledged bind.
    pub fn is_ready(&self, session_id: &str) -> bool {
        self.state(session_id) == BindState::Bound
    }

    pub fn was_bound(&self, session_id: &str) -> bool {
        self.was_bound.contains(session_id)
    }

    /// Move to `BindRequested`. Returns `false` when the session is already
    /// bound or a bind is in flight.
    pub fn begin_bind(&mut self, session_id: &str) -> bool {
        match self.state(session_id) {
            BindState::Unbound => {
                self.states
                    .insert(session_id.to_string(), BindState::BindRequested);
                true
            }
            BindState::BindRequested | BindState::Bound => false,
        }
    }

    /// Record the producer's ack. Ignored (returns `false`) if the request was
    /// superseded by a disconnect or finalization while in flight.
    pub fn bind_acked(&mut self, session_id: &str) -> bool {
        if self.state(session_id) != BindState::BindRequested {
            return false;
        }
        self.states.insert(session_id.to_string(), BindState::Bound);
        self.was_bound.insert(session_id.to_string());
        self.current = Some(session_id.to_string());
        true
    }

    pub fn bind_failed(&mut self, session_id: &str) {
        if self.state(session_id) == BindState::BindRequested {
            self.states.insert(session_id.to_string(), BindState::Unbound);
        }
    }

    /// Clear readiness for every session (transport went away).
    ///
    /// Returns the sessions that were ready.
    pub fn clear_readiness(&mut self) -> Vec<String> {
        let mut cleared = Vec::new();
        for (id, state) in self.states.iter_mut() {
            if *state == BindState::Bound {
                cleared.push(id.clone());
            }
            *state = BindState::Unbound;
        }
        cleared
    }

    /// Clear readiness for one session and stop rebinding it.
    pub fn mark_gone(&mut self, session_id: &str) {
        self.states.remove(session_id);
        self.was_bound.remove(session_id);
        if self.current.as_deref() == Some(session_id) {
            self.current = None;
        }
    }

    /// Sessions to rebind after reconnect: previously bound, not ready now.
    pub fn rebind_candidates(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .was_bound
            .iter()
            .filter(|id| self.state(id) == BindState::Unbound)
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Session that receives untagged output frames.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Store a deferred unbind timer, replacing (and aborting) any earlier one.
    pub fn schedule_unbind(&mut self, session_id: &str, handle: JoinHandle<()>) {
        if let Some(old) = self
            .pending_unbinds
            .insert(session_id.to_string(), handle)
        {
            old.abort();
        }
    }

    /// Abort a pending unbind. Returns whether one was pending.
    pub fn cancel_unbind(&mut self, session_id: &str) -> bool {
        match self.pending_unbinds.remove(session_id) {
            Some(handle) => {
                handle.abort();
                debug!(session_id, "deferred unbind cancelled");
                true
            }
            None => false,
        }
    }

    /// Forget a fired timer without aborting it (called from the timer).
    pub fn take_unbind(&mut self, session_id: &str) -> bool {
        self.pending_unbinds.remove(session_id).is_some()
    }

    /// Abort every pending timer and return the sessions they were for.
    pub fn drain_unbinds(&mut self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .pending_unbinds
            .drain()
            .map(|(id, handle)| {
                handle.abort();
                id
            })
            .collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub fn has_pending_unbind(&self, session_id: &str) -> bool {
        self.pending_unbinds.contains_key(session_id)
    }

    /// Drop all state and abort every timer.
    pub fn clear(&mut self) {
        for (_, handle) in self.pending_unbinds.drain() {
            handle.abort();
        }
        self.states.clear();
        self.was_bound.clear();
        self.current = None;
    }
}

impl Drop for BinaryBinder {
    fn drop(&mut self) {
        for (_, handle) in self.pending_unbinds.drain() {
            handle.abort();
        }
    }
}
