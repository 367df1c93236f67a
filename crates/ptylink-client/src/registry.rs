//! Terminal session registry.
//!
//! Tracks every known remote PTY attachment, its lifecycle, and the job that
//! owns it. The registry is plain data: the terminal service owns it inside
//! its serialized state, so none of these methods lock.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

/// Lifecycle of one registry entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionLifecycle {
    /// Created, output subscription not yet established.
    Initializing,
    Active,
    /// Terminal for this entry; the id may be registered again later.
    Inactive { reason: String },
}

impl SessionLifecycle {
    pub fn inactive(reason: impl Into<String>) -> Self {
        SessionLifecycle::Inactive {
            reason: reason.into(),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, SessionLifecycle::Active)
    }
}

impl fmt::Display for SessionLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionLifecycle::Initializing => write!(f, "initializing"),
            SessionLifecycle::Active => write!(f, "active"),
            SessionLifecycle::Inactive { reason } => write!(f, "inactive ({reason})"),
        }
    }
}

/// Identity and descriptive metadata for one remote PTY attachment.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalSession {
    /// Remote session identifier.
    pub id: String,
    /// Logical owner.
    pub job_id: String,
    /// Producer identity.
    pub device_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub is_active: bool,
    pub working_directory: Option<String>,
    pub shell: Option<String>,
    pub lifecycle: SessionLifecycle,
}

impl TerminalSession {
    pub fn new(id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            job_id: job_id.into(),
            device_id: None,
            created_at: Utc::now(),
            is_active: false,
            working_directory: None,
            shell: None,
            lifecycle: SessionLifecycle::Initializing,
        }
    }
}

/// In-memory map of terminal sessions keyed by remote session id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: HashMap<String, TerminalSession>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert (or replace) a session entry.
    pub fn insert(&mut self, session: TerminalSession) {
        debug!(session_id = %session.id, job_id = %session.job_id, lifecycle = %session.lifecycle, "session registered");
        self.sessions.insert(session.id.clone(), session);
    }

    pub fn get(&self, session_id: &str) -> Option<&TerminalSession> {
        self.sessions.get(session_id)
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// The session for `job_id`, preferring an active entry over stale ones.
    pub fn find_by_job(&self, job_id: &str) -> Option<&TerminalSession> {
        let mut fallback = None;
        for s in self.sessions.values().filter(|s| s.job_id == job_id) {
            if s.lifecycle.is_active() {
                return Some(s);
            }
            fallback = Some(s);
        }
        fallback
    }

    pub fn find_active_by_job(&self, job_id: &str) -> Option<&TerminalSession> {
        self.sessions
            .values()
            .find(|s| s.job_id == job_id && s.lifecycle.is_active())
    }

    /// Update an entry's lifecycle; `is_active` follows it. Returns the
    /// previous lifecycle, or `None` if the session is unknown.
    pub fn set_lifecycle(
        &mut self,
        session_id: &str,
        lifecycle: SessionLifecycle,
    ) -> Option<SessionLifecycle> {
        let session = self.sessions.get_mut(session_id)?;
        info!(session_id, from = %session.lifecycle, to = %lifecycle, "session lifecycle");
        session.is_active = lifecycle.is_active();
        Some(std::mem::replace(&mut session.lifecycle, lifecycle))
    }

    /// Remove every other entry that shares `job_id` with `keep`.
    ///
    /// Returns the ids of the superseded sessions.
    pub fn supersede(&mut self, job_id: &str, keep: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .sessions
            .values()
            .filter(|s| s.job_id == job_id && s.id != keep)
            .map(|s| s.id.clone())
            .collect();
        for id in &stale {
            self.sessions.remove(id);
            info!(session_id = %id, job_id, superseded_by = keep, "stale session superseded");
        }
        stale
    }

    pub fn remove(&mut self, session_id: &str) -> Option<TerminalSession> {
        let removed = self.sessions.remove(session_id);
        if removed.is_some() {
            info!(session_id, "session removed");
        }
        removed
    }

    /// Ids of every entry currently `Active`.
    pub fn active_ids(&self) -> Vec<String> {
        self.sessions
            .values()
            .filter(|s| s.lifecycle.is_active())
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn list(&self) -> Vec<TerminalSession> {
        let mut all: Vec<TerminalSession> = self.sessions.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn clear(&mut self) {
        self.sessions.clear();
    }
}
