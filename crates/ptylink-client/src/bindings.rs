//! Durable terminal-session → application-context bindings.
//!
//! A binding records which job or plan opened a terminal session so the
//! association survives process restarts. The in-memory [`BindingIndex`]
//! keeps a primary map by terminal-session id plus a job-id index. Changes
//! are queued to a writer task that applies them to the [`BindingStore`] in
//! order on the blocking pool, so callers holding the service lock never
//! touch the disk.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use ptylink_core::{PtyError, PtyResult};
use tokio::sync::{mpsc, oneshot};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

/// Kind of application context that opened a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextKind {
    Job,
    Plan,
    Adhoc,
}

/// Context supplied by callers of `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalContext {
    pub kind: ContextKind,
    /// Logical session that originated the terminal.
    pub origin_session_id: String,
    pub job_id: Option<String>,
}

impl TerminalContext {
    /// Context for a job-backed terminal.
    pub fn job(origin_session_id: impl Into<String>, job_id: impl Into<String>) -> Self {
        Self {
            kind: ContextKind::Job,
            origin_session_id: origin_session_id.into(),
            job_id: Some(job_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub terminal_session_id: String,
    pub context: ContextKind,
    pub origin_session_id: String,
    #[serde(default)]
    pub job_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Persistent storage for bindings.
pub trait BindingStore: Send + Sync {
    fn load_all(&self) -> PtyResult<Vec<Binding>>;
    fn save(&self, binding: &Binding) -> PtyResult<()>;
    fn delete(&self, terminal_session_id: &str) -> PtyResult<()>;
    fn clear(&self) -> PtyResult<()>;
}

/// JSON file store, one array of bindings per file.
pub struct FileBindingStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileBindingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at the default location (`~/.ptylink/bindings.json`).
    pub fn default_location() -> PtyResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| PtyError::Config("cannot determine home directory".into()))?;
        Ok(Self::new(home.join(".ptylink").join("bindings.json")))
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    fn guard(&self) -> std::sync::MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_entries(&self) -> PtyResult<Vec<Binding>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_entries(&self, entries: &[Binding]) -> PtyResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl BindingStore for FileBindingStore {
    fn load_all(&self) -> PtyResult<Vec<Binding>> {
        let _g = self.guard();
        self.read_entries()
    }

    fn save(&self, binding: &Binding) -> PtyResult<()> {
        let _g = self.guard();
        let mut entries = self.read_entries()?;
        entries.retain(|b| b.terminal_session_id != binding.terminal_session_id);
        entries.push(binding.clone());
        self.write_entries(&entries)
    }

    fn delete(&self, terminal_session_id: &str) -> PtyResult<()> {
        let _g = self.guard();
        let mut entries = self.read_entries()?;
        let before = entries.len();
        entries.retain(|b| b.terminal_session_id != terminal_session_id);
        if entries.len() != before {
            self.write_entries(&entries)?;
        }
        Ok(())
    }

    fn clear(&self) -> PtyResult<()> {
        let _g = self.guard();
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

/// In-memory store, used by tests and ephemeral clients.
#[derive(Default)]
pub struct MemoryBindingStore {
    entries: Mutex<Vec<Binding>>,
}

impl MemoryBindingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, Vec<Binding>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BindingStore for MemoryBindingStore {
    fn load_all(&self) -> PtyResult<Vec<Binding>> {
        Ok(self.entries().clone())
    }

    fn save(&self, binding: &Binding) -> PtyResult<()> {
        let mut entries = self.entries();
        entries.retain(|b| b.terminal_session_id != binding.terminal_session_id);
        entries.push(binding.clone());
        Ok(())
    }

    fn delete(&self, terminal_session_id: &str) -> PtyResult<()> {
        self.entries().retain(|b| b.terminal_session_id != terminal_session_id);
        Ok(())
    }

    fn clear(&self) -> PtyResult<()> {
        self.entries().clear();
        Ok(())
    }
}

enum StoreOp {
    Save(Binding),
    Delete(String),
    Clear,
    Flush(oneshot::Sender<()>),
}

/// In-memory binding maps with queued persistence.
///
/// Store failures are logged and never fail the caller.
pub struct BindingIndex {
    by_session: HashMap<String, Binding>,
    /// job id → terminal session id.
    by_job: HashMap<String, String>,
    writes: mpsc::UnboundedSender<StoreOp>,
}

impl BindingIndex {
    /// Build the index from everything the store currently holds and start
    /// its writer task. Must be called inside a tokio runtime.
    pub fn load(store: Box<dyn BindingStore>) -> Self {
        let store: Arc<dyn BindingStore> = Arc::from(store);
        let (writes, ops) = mpsc::unbounded_channel();
        let mut index = Self {
            by_session: HashMap::new(),
            by_job: HashMap::new(),
            writes,
        };
        match store.load_all() {
            Ok(bindings) => {
                debug!(count = bindings.len(), "loaded terminal bindings");
                for b in bindings {
                    index.insert_memory(b);
                }
            }
            Err(e) => warn!(error = %e, "failed to load terminal bindings"),
        }
        tokio::spawn(run_writer(store, ops));
        index
    }

    fn queue(&self, op: StoreOp) {
        if self.writes.send(op).is_err() {
            warn!("binding writer stopped, change not persisted");
        }
    }

    /// Resolves once every change queued so far has reached the store.
    pub fn flush(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.queue(StoreOp::Flush(tx));
        rx
    }

    /// Insert or replace the binding for its terminal session.
    pub fn save(&mut self, binding: Binding) {
        self.queue(StoreOp::Save(binding.clone()));
        self.insert_memory(binding);
    }

    pub fn get(&self, terminal_session_id: &str) -> Option<&Binding> {
        self.by_session.get(terminal_session_id)
    }

    pub fn find_by_job(&self, job_id: &str) -> Option<&Binding> {
        self.by_job.get(job_id).and_then(|sid| self.by_session.get(sid))
    }

    pub fn remove(&mut self, terminal_session_id: &str) -> Option<Binding> {
        let removed = self.by_session.remove(terminal_session_id)?;
        if let Some(job) = &removed.job_id {
            if self.by_job.get(job).map(String::as_str) == Some(terminal_session_id) {
                self.by_job.remove(job);
            }
        }
        self.queue(StoreOp::Delete(terminal_session_id.to_string()));
        Some(removed)
    }

    pub fn clear(&mut self) {
        self.by_session.clear();
        self.by_job.clear();
        self.queue(StoreOp::Clear);
    }

    pub fn len(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_session.is_empty()
    }

    pub fn all(&self) -> Vec<Binding> {
        self.by_session.values().cloned().collect()
    }

    fn insert_memory(&mut self, binding: Binding) {
        // Drop a stale job-index entry that pointed at the old binding.
        if let Some(old) = self.by_session.get(&binding.terminal_session_id) {
            if let Some(old_job) = &old.job_id {
                if self.by_job.get(old_job) == Some(&binding.terminal_session_id) {
                    self.by_job.remove(old_job);
                }
            }
        }
        if let Some(job) = &binding.job_id {
            self.by_job
                .insert(job.clone(), binding.terminal_session_id.clone());
        }
        self.by_session
            .insert(binding.terminal_session_id.clone(), binding);
    }
}

async fn run_writer(store: Arc<dyn BindingStore>, mut ops: mpsc::UnboundedReceiver<StoreOp>) {
    while let Some(op) = ops.recv().await {
        let store = store.clone();
        let (what, result) = match op {
            StoreOp::Flush(done) => {
                let _ = done.send(());
                continue;
            }
            StoreOp::Save(binding) => (
                "save",
                tokio::task::spawn_blocking(move || store.save(&binding)).await,
            ),
            StoreOp::Delete(id) => (
                "delete",
                tokio::task::spawn_blocking(move || store.delete(&id)).await,
            ),
            StoreOp::Clear => ("clear", tokio::task::spawn_blocking(move || store.clear()).await),
        };
        match result {
            Ok(Ok(())) => trace!(op = what, "binding change persisted"),
            Ok(Err(e)) => warn!(op = what, error = %e, "failed to persist binding change"),
            Err(e) => warn!(op = what, error = %e, "binding store task failed"),
        }
    }
    debug!("binding writer stopped");
}
