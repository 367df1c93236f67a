//! Terminal service: the single owner of session state.
//!
//! Registry entries, replay rings, readiness flags, last-known sizes and
//! pending-unbind timers all live in one [`ServiceState`] behind one async
//! mutex. The lock is never held across a relay round-trip: operations take
//! what they need, release, await the transport, then re-lock to commit.
//! Inbound relay events are merged into the same state by a pump task.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, Weak};
use std::time::Duration;

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use ptylink_core::{PtyError, PtyResult, RelayEvent, RelayTransport};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::binder::{BinaryBinder, BindState};
use crate::bindings::{Binding, BindingIndex, BindingStore, TerminalContext};
use crate::config::TerminalConfig;
use crate::fanout::{OutputFanout, OutputStream, TerminalOutput};
use crate::registry::{SessionLifecycle, SessionRegistry, TerminalSession};
use crate::resize::ResizeCoalescer;

const ENSURE_POLL: Duration = Duration::from_millis(50);
const ENSURE_WAIT: Duration = Duration::from_secs(2);

/// Mutable state shared by every operation.
pub(crate) struct ServiceState {
    pub(crate) registry: SessionRegistry,
    pub(crate) fanout: OutputFanout,
    pub(crate) binder: BinaryBinder,
    pub(crate) resize: ResizeCoalescer,
    pub(crate) bindings: BindingIndex,
}

impl ServiceState {
    /// Session id for `job_id`, preferring an active entry.
    pub(crate) fn session_id_for_job(&self, job_id: &str) -> PtyResult<String> {
        self.registry
            .find_by_job(job_id)
            .map(|s| s.id.clone())
            .ok_or_else(|| PtyError::SessionNotFound(job_id.to_string()))
    }

    fn lookup(&self, job_id: &str) -> Option<String> {
        self.registry.find_by_job(job_id).map(|s| s.id.clone())
    }
}

#[derive(Debug, Default)]
struct BootstrapThrottle {
    running: bool,
    last_run: Option<Instant>,
}

pub(crate) struct Inner {
    pub(crate) transport: Arc<dyn RelayTransport>,
    pub(crate) config: TerminalConfig,
    pub(crate) state: Mutex<ServiceState>,
    /// Jobs with an `ensure_session` in progress.
    ensuring: StdMutex<HashSet<String>>,
    bootstrap: StdMutex<BootstrapThrottle>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(pump) = lock_std(&self.pump).take() {
            pump.abort();
        }
    }
}

fn lock_std<T>(m: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Releases the per-job ensure guard on drop.
struct EnsureGuard<'a> {
    set: &'a StdMutex<HashSet<String>>,
    job_id: String,
}

impl Drop for EnsureGuard<'_> {
    fn drop(&mut self) {
        lock_std(self.set).remove(&self.job_id);
    }
}

/// Clears the bootstrap `running` flag on drop.
struct BootstrapGuard<'a>(&'a StdMutex<BootstrapThrottle>);

impl Drop for BootstrapGuard<'_> {
    fn drop(&mut self) {
        lock_std(self.0).running = false;
    }
}

/// Client-side manager for remote PTY sessions reached over a relay.
///
/// Cheap to clone; clones share state. Must be created inside a tokio
/// runtime because it spawns the relay event pump.
#[derive(Clone)]
pub struct TerminalService {
    pub(crate) inner: Arc<Inner>,
}

impl TerminalService {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        store: Box<dyn BindingStore>,
        config: TerminalConfig,
    ) -> Self {
        let events = transport.subscribe();
        let state = ServiceState {
            registry: SessionRegistry::new(),
            fanout: OutputFanout::new(config.ring_capacity, config.broadcast_capacity),
            binder: BinaryBinder::new(),
            resize: ResizeCoalescer::new(),
            bindings: BindingIndex::load(store),
        };
        let inner = Arc::new(Inner {
            transport,
            config,
            state: Mutex::new(state),
            ensuring: StdMutex::new(HashSet::new()),
            bootstrap: StdMutex::new(BootstrapThrottle::default()),
            pump: StdMutex::new(None),
        });
        let pump = spawn_event_pump(Arc::downgrade(&inner), events);
        *lock_std(&inner.pump) = Some(pump);
        Self { inner }
    }

    pub fn config(&self) -> &TerminalConfig {
        &self.inner.config
    }

    fn require_connected(&self) -> PtyResult<()> {
        if self.inner.transport.is_connected() {
            Ok(())
        } else {
            Err(PtyError::NotConnected(
                "relay transport is not connected".into(),
            ))
        }
    }

    // ── Session registry ─────────────────────────────────────────────

    /// Start a remote PTY for `job_id` and register it.
    pub async fn start(
        &self,
        job_id: &str,
        shell: Option<&str>,
        context: TerminalContext,
    ) -> PtyResult<TerminalSession> {
        self.require_connected()?;
        let response = self.inner.transport.start(job_id, shell).await?;
        if response.session_id != job_id {
            warn!(
                job_id,
                session_id = %response.session_id,
                "protocol violation: producer did not echo the job id as session id"
            );
        }
        let session_id = response.session_id;

        let mut state = self.inner.state.lock().await;
        // Fresh PTY behind this id: any pending unbind and old bind state are void.
        state.binder.cancel_unbind(&session_id);
        state.binder.mark_gone(&session_id);
        state.resize.reset_first(&session_id);

        let mut session = TerminalSession::new(&session_id, job_id);
        session.device_id = self.inner.transport.producer_device_id();
        session.working_directory = response.working_directory;
        session.shell = response.shell.or_else(|| shell.map(String::from));
        state.registry.insert(session);
        state.fanout.ensure(&session_id);
        state.bindings.save(Binding {
            terminal_session_id: session_id.clone(),
            context: context.kind,
            origin_session_id: context.origin_session_id,
            job_id: context.job_id.or_else(|| Some(job_id.to_string())),
            created_at: Utc::now(),
        });

        for stale in state.registry.supersede(job_id, &session_id) {
            self.finalize_locked(&mut state, &stale);
            state.bindings.remove(&stale);
            state.fanout.remove(&stale);
        }

        state
            .registry
            .set_lifecycle(&session_id, SessionLifecycle::Active);
        info!(job_id, session_id = %session_id, "terminal session started");
        state
            .registry
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PtyError::InvalidState(format!("session {session_id} vanished during start")))
    }

    /// Return the active session for `job_id`, adopting a live remote PTY or
    /// (with `autostart`) starting a new one.
    pub async fn ensure_session(&self, job_id: &str, autostart: bool) -> PtyResult<TerminalSession> {
        if let Some(session) = self.active_session(job_id).await {
            return Ok(session);
        }

        let _guard = match self.claim_ensure(job_id) {
            Some(guard) => guard,
            None => {
                debug!(job_id, "ensure_session already in progress, waiting");
                let deadline = Instant::now() + ENSURE_WAIT;
                loop {
                    tokio::time::sleep(ENSURE_POLL).await;
                    if let Some(session) = self.active_session(job_id).await {
                        return Ok(session);
                    }
                    if let Some(guard) = self.claim_ensure(job_id) {
                        break guard;
                    }
                    if Instant::now() >= deadline {
                        return Err(PtyError::InvalidState(format!(
                            "session for {job_id} is still being resolved by another caller"
                        )));
                    }
                }
            }
        };

        // Re-check: the previous holder may have finished between our
        // lookup and the claim.
        if let Some(session) = self.active_session(job_id).await {
            return Ok(session);
        }
        self.resolve_session(job_id, autostart).await
    }

    fn claim_ensure(&self, job_id: &str) -> Option<EnsureGuard<'_>> {
        let mut ensuring = lock_std(&self.inner.ensuring);
        if !ensuring.insert(job_id.to_string()) {
            return None;
        }
        Some(EnsureGuard {
            set: &self.inner.ensuring,
            job_id: job_id.to_string(),
        })
    }

    async fn active_session(&self, job_id: &str) -> Option<TerminalSession> {
        let state = self.inner.state.lock().await;
        state.registry.find_active_by_job(job_id).cloned()
    }

    async fn resolve_session(&self, job_id: &str, autostart: bool) -> PtyResult<TerminalSession> {
        self.require_connected()?;
        // A persisted binding names the session that last served this job;
        // the producer's default id is the job id itself.
        let bound = {
            let state = self.inner.state.lock().await;
            state
                .bindings
                .find_by_job(job_id)
                .map(|b| b.terminal_session_id.clone())
        };
        let mut candidates = Vec::with_capacity(2);
        candidates.extend(bound.filter(|id| id != job_id));
        candidates.push(job_id.to_string());

        for session_id in &candidates {
            let status = self.inner.transport.get_status(session_id).await?;
            if status.is_live() {
                return self.adopt_remote(job_id, session_id).await;
            }
            debug!(job_id, session_id = %session_id, ?status, "candidate session not live");
        }
        if !autostart {
            return Err(PtyError::AutostartDisabled(job_id.to_string()));
        }
        info!(job_id, "no live session, autostarting");
        self.start(job_id, None, TerminalContext::job(job_id, job_id))
            .await
    }

    /// Register a session the producer reports as already running.
    async fn adopt_remote(&self, job_id: &str, session_id: &str) -> PtyResult<TerminalSession> {
        let metadata = match self.inner.transport.get_metadata(session_id).await {
            Ok(meta) => Some(meta),
            Err(e) => {
                warn!(job_id, session_id, error = %e, "metadata unavailable, adopting session without it");
                None
            }
        };

        let mut session = TerminalSession::new(session_id, job_id);
        session.device_id = self.inner.transport.producer_device_id();
        if let Some(meta) = metadata {
            session.working_directory = meta.working_directory;
            if let Some(started) = meta
                .started_at
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            {
                session.created_at = started;
            }
        }

        let mut state = self.inner.state.lock().await;
        state.binder.cancel_unbind(session_id);
        state.registry.insert(session);
        state.fanout.ensure(session_id);
        for stale in state.registry.supersede(job_id, session_id) {
            self.finalize_locked(&mut state, &stale);
            state.fanout.remove(&stale);
        }
        state
            .registry
            .set_lifecycle(session_id, SessionLifecycle::Active);
        info!(job_id, session_id, "adopted running remote session");
        state
            .registry
            .get(session_id)
            .cloned()
            .ok_or_else(|| PtyError::InvalidState(format!("session {session_id} vanished during adoption")))
    }

    /// Kill the remote PTY for `job_id` and forget it locally.
    ///
    /// If the producer rejects the kill, the previous lifecycle is restored.
    pub async fn kill(&self, job_id: &str) -> PtyResult<()> {
        let (session_id, previous) = {
            let mut state = self.inner.state.lock().await;
            let session_id = state.session_id_for_job(job_id)?;
            let previous = state
                .registry
                .set_lifecycle(&session_id, SessionLifecycle::inactive("Killing"));
            (session_id, previous)
        };

        if let Err(e) = self.inner.transport.kill(&session_id).await {
            let mut state = self.inner.state.lock().await;
            let still_killing = state
                .registry
                .get(&session_id)
                .is_some_and(|s| s.lifecycle == SessionLifecycle::inactive("Killing"));
            if let (true, Some(previous)) = (still_killing, previous) {
                state.registry.set_lifecycle(&session_id, previous);
            }
            warn!(job_id, session_id = %session_id, error = %e, "kill failed");
            return Err(e);
        }

        let mut state = self.inner.state.lock().await;
        state
            .registry
            .set_lifecycle(&session_id, SessionLifecycle::inactive("Killed"));
        self.finalize_locked(&mut state, &session_id);
        state.bindings.remove(&session_id);
        state.fanout.remove(&session_id);
        state.registry.remove(&session_id);
        info!(job_id, session_id = %session_id, "terminal session killed");
        Ok(())
    }

    /// Reconcile the registry with the producer's live session list.
    ///
    /// Returns `Ok(false)` when throttled (already running, or ran less than
    /// the configured interval ago).
    pub async fn bootstrap_from_remote(&self) -> PtyResult<bool> {
        let _guard = {
            let mut throttle = lock_std(&self.inner.bootstrap);
            let min_interval = self.inner.config.bootstrap_min_interval();
            let too_soon = throttle
                .last_run
                .is_some_and(|at| at.elapsed() < min_interval);
            if throttle.running || too_soon {
                debug!(running = throttle.running, "bootstrap throttled");
                return Ok(false);
            }
            throttle.running = true;
            throttle.last_run = Some(Instant::now());
            BootstrapGuard(&self.inner.bootstrap)
        };

        self.require_connected()?;
        let remote: HashSet<String> = self
            .inner
            .transport
            .get_active_sessions()
            .await?
            .into_iter()
            .collect();

        let mut state = self.inner.state.lock().await;
        let mut adopted = 0usize;
        for id in &remote {
            let known_active = state
                .registry
                .get(id)
                .is_some_and(|s| s.lifecycle.is_active());
            if known_active {
                continue;
            }
            let job_id = state
                .bindings
                .get(id)
                .and_then(|b| b.job_id.clone())
                .unwrap_or_else(|| id.clone());
            let mut session = TerminalSession::new(id.as_str(), job_id);
            session.device_id = self.inner.transport.producer_device_id();
            state.binder.cancel_unbind(id);
            state.registry.insert(session);
            state.fanout.ensure(id);
            state.registry.set_lifecycle(id, SessionLifecycle::Active);
            adopted += 1;
        }

        let mut lost = 0usize;
        for id in state.registry.active_ids() {
            if remote.contains(&id) {
                continue;
            }
            state
                .registry
                .set_lifecycle(&id, SessionLifecycle::inactive("Disconnected"));
            state.binder.mark_gone(&id);
            lost += 1;
        }
        info!(remote = remote.len(), adopted, lost, "bootstrap reconciliation complete");
        Ok(true)
    }

    // ── Binder ───────────────────────────────────────────────────────

    /// Bind the output stream for `job_id`. No-op if already ready.
    pub async fn attach(&self, job_id: &str, include_snapshot: bool) -> PtyResult<()> {
        let session_id = {
            let state = self.inner.state.lock().await;
            state.session_id_for_job(job_id)?
        };
        self.bind_session(&session_id, include_snapshot).await
    }

    /// Bind handshake for one session id; shared by attach, the first-resize
    /// trigger and the reconnection rebinder.
    pub(crate) async fn bind_session(&self, session_id: &str, include_snapshot: bool) -> PtyResult<()> {
        let producer = {
            let mut state = self.inner.state.lock().await;
            if !state.registry.contains(session_id) {
                return Err(PtyError::SessionNotFound(session_id.to_string()));
            }
            if !state.binder.begin_bind(session_id) {
                trace!(session_id, "bind skipped, already bound or in flight");
                return Ok(());
            }
            state.binder.cancel_unbind(session_id);
            // Publisher must exist before the first frame can arrive.
            state.fanout.ensure(session_id);
            match self.inner.transport.producer_device_id() {
                Some(producer) => producer,
                None => {
                    state.binder.bind_failed(session_id);
                    return Err(PtyError::NotConnected("no producer device is paired".into()));
                }
            }
        };

        debug!(session_id, producer = %producer, include_snapshot, "requesting output stream bind");
        let result = match tokio::time::timeout(
            self.inner.config.bind_ack_timeout(),
            self.inner
                .transport
                .bind_binary(&producer, session_id, include_snapshot),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PtyError::Timeout),
        };

        let reissue = {
            let mut state = self.inner.state.lock().await;
            match &result {
                Ok(()) => {
                    if !state.binder.bind_acked(session_id) {
                        debug!(session_id, "bind ack arrived after the request was superseded");
                        return Err(PtyError::InvalidState(format!(
                            "bind for {session_id} was superseded"
                        )));
                    }
                    state.resize.last_known_size(session_id)
                }
                Err(e) => {
                    state.binder.bind_failed(session_id);
                    warn!(session_id, error = %e, "bind failed");
                    None
                }
            }
        };
        result?;
        info!(session_id, include_snapshot, "output stream bound");

        if let Some((cols, rows)) = reissue {
            debug!(session_id, cols, rows, "reissuing last known size after bind");
            if let Err(e) = self.inner.transport.resize(session_id, cols, rows).await {
                warn!(session_id, error = %e, "failed to reissue terminal size");
            }
        }
        Ok(())
    }

    /// Stop local consumption for `job_id`: live streams end, the binding and
    /// replay ring stay so reopening the view is instant. No unbind is sent.
    pub async fn detach_live_binary(&self, job_id: &str) {
        let mut state = self.inner.state.lock().await;
        if let Some(session_id) = state.lookup(job_id) {
            state.fanout.close_streams(&session_id);
            debug!(job_id, session_id = %session_id, "viewer detached, binding kept");
        }
    }

    /// Detach the local viewer and tell the producer (best-effort).
    pub async fn detach(&self, job_id: &str) {
        self.detach_live_binary(job_id).await;
        let session_id = {
            let state = self.inner.state.lock().await;
            state.lookup(job_id)
        };
        if let Some(session_id) = session_id {
            if let Err(e) = self.inner.transport.detach(&session_id).await {
                debug!(job_id, error = %e, "detach notification failed");
            }
        }
    }

    /// Clear readiness, ring and size state now; unbind after a delay unless
    /// the session comes back first.
    pub(crate) fn finalize_locked(&self, state: &mut ServiceState, session_id: &str) {
        state.binder.cancel_unbind(session_id);
        state.binder.mark_gone(session_id);
        state.fanout.clear_ring(session_id);
        state.resize.forget(session_id);

        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.config.unbind_delay();
        let id = session_id.to_string();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let mut state = inner.state.lock().await;
            state.binder.take_unbind(&id);
            let reactivated = state
                .registry
                .get(&id)
                .is_some_and(|s| s.lifecycle.is_active());
            if reactivated || state.binder.state(&id) != BindState::Unbound {
                debug!(session_id = %id, "session came back, deferred unbind skipped");
                return;
            }
            drop(state);
            match inner.transport.unbind_binary(&id) {
                Ok(()) => debug!(session_id = %id, "deferred unbind sent"),
                Err(e) => warn!(session_id = %id, error = %e, "deferred unbind failed"),
            }
        });
        state.binder.schedule_unbind(session_id, timer);
    }

    /// Flush work that would otherwise outlive a short-lived process:
    /// pending deferred unbinds are sent now and queued binding changes are
    /// written to the store.
    pub async fn shutdown(&self) {
        let flushed = {
            let mut state = self.inner.state.lock().await;
            let due: Vec<String> = state
                .binder
                .drain_unbinds()
                .into_iter()
                .filter(|id| {
                    let reactivated = state
                        .registry
                        .get(id)
                        .is_some_and(|s| s.lifecycle.is_active());
                    !reactivated && state.binder.state(id) == BindState::Unbound
                })
                .collect();
            for id in &due {
                match self.inner.transport.unbind_binary(id) {
                    Ok(()) => debug!(session_id = %id, "unbind sent at shutdown"),
                    Err(e) => warn!(session_id = %id, error = %e, "unbind at shutdown failed"),
                }
            }
            state.bindings.flush()
        };
        if flushed.await.is_err() {
            warn!("binding writer stopped before shutdown flush");
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Whether the session's bind was acknowledged and not since finalized.
    pub async fn is_bound(&self, job_id: &str) -> bool {
        let state = self.inner.state.lock().await;
        state
            .lookup(job_id)
            .is_some_and(|id| state.binder.was_bound(&id))
    }

    /// Whether output is currently streaming for the session.
    pub async fn is_session_ready(&self, job_id: &str) -> bool {
        let state = self.inner.state.lock().await;
        state
            .lookup(job_id)
            .is_some_and(|id| state.binder.is_ready(&id))
    }

    pub async fn session(&self, job_id: &str) -> Option<TerminalSession> {
        let state = self.inner.state.lock().await;
        state.registry.find_by_job(job_id).cloned()
    }

    pub async fn sessions(&self) -> Vec<TerminalSession> {
        let state = self.inner.state.lock().await;
        state.registry.list()
    }

    pub async fn last_known_size(&self, job_id: &str) -> Option<(u16, u16)> {
        let state = self.inner.state.lock().await;
        state
            .lookup(job_id)
            .and_then(|id| state.resize.last_known_size(&id))
    }

    pub async fn bindings(&self) -> Vec<Binding> {
        let state = self.inner.state.lock().await;
        let mut all = state.bindings.all();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Current replay buffer contents for `job_id`.
    pub async fn snapshot(&self, job_id: &str) -> Bytes {
        let state = self.inner.state.lock().await;
        state
            .lookup(job_id)
            .map(|id| state.fanout.snapshot(&id))
            .unwrap_or_default()
    }

    // ── Output fan-out ───────────────────────────────────────────────

    /// Live-only output; empty if there is no session for `job_id`.
    pub async fn raw_stream(&self, job_id: &str) -> OutputStream {
        let state = self.inner.state.lock().await;
        match state.lookup(job_id) {
            Some(id) => state.fanout.raw_stream(&id),
            None => stream::empty().boxed(),
        }
    }

    /// Replay snapshot (if any) followed by live output.
    pub async fn hydrated_raw_stream(&self, job_id: &str) -> OutputStream {
        let mut state = self.inner.state.lock().await;
        match state.lookup(job_id) {
            Some(id) => {
                state.fanout.ensure(&id);
                state.fanout.hydrated_stream(&id)
            }
            None => stream::empty().boxed(),
        }
    }

    pub async fn text_stream(&self, job_id: &str) -> BoxStream<'static, TerminalOutput> {
        let state = self.inner.state.lock().await;
        match state.lookup(job_id) {
            Some(id) => state.fanout.text_stream(&id),
            None => stream::empty().boxed(),
        }
    }

    /// Forget every session, ring, binding and timer (device switch).
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        state.binder.clear();
        state.registry.clear();
        state.fanout.clear();
        state.resize.clear();
        state.bindings.clear();
        info!("terminal state reset");
    }

    // ── Relay events ─────────────────────────────────────────────────

    async fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Output { session_id, data } => {
                let mut state = self.inner.state.lock().await;
                let target = match session_id {
                    Some(id) => id,
                    None => match state.binder.current() {
                        Some(id) => id.to_string(),
                        None => {
                            trace!(bytes = data.len(), "untagged output with no bound session dropped");
                            return;
                        }
                    },
                };
                state.fanout.publish(&target, data);
            }
            RelayEvent::Exit { session_id, code } => {
                let mut state = self.inner.state.lock().await;
                if !state.registry.contains(&session_id) {
                    debug!(session_id = %session_id, "exit for unknown session ignored");
                    return;
                }
                let reason = match code {
                    Some(code) => format!("Exited({code})"),
                    None => "Exited".to_string(),
                };
                state
                    .registry
                    .set_lifecycle(&session_id, SessionLifecycle::inactive(reason));
                self.finalize_locked(&mut state, &session_id);
                info!(session_id = %session_id, ?code, "remote PTY exited");
            }
            RelayEvent::Connection(conn) => self.on_connection_change(conn).await,
        }
    }
}

fn spawn_event_pump(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<RelayEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            TerminalService { inner }.handle_event(event).await;
        }
        debug!("relay event channel closed");
    })
}
