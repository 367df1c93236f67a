//! Scriptable in-process relay used by the service tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use ptylink_core::{
    decode_base64, BoxFuture, ConnectionState, EventHub, PtyError, PtyResult, RelayEvent, RelayTransport,
    SessionMetadata, SessionStatus, StartResponse,
};
use tokio::sync::{mpsc, watch};

use crate::bindings::MemoryBindingStore;
use crate::config::TerminalConfig;
use crate::service::TerminalService;

/// One recorded transport call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Start { job_id: String, shell: Option<String> },
    GetStatus(String),
    GetMetadata(String),
    GetActiveSessions,
    Write { session_id: String, data: Vec<u8> },
    Resize { session_id: String, cols: u16, rows: u16 },
    Kill(String),
    Detach(String),
    Bind { producer: String, session_id: String, include_snapshot: bool },
    Unbind(String),
}

struct MockState {
    connection: ConnectionState,
    producer: Option<String>,
    calls: Vec<Call>,
    /// Overrides the id echoed by `start`.
    start_session_id: Option<String>,
    statuses: HashMap<String, SessionStatus>,
    active_sessions: Vec<String>,
    write_failures: VecDeque<PtyError>,
    kill_failure: Option<PtyError>,
    bind_failure: Option<PtyError>,
    resize_delay: Option<Duration>,
}

pub struct MockTransport {
    state: Mutex<MockState>,
    events: EventHub,
    /// `true` lets binds complete; `false` parks them until released.
    bind_gate: watch::Sender<bool>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState {
                connection: ConnectionState::Connected,
                producer: Some("desk-1".into()),
                calls: Vec::new(),
                start_session_id: None,
                statuses: HashMap::new(),
                active_sessions: Vec::new(),
                write_failures: VecDeque::new(),
                kill_failure: None,
                bind_failure: None,
                resize_delay: None,
            }),
            events: EventHub::new(),
            bind_gate: watch::channel(true).0,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn record(&self, call: Call) {
        self.lock().calls.push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }

    /// Change the link state without publishing an event.
    pub fn set_connection(&self, state: ConnectionState) {
        self.lock().connection = state;
    }

    /// Change the link state and publish it like a real transport would.
    pub fn transition(&self, state: ConnectionState) {
        self.set_connection(state);
        self.emit(RelayEvent::Connection(state));
    }

    pub fn set_producer(&self, producer: Option<&str>) {
        self.lock().producer = producer.map(String::from);
    }

    pub fn echo_session_id(&self, id: &str) {
        self.lock().start_session_id = Some(id.to_string());
    }

    pub fn set_status(&self, session_id: &str, status: SessionStatus) {
        self.lock().statuses.insert(session_id.to_string(), status);
    }

    pub fn set_active_sessions(&self, ids: &[&str]) {
        self.lock().active_sessions = ids.iter().map(|s| s.to_string()).collect();
    }

    pub fn fail_next_writes(&self, errors: Vec<PtyError>) {
        self.lock().write_failures.extend(errors);
    }

    pub fn fail_next_kill(&self, error: PtyError) {
        self.lock().kill_failure = Some(error);
    }

    pub fn fail_binds(&self, error: Option<PtyError>) {
        self.lock().bind_failure = error;
    }

    pub fn delay_resizes(&self, delay: Duration) {
        self.lock().resize_delay = Some(delay);
    }

    pub fn hold_binds(&self) {
        self.bind_gate.send_replace(false);
    }

    pub fn release_binds(&self) {
        self.bind_gate.send_replace(true);
    }

    pub fn emit(&self, event: RelayEvent) {
        self.events.publish(event);
    }

    pub fn emit_output(&self, session_id: Option<&str>, data: &'static [u8]) {
        self.emit(RelayEvent::Output {
            session_id: session_id.map(String::from),
            data: Bytes::from_static(data),
        });
    }
}

impl RelayTransport for MockTransport {
    fn connection_state(&self) -> ConnectionState {
        self.lock().connection
    }

    fn producer_device_id(&self) -> Option<String> {
        self.lock().producer.clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RelayEvent> {
        self.events.subscribe()
    }

    fn start<'a>(
        &'a self,
        job_id: &'a str,
        shell: Option<&'a str>,
    ) -> BoxFuture<'a, PtyResult<StartResponse>> {
        Box::pin(async move {
            let session_id = {
                let mut state = self.lock();
                state.calls.push(Call::Start {
                    job_id: job_id.to_string(),
                    shell: shell.map(String::from),
                });
                state
                    .start_session_id
                    .clone()
                    .unwrap_or_else(|| job_id.to_string())
            };
            Ok(StartResponse {
                session_id,
                working_directory: Some("/home/dev".into()),
                shell: shell.map(String::from),
            })
        })
    }

    fn get_status<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, PtyResult<SessionStatus>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(Call::GetStatus(session_id.to_string()));
            Ok(state
                .statuses
                .get(session_id)
                .copied()
                .unwrap_or(SessionStatus::Stopped))
        })
    }

    fn get_metadata<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, PtyResult<SessionMetadata>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(Call::GetMetadata(session_id.to_string()));
            let status = state
                .statuses
                .get(session_id)
                .copied()
                .unwrap_or(SessionStatus::Stopped);
            Ok(SessionMetadata {
                status,
                working_directory: Some("/srv/app".into()),
                started_at: Some(1_700_000_000_000),
            })
        })
    }

    fn get_active_sessions(&self) -> BoxFuture<'_, PtyResult<Vec<String>>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(Call::GetActiveSessions);
            Ok(state.active_sessions.clone())
        })
    }

    fn write<'a>(&'a self, session_id: &'a str, data_b64: String) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(async move {
            let data = decode_base64(&data_b64)?;
            let mut state = self.lock();
            state.calls.push(Call::Write {
                session_id: session_id.to_string(),
                data,
            });
            match state.write_failures.pop_front() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn resize<'a>(
        &'a self,
        session_id: &'a str,
        cols: u16,
        rows: u16,
    ) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(async move {
            let delay = {
                let mut state = self.lock();
                state.calls.push(Call::Resize {
                    session_id: session_id.to_string(),
                    cols,
                    rows,
                });
                state.resize_delay
            };
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            Ok(())
        })
    }

    fn kill<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(async move {
            let mut state = self.lock();
            state.calls.push(Call::Kill(session_id.to_string()));
            match state.kill_failure.take() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn detach<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(async move {
            self.record(Call::Detach(session_id.to_string()));
            Ok(())
        })
    }

    fn bind_binary<'a>(
        &'a self,
        producer_device_id: &'a str,
        session_id: &'a str,
        include_snapshot: bool,
    ) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(async move {
            let failure = {
                let mut state = self.lock();
                state.calls.push(Call::Bind {
                    producer: producer_device_id.to_string(),
                    session_id: session_id.to_string(),
                    include_snapshot,
                });
                state.bind_failure.clone()
            };
            let mut gate = self.bind_gate.subscribe();
            let released = gate.wait_for(|open| *open).await.is_ok();
            if !released {
                return Err(PtyError::Disconnected("mock transport dropped".into()));
            }
            match failure {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn unbind_binary(&self, session_id: &str) -> PtyResult<()> {
        self.record(Call::Unbind(session_id.to_string()));
        Ok(())
    }
}

/// Service over a fresh mock with default config and in-memory bindings.
pub fn service_with(mock: &Arc<MockTransport>) -> TerminalService {
    TerminalService::new(
        mock.clone(),
        Box::new(MemoryBindingStore::new()),
        TerminalConfig::default(),
    )
}

/// Poll `cond` every 10 ms until it holds; panics after ~5 s of (virtual) time.
pub async fn eventually<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}
