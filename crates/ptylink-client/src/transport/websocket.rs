//! WebSocket relay transport.
//!
//! One socket carries both planes:
//! - text frames: JSON control envelopes (RPC requests/responses, bind
//!   handshake, producer events, keepalive)
//! - binary frames: PTC1-framed PTY output
//!
//! A supervisor task owns the socket and redials with exponential backoff
//! when it drops. Pending RPCs and bind acks are oneshot waiters; losing the
//! socket fails all of them with `Disconnected`. A bind waiter whose caller
//! gives up is removed when its future is dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use ptylink_core::messages::{
    self, methods, ActiveSessionsResponse, BindPayload, EventPayload, ExitEvent, RpcRequest,
    SessionRef, StatusResponse,
};
use ptylink_core::{
    frame_decode, BoxFuture, ConnectionState, EventHub, PtyError, PtyResult, RelayEnvelope, RelayEvent,
    RelayTransport, SessionMetadata, SessionStatus, StartResponse,
};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::config::RelayConfig;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type BindWaiters = Vec<(u64, oneshot::Sender<PtyResult<()>>)>;

struct Shared {
    config: RelayConfig,
    conn: watch::Sender<ConnectionState>,
    events: EventHub,
    /// Outgoing frames for the live socket; `None` while disconnected.
    outgoing: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    pending_rpcs: Mutex<HashMap<String, oneshot::Sender<PtyResult<Value>>>>,
    pending_binds: Mutex<HashMap<String, BindWaiters>>,
    next_waiter: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Relay client over a single reconnecting WebSocket.
pub struct WsRelayTransport {
    shared: Arc<Shared>,
    supervisor: JoinHandle<()>,
}

impl WsRelayTransport {
    /// Start the connection supervisor. Returns immediately; use
    /// [`wait_connected`](Self::wait_connected) to block until the first
    /// successful dial.
    pub fn connect(config: RelayConfig) -> Self {
        let shared = Arc::new(Shared {
            config,
            conn: watch::channel(ConnectionState::Disconnected).0,
            events: EventHub::new(),
            outgoing: Mutex::new(None),
            pending_rpcs: Mutex::new(HashMap::new()),
            pending_binds: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
        });
        let supervisor = tokio::spawn(supervise(shared.clone()));
        Self { shared, supervisor }
    }

    /// Wait until the link is `Connected`, up to `timeout`.
    pub async fn wait_connected(&self, timeout: Duration) -> PtyResult<()> {
        let mut rx = self.shared.conn.subscribe();
        let outcome = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s == ConnectionState::Connected)
                .await
                .map(|_| ())
        })
        .await;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(PtyError::Disconnected("relay transport shut down".into())),
            Err(_) => Err(PtyError::NotConnected(format!(
                "could not reach relay at {}",
                self.shared.config.url
            ))),
        }
    }

    /// Close the socket and stop redialing.
    pub fn close(&self) {
        self.supervisor.abort();
        if let Some(tx) = lock(&self.shared.outgoing).take() {
            let _ = tx.send(Message::Close(None));
        }
        self.shared.fail_waiters("relay transport closed");
        self.shared.set_state(ConnectionState::Disconnected);
    }

    async fn call(&self, method: &str, params: Value) -> PtyResult<Value> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.shared.pending_rpcs).insert(id.clone(), tx);

        let request = RelayEnvelope::RpcRequest(RpcRequest {
            id: id.clone(),
            method: method.to_string(),
            params,
        });
        if let Err(e) = self.shared.send_envelope(&request) {
            lock(&self.shared.pending_rpcs).remove(&id);
            return Err(e);
        }
        trace!(method, id = %id, "rpc sent");

        match tokio::time::timeout(self.shared.config.rpc_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PtyError::Disconnected(format!(
                "connection dropped before {method} completed"
            ))),
            Err(_) => {
                lock(&self.shared.pending_rpcs).remove(&id);
                warn!(method, id = %id, "rpc timed out");
                Err(PtyError::Timeout)
            }
        }
    }

    async fn call_unit(&self, method: &str, params: Value) -> PtyResult<()> {
        self.call(method, params).await.map(|_| ())
    }
}

impl Drop for WsRelayTransport {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

/// Registration of one bind waiter; dropping it withdraws the waiter.
struct BindWaiter<'a> {
    shared: &'a Shared,
    session_id: &'a str,
    id: u64,
}

impl<'a> BindWaiter<'a> {
    fn register(
        shared: &'a Shared,
        session_id: &'a str,
        tx: oneshot::Sender<PtyResult<()>>,
    ) -> Self {
        let id = shared.next_waiter.fetch_add(1, Ordering::Relaxed);
        lock(&shared.pending_binds)
            .entry(session_id.to_string())
            .or_default()
            .push((id, tx));
        Self {
            shared,
            session_id,
            id,
        }
    }
}

impl Drop for BindWaiter<'_> {
    fn drop(&mut self) {
        let mut pending = lock(&self.shared.pending_binds);
        if let Some(waiters) = pending.get_mut(self.session_id) {
            waiters.retain(|(id, _)| *id != self.id);
            if waiters.is_empty() {
                pending.remove(self.session_id);
            }
        }
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.conn.send_replace(state);
        if previous != state {
            debug!(from = ?previous, to = ?state, "relay connection state");
            self.events.publish(RelayEvent::Connection(state));
        }
    }

    fn send(&self, message: Message) -> PtyResult<()> {
        let outgoing = lock(&self.outgoing);
        let tx = outgoing
            .as_ref()
            .ok_or_else(|| PtyError::NotConnected("relay socket is not open".into()))?;
        tx.send(message)
            .map_err(|_| PtyError::Disconnected("relay socket writer stopped".into()))
    }

    fn send_envelope(&self, envelope: &RelayEnvelope) -> PtyResult<()> {
        self.send(Message::Text(envelope.to_json()?))
    }

    fn fail_waiters(&self, reason: &str) {
        let rpcs: Vec<_> = lock(&self.pending_rpcs).drain().collect();
        let binds: Vec<_> = lock(&self.pending_binds).drain().collect();
        if !rpcs.is_empty() || !binds.is_empty() {
            debug!(rpcs = rpcs.len(), binds = binds.len(), reason, "failing pending relay requests");
        }
        for (_, tx) in rpcs {
            let _ = tx.send(Err(PtyError::Disconnected(reason.to_string())));
        }
        for (_, tx) in binds.into_iter().flat_map(|(_, waiters)| waiters) {
            let _ = tx.send(Err(PtyError::Disconnected(reason.to_string())));
        }
    }

    /// Send a bind request and wait for the producer's ack.
    async fn bind(
        &self,
        producer_device_id: &str,
        session_id: &str,
        include_snapshot: bool,
    ) -> PtyResult<()> {
        let (tx, rx) = oneshot::channel();
        let waiter = BindWaiter::register(self, session_id, tx);

        let bind = RelayEnvelope::Bind(BindPayload {
            session_id: session_id.to_string(),
            include_snapshot,
            producer_device_id: Some(producer_device_id.to_string()),
        });
        self.send_envelope(&bind)?;

        let result = rx.await.unwrap_or_else(|_| {
            Err(PtyError::Disconnected(format!(
                "bind for {session_id} abandoned"
            )))
        });
        drop(waiter);
        result
    }

    /// Pump one socket until it fails or closes.
    async fn run_connection(&self, ws: WsStream) {
        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *lock(&self.outgoing) = Some(tx);
        self.set_state(ConnectionState::Connected);

        loop {
            tokio::select! {
                outgoing = rx.recv() => match outgoing {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            warn!(error = %e, "relay write failed");
                            break;
                        }
                    }
                    None => break,
                },
                incoming = stream.next() => match incoming {
                    Some(Ok(message)) => {
                        if !self.handle_message(message) {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "relay read failed");
                        break;
                    }
                    None => break,
                },
            }
        }

        lock(&self.outgoing).take();
    }

    /// Returns `false` when the peer closed the socket.
    fn handle_message(&self, message: Message) -> bool {
        match message {
            Message::Text(text) => self.handle_envelope(&text),
            Message::Binary(data) => self.handle_output(&data),
            Message::Close(frame) => {
                debug!(?frame, "relay closed the socket");
                return false;
            }
            // tungstenite answers pings itself.
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
        }
        true
    }

    fn handle_output(&self, data: &[u8]) {
        match frame_decode(data) {
            Ok(frame) => {
                self.events.publish(RelayEvent::Output {
                    session_id: frame.session_id.map(String::from),
                    data: Bytes::copy_from_slice(frame.payload),
                });
            }
            Err(e) => warn!(error = %e, len = data.len(), "dropping malformed output frame"),
        }
    }

    fn handle_envelope(&self, text: &str) {
        let envelope = match RelayEnvelope::from_json(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "ignoring relay message");
                return;
            }
        };
        match envelope {
            RelayEnvelope::RpcResponse(response) => {
                match lock(&self.pending_rpcs).remove(&response.id) {
                    Some(tx) => {
                        let _ = tx.send(response.into_result());
                    }
                    None => debug!(id = %response.id, "response for unknown or expired request"),
                }
            }
            RelayEnvelope::Bound(SessionRef { session_id }) => {
                let waiters = lock(&self.pending_binds).remove(&session_id);
                match waiters {
                    Some(waiters) => {
                        for (_, tx) in waiters {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    None => debug!(session_id = %session_id, "unsolicited bind ack"),
                }
            }
            RelayEnvelope::Event(EventPayload {
                event_type,
                payload,
            }) => {
                if event_type == messages::EXIT_EVENT {
                    match serde_json::from_value::<ExitEvent>(payload) {
                        Ok(exit) => {
                            self.events.publish(RelayEvent::Exit {
                                session_id: exit.session_id,
                                code: exit.code,
                            });
                        }
                        Err(e) => warn!(error = %e, "malformed exit event"),
                    }
                } else {
                    trace!(event_type = %event_type, "ignoring producer event");
                }
            }
            RelayEnvelope::Error(body) => {
                warn!(code = body.code, message = %body.message, "relay reported an error");
            }
            RelayEnvelope::Ping => {
                if let Err(e) = self.send_envelope(&RelayEnvelope::Pong) {
                    debug!(error = %e, "failed to answer ping");
                }
            }
            RelayEnvelope::Pong => trace!("pong"),
            RelayEnvelope::RpcRequest(_) | RelayEnvelope::Bind(_) | RelayEnvelope::Unbind(_) => {
                debug!("ignoring producer-bound message received by the client");
            }
        }
    }
}

async fn supervise(shared: Arc<Shared>) {
    let initial = shared.config.reconnect_initial();
    let max = shared.config.reconnect_max();
    let mut backoff = initial;
    loop {
        match connect_async(shared.config.url.as_str()).await {
            Ok((ws, _response)) => {
                info!(url = %shared.config.url, "relay connected");
                backoff = initial;
                shared.run_connection(ws).await;
                shared.fail_waiters("relay connection lost");
                shared.set_state(ConnectionState::Reconnecting);
                warn!(url = %shared.config.url, "relay connection lost, reconnecting");
            }
            Err(e) => {
                shared.set_state(ConnectionState::Reconnecting);
                warn!(url = %shared.config.url, error = %e, backoff_ms = backoff.as_millis() as u64, "relay dial failed");
            }
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(max);
    }
}

impl RelayTransport for WsRelayTransport {
    fn connection_state(&self) -> ConnectionState {
        *self.shared.conn.borrow()
    }

    fn producer_device_id(&self) -> Option<String> {
        self.shared.config.device_id.clone()
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RelayEvent> {
        self.shared.events.subscribe()
    }

    fn start<'a>(
        &'a self,
        job_id: &'a str,
        shell: Option<&'a str>,
    ) -> BoxFuture<'a, PtyResult<StartResponse>> {
        Box::pin(async move {
            let value = self
                .call(methods::START, json!({ "jobId": job_id, "shell": shell }))
                .await?;
            messages::decode_result(methods::START, value)
        })
    }

    fn get_status<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, PtyResult<SessionStatus>> {
        Box::pin(async move {
            let value = self
                .call(methods::GET_STATUS, json!({ "sessionId": session_id }))
                .await?;
            let status: StatusResponse = messages::decode_result(methods::GET_STATUS, value)?;
            Ok(status.status)
        })
    }

    fn get_metadata<'a>(
        &'a self,
        session_id: &'a str,
    ) -> BoxFuture<'a, PtyResult<SessionMetadata>> {
        Box::pin(async move {
            let value = self
                .call(methods::GET_METADATA, json!({ "sessionId": session_id }))
                .await?;
            messages::decode_result(methods::GET_METADATA, value)
        })
    }

    fn get_active_sessions(&self) -> BoxFuture<'_, PtyResult<Vec<String>>> {
        Box::pin(async move {
            let value = self
                .call(methods::GET_ACTIVE_SESSIONS, json!({}))
                .await?;
            let response: ActiveSessionsResponse =
                messages::decode_result(methods::GET_ACTIVE_SESSIONS, value)?;
            Ok(response
                .sessions
                .into_iter()
                .map(|entry| entry.into_id())
                .collect())
        })
    }

    fn write<'a>(&'a self, session_id: &'a str, data_b64: String) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(async move {
            self.call_unit(
                methods::WRITE,
                json!({ "sessionId": session_id, "data": data_b64 }),
            )
            .await
        })
    }

    fn resize<'a>(
        &'a self,
        session_id: &'a str,
        cols: u16,
        rows: u16,
    ) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(async move {
            self.call_unit(
                methods::RESIZE,
                json!({ "sessionId": session_id, "cols": cols, "rows": rows }),
            )
            .await
        })
    }

    fn kill<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(async move {
            self.call_unit(methods::KILL, json!({ "sessionId": session_id }))
                .await
        })
    }

    fn detach<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(async move {
            self.call_unit(methods::DETACH, json!({ "sessionId": session_id }))
                .await
        })
    }

    fn bind_binary<'a>(
        &'a self,
        producer_device_id: &'a str,
        session_id: &'a str,
        include_snapshot: bool,
    ) -> BoxFuture<'a, PtyResult<()>> {
        Box::pin(self.shared.bind(producer_device_id, session_id, include_snapshot))
    }

    fn unbind_binary(&self, session_id: &str) -> PtyResult<()> {
        self.shared
            .send_envelope(&RelayEnvelope::Unbind(SessionRef {
                session_id: session_id.to_string(),
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ptylink_core::frame_encode;

    fn shared() -> (Arc<Shared>, mpsc::UnboundedReceiver<Message>) {
        let shared = Arc::new(Shared {
            config: RelayConfig::default(),
            conn: watch::channel(ConnectionState::Connected).0,
            events: EventHub::new(),
            outgoing: Mutex::new(None),
            pending_rpcs: Mutex::new(HashMap::new()),
            pending_binds: Mutex::new(HashMap::new()),
            next_waiter: AtomicU64::new(0),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&shared.outgoing) = Some(tx);
        (shared, rx)
    }

    #[test]
    fn tagged_and_untagged_output_frames() {
        let (shared, _rx) = shared();
        let mut events = shared.events.subscribe();

        shared.handle_output(&frame_encode("job-1", b"ls\r\n").unwrap());
        shared.handle_output(b"raw bytes");

        assert_eq!(
            events.try_recv().unwrap(),
            RelayEvent::Output {
                session_id: Some("job-1".into()),
                data: Bytes::from_static(b"ls\r\n"),
            }
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RelayEvent::Output {
                session_id: None,
                data: Bytes::from_static(b"raw bytes"),
            }
        );
    }

    #[tokio::test]
    async fn rpc_response_resolves_waiter() {
        let (shared, _rx) = shared();
        let (tx, rx) = oneshot::channel();
        lock(&shared.pending_rpcs).insert("req-1".into(), tx);

        shared.handle_envelope(
            r#"{"type":"rpc.response","payload":{"id":"req-1","error":{"code":404,"message":"gone"}}}"#,
        );
        let result = rx.await.unwrap();
        assert!(matches!(result, Err(PtyError::Server { code: 404, .. })));
    }

    #[tokio::test]
    async fn bound_ack_resolves_every_waiter_for_session() {
        let (shared, _rx) = shared();
        let (tx1, rx1) = oneshot::channel();
        let (tx2, rx2) = oneshot::channel();
        lock(&shared.pending_binds).insert("job-1".into(), vec![(0, tx1), (1, tx2)]);

        shared.handle_envelope(r#"{"type":"terminal.binary.bound","payload":{"sessionId":"job-1"}}"#);
        assert!(rx1.await.unwrap().is_ok());
        assert!(rx2.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_bind_withdraws_its_waiter() {
        let (shared, mut rx) = shared();
        let first = tokio::time::timeout(
            Duration::from_secs(5),
            shared.bind("producer-1", "job-1", true),
        )
        .await;
        assert!(first.is_err());
        assert!(matches!(rx.try_recv().unwrap(), Message::Text(_)));
        assert!(lock(&shared.pending_binds).is_empty());

        // A live waiter for the same session is untouched by another's drop.
        let live = {
            let shared = shared.clone();
            tokio::spawn(async move { shared.bind("producer-1", "job-1", true).await })
        };
        let abandoned = tokio::time::timeout(
            Duration::from_secs(5),
            shared.bind("producer-1", "job-1", false),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(lock(&shared.pending_binds).get("job-1").map(Vec::len), Some(1));

        shared.handle_envelope(r#"{"type":"terminal.binary.bound","payload":{"sessionId":"job-1"}}"#);
        assert!(live.await.unwrap().is_ok());
        assert!(lock(&shared.pending_binds).is_empty());
    }

    #[test]
    fn bind_send_failure_leaves_no_waiter() {
        let (shared, _rx) = shared();
        lock(&shared.outgoing).take();
        let result = futures_util::FutureExt::now_or_never(shared.bind("producer-1", "job-2", true));
        assert!(matches!(result, Some(Err(PtyError::NotConnected(_)))));
        assert!(lock(&shared.pending_binds).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn wait_connected_resolves_on_connect_and_times_out_otherwise() {
        let (shared, _rx) = shared();
        shared.set_state(ConnectionState::Disconnected);
        let transport = WsRelayTransport {
            shared: shared.clone(),
            supervisor: tokio::spawn(async {}),
        };

        assert!(matches!(
            transport.wait_connected(Duration::from_secs(1)).await,
            Err(PtyError::NotConnected(_))
        ));

        let later = shared.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            later.set_state(ConnectionState::Connected);
        });
        transport
            .wait_connected(Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[test]
    fn exit_event_is_published() {
        let (shared, _rx) = shared();
        let mut events = shared.events.subscribe();
        shared.handle_envelope(
            r#"{"type":"event","payload":{"eventType":"terminal.exit","payload":{"sessionId":"job-3","code":130}}}"#,
        );
        assert_eq!(
            events.try_recv().unwrap(),
            RelayEvent::Exit {
                session_id: "job-3".into(),
                code: Some(130),
            }
        );
    }

    #[test]
    fn ping_envelope_is_answered() {
        let (shared, mut rx) = shared();
        shared.handle_envelope(r#"{"type":"ping"}"#);
        match rx.try_recv().unwrap() {
            Message::Text(text) => {
                assert_eq!(RelayEnvelope::from_json(&text).unwrap(), RelayEnvelope::Pong)
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lost_connection_fails_waiters() {
        let (shared, _rx) = shared();
        let (tx, rx) = oneshot::channel();
        lock(&shared.pending_rpcs).insert("req-9".into(), tx);
        let (btx, brx) = oneshot::channel();
        lock(&shared.pending_binds).insert("job-9".into(), vec![(0, btx)]);

        shared.fail_waiters("relay connection lost");
        assert!(matches!(rx.await.unwrap(), Err(PtyError::Disconnected(_))));
        assert!(matches!(brx.await.unwrap(), Err(PtyError::Disconnected(_))));
    }

    #[test]
    fn state_changes_are_published_once() {
        let (shared, _rx) = shared();
        let mut events = shared.events.subscribe();
        shared.set_state(ConnectionState::Reconnecting);
        shared.set_state(ConnectionState::Reconnecting);
        assert_eq!(
            events.try_recv().unwrap(),
            RelayEvent::Connection(ConnectionState::Reconnecting)
        );
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn sends_fail_without_socket() {
        let (shared, _rx) = shared();
        lock(&shared.outgoing).take();
        assert!(matches!(
            shared.send_envelope(&RelayEnvelope::Ping),
            Err(PtyError::NotConnected(_))
        ));
    }
}
