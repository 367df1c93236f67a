//! Relay control-channel messages and typed RPC results.
//!
//! Every text frame on the relay socket is a JSON envelope of the form
//! `{"type": "<kind>", "payload": {...}}`. Payloads are decoded into the
//! structs below at the transport boundary; nothing above it handles raw
//! JSON maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{PtyError, PtyResult};

/// RPC method names understood by the producer.
pub mod methods {
    pub const START: &str = "terminal.start";
    pub const GET_STATUS: &str = "terminal.getStatus";
    pub const GET_METADATA: &str = "terminal.getMetadata";
    pub const GET_ACTIVE_SESSIONS: &str = "terminal.getActiveSessions";
    pub const WRITE: &str = "terminal.write";
    pub const RESIZE: &str = "terminal.resize";
    pub const KILL: &str = "terminal.kill";
    pub const DETACH: &str = "terminal.detach";
}

/// Event type carried by `event` envelopes when a PTY exits.
pub const EXIT_EVENT: &str = "terminal.exit";

/// Top-level relay envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum RelayEnvelope {
    #[serde(rename = "rpc.request")]
    RpcRequest(RpcRequest),
    #[serde(rename = "rpc.response")]
    RpcResponse(RpcResponse),
    #[serde(rename = "terminal.binary.bind")]
    Bind(BindPayload),
    #[serde(rename = "terminal.binary.bound")]
    Bound(SessionRef),
    #[serde(rename = "terminal.binary.unbind")]
    Unbind(SessionRef),
    #[serde(rename = "event")]
    Event(EventPayload),
    #[serde(rename = "error")]
    Error(RpcErrorBody),
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
}

impl RelayEnvelope {
    pub fn to_json(&self) -> PtyResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> PtyResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| PtyError::Protocol(format!("malformed relay envelope: {e}")))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcResponse {
    pub id: String,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    /// Convert the response into its result value, surfacing producer errors
    /// as [`PtyError::Server`].
    pub fn into_result(self) -> PtyResult<Value> {
        if let Some(err) = self.error {
            return Err(PtyError::Server {
                code: err.code,
                message: err.message,
            });
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindPayload {
    pub session_id: String,
    pub include_snapshot: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_device_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitEvent {
    pub session_id: String,
    #[serde(default)]
    pub code: Option<i32>,
}

// ── RPC results ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub session_id: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
}

/// Producer-side status of a PTY session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Restored,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl SessionStatus {
    /// Whether the producer still owns a live PTY for the session.
    pub fn is_live(self) -> bool {
        matches!(self, SessionStatus::Running | SessionStatus::Restored)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: SessionStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub status: SessionStatus,
    #[serde(default)]
    pub working_directory: Option<String>,
    /// Unix epoch milliseconds.
    #[serde(default)]
    pub started_at: Option<i64>,
}

/// Entries of `terminal.getActiveSessions`; producers report either bare ids
/// or objects carrying a `sessionId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActiveSessionEntry {
    Id(String),
    #[serde(rename_all = "camelCase")]
    Info { session_id: String },
}

impl ActiveSessionEntry {
    pub fn into_id(self) -> String {
        match self {
            ActiveSessionEntry::Id(id) => id,
            ActiveSessionEntry::Info { session_id } => session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveSessionsResponse {
    pub sessions: Vec<ActiveSessionEntry>,
}

/// Decode an RPC result value into a typed response.
pub fn decode_result<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> PtyResult<T> {
    serde_json::from_value(value)
        .map_err(|e| PtyError::Protocol(format!("unexpected {method} response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bind_envelope_shape() {
        let env = RelayEnvelope::Bind(BindPayload {
            session_id: "job-1".into(),
            include_snapshot: false,
            producer_device_id: Some("desk-1".into()),
        });
        let value: Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "terminal.binary.bind",
                "payload": {
                    "sessionId": "job-1",
                    "includeSnapshot": false,
                    "producerDeviceId": "desk-1"
                }
            })
        );
    }

    #[test]
    fn parses_bound_ack() {
        let env = RelayEnvelope::from_json(
            r#"{"type":"terminal.binary.bound","payload":{"sessionId":"job-7"}}"#,
        )
        .unwrap();
        assert_eq!(
            env,
            RelayEnvelope::Bound(SessionRef {
                session_id: "job-7".into()
            })
        );
    }

    #[test]
    fn parses_ping_without_payload() {
        assert_eq!(RelayEnvelope::from_json(r#"{"type":"ping"}"#).unwrap(), RelayEnvelope::Ping);
    }

    #[test]
    fn unknown_envelope_is_protocol_error() {
        let err = RelayEnvelope::from_json(r#"{"type":"device.hello","payload":{}}"#).unwrap_err();
        assert!(matches!(err, PtyError::Protocol(_)));
    }

    #[test]
    fn rpc_error_becomes_server_error() {
        let resp = RpcResponse {
            id: "1".into(),
            result: None,
            error: Some(RpcErrorBody {
                code: -32010,
                message: "Desktop is offline".into(),
            }),
        };
        match resp.into_result() {
            Err(PtyError::Server { code, message }) => {
                assert_eq!(code, -32010);
                assert_eq!(message, "Desktop is offline");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_status_falls_back() {
        let resp: StatusResponse = decode_result(methods::GET_STATUS, json!({"status": "idle"})).unwrap();
        assert_eq!(resp.status, SessionStatus::Unknown);
        assert!(!resp.status.is_live());
        assert!(SessionStatus::Restored.is_live());
    }

    #[test]
    fn active_sessions_accepts_both_shapes() {
        let resp: ActiveSessionsResponse = decode_result(
            methods::GET_ACTIVE_SESSIONS,
            json!({"sessions": ["a", {"sessionId": "b"}]}),
        )
        .unwrap();
        let ids: Vec<String> = resp.sessions.into_iter().map(ActiveSessionEntry::into_id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn start_response_missing_session_id_is_protocol_error() {
        let err = decode_result::<StartResponse>(methods::START, json!({"shell": "/bin/zsh"})).unwrap_err();
        assert!(matches!(err, PtyError::Protocol(_)));
    }
}
