use thiserror::Error;

/// Errors produced by the ptylink terminal layer.
#[derive(Debug, Clone, Error)]
pub enum PtyError {
    /// No active transport or the producer is not connected.
    #[error("not connected: {0}")]
    NotConnected(String),

    /// Unexpected response shape, missing fields, or id mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The producer answered with an explicit error.
    #[error("server error [{code}]: {message}")]
    Server { code: i64, message: String },

    #[error("timeout")]
    Timeout,

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("network error: {0}")]
    Network(String),

    /// The operation is not allowed in the current state (e.g. a concurrent
    /// `ensure_session` still holds the guard).
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("session {0} is stopped and autostart is disabled")]
    AutostartDisabled(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("{0}")]
    Other(String),
}

impl PtyError {
    /// Whether the error belongs to the connectivity class that the write
    /// path retries with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PtyError::NotConnected(_)
                | PtyError::Timeout
                | PtyError::Disconnected(_)
                | PtyError::Network(_)
        )
    }
}

impl From<std::io::Error> for PtyError {
    fn from(e: std::io::Error) -> Self {
        PtyError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for PtyError {
    fn from(e: serde_json::Error) -> Self {
        PtyError::Codec(e.to_string())
    }
}

impl From<base64::DecodeError> for PtyError {
    fn from(e: base64::DecodeError) -> Self {
        PtyError::Codec(e.to_string())
    }
}

pub type PtyResult<T> = Result<T, PtyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connectivity_errors_are_retryable() {
        assert!(PtyError::NotConnected("relay".into()).is_retryable());
        assert!(PtyError::Timeout.is_retryable());
        assert!(PtyError::Disconnected("socket closed".into()).is_retryable());
        assert!(PtyError::Network("reset".into()).is_retryable());
    }

    #[test]
    fn other_errors_are_fatal() {
        assert!(!PtyError::Server { code: -32000, message: "boom".into() }.is_retryable());
        assert!(!PtyError::Protocol("bad shape".into()).is_retryable());
        assert!(!PtyError::InvalidState("busy".into()).is_retryable());
    }

    #[test]
    fn server_error_display() {
        let e = PtyError::Server { code: 404, message: "no such session".into() };
        assert_eq!(e.to_string(), "server error [404]: no such session");
    }
}
