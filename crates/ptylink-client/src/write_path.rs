//! Input delivery: bounded retry for writes and chunking for large pastes.

use std::time::Duration;

use ptylink_core::{encode_base64, PtyError, PtyResult, RelayTransport};
use tracing::{debug, warn};

use crate::config::TerminalConfig;
use crate::service::TerminalService;

const CARRIAGE_RETURN: &[u8] = b"\r";

/// Exponential backoff for the write path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &TerminalConfig) -> Self {
        Self {
            max_attempts: config.write_attempts.max(1),
            initial_backoff: config.write_initial_backoff(),
        }
    }

    /// Wait before retrying after failed attempt number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff.saturating_mul(1u32 << exp)
    }
}

/// Send `data` to `session_id`, retrying connectivity failures.
///
/// The link is checked before every attempt; an unconnected transport fails
/// immediately with `NotConnected` rather than burning retries.
pub async fn deliver_with_retry(
    transport: &dyn RelayTransport,
    session_id: &str,
    data: &[u8],
    policy: &RetryPolicy,
) -> PtyResult<()> {
    let encoded = encode_base64(data);
    let mut attempt = 1;
    loop {
        if !transport.is_connected() {
            return Err(PtyError::NotConnected(format!(
                "relay link is down, cannot write to {session_id}"
            )));
        }
        match transport.write(session_id, encoded.clone()).await {
            Ok(()) => {
                if attempt > 1 {
                    debug!(session_id, attempt, "write delivered after retry");
                }
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let wait = policy.backoff(attempt);
                warn!(session_id, attempt, error = %e, backoff_ms = wait.as_millis() as u64, "write failed, retrying");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Split `text` into pieces of at most `max_chunk` bytes, never inside a
/// UTF-8 code point. A code point wider than `max_chunk` gets its own piece.
pub fn chunk_large_text(text: &str, max_chunk: usize) -> Vec<&str> {
    let max_chunk = max_chunk.max(1);
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        if rest.len() <= max_chunk {
            chunks.push(rest);
            break;
        }
        let mut cut = max_chunk;
        while !rest.is_char_boundary(cut) {
            cut -= 1;
        }
        if cut == 0 {
            cut = rest
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(cut);
        chunks.push(head);
        rest = tail;
    }
    chunks
}

impl TerminalService {
    /// Write input bytes to the session for `job_id`.
    ///
    /// Resolves (without autostart) the session first, then delivers with
    /// retry.
    pub async fn write(&self, job_id: &str, data: &[u8]) -> PtyResult<()> {
        let session = self.ensure_session(job_id, false).await?;
        let policy = RetryPolicy::from_config(&self.inner.config);
        deliver_with_retry(self.inner.transport.as_ref(), &session.id, data, &policy).await
    }

    /// Paste `text` in chunks, yielding between them, optionally followed by
    /// a separate carriage return.
    pub async fn send_large_text(&self, job_id: &str, text: &str, append_cr: bool) -> PtyResult<()> {
        let chunks = chunk_large_text(text, self.inner.config.large_text_chunk);
        debug!(job_id, bytes = text.len(), chunks = chunks.len(), "sending large text");
        for chunk in chunks {
            self.write(job_id, chunk.as_bytes()).await?;
            tokio::task::yield_now().await;
        }
        if append_cr {
            self.write(job_id, CARRIAGE_RETURN).await?;
        }
        Ok(())
    }
}
