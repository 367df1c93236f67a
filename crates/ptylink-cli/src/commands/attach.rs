//! `ptylink attach <job>`: interactive terminal on a remote PTY.
//!
//! Resolves (or starts) the job's session, replays its buffered output,
//! then pipes keystrokes and resizes to the producer until Ctrl+] or the
//! remote shell exits. Detaching leaves the PTY running.

use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::EventStream;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::terminal::{self as term, Input};

const LIFECYCLE_POLL: Duration = Duration::from_millis(500);

pub async fn run(cfg: &Config, job: &str, autostart: bool) -> Result<()> {
    let service = super::connect(cfg).await?;
    let session = service
        .ensure_session(job, autostart)
        .await
        .with_context(|| format!("no terminal for job '{job}'"))?;
    info!(job, session_id = %session.id, "attaching");

    // Subscribe before binding so the snapshot lands in the stream.
    let mut output = service.hydrated_raw_stream(job).await;

    // The first resize also triggers the bind once the producer accepts it.
    let (cols, rows) = term::size();
    service.resize(job, cols, rows).await.context("initial resize failed")?;
    service.attach(job, true).await.context("failed to bind output stream")?;

    let guard = term::RawModeGuard::enter()?;
    let mut events = EventStream::new();

    let mut stdout = tokio::io::stdout();
    let mut lifecycle = tokio::time::interval(LIFECYCLE_POLL);
    let farewell = loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(bytes) => {
                    stdout.write_all(&bytes).await?;
                    stdout.flush().await?;
                }
                None => break "output stream closed",
            },
            event = events.next() => match event {
                Some(Ok(event)) => match term::classify(event) {
                    Some(Input::Detach) => break "detached",
                    Some(Input::Bytes(bytes)) => {
                        if let Err(e) = service.write(job, &bytes).await {
                            warn!(job, error = %e, "input lost");
                        }
                    }
                    Some(Input::Resize(c, r)) => {
                        debug!(cols = c, rows = r, "terminal resized");
                        if let Err(e) = service.resize(job, c, r).await {
                            warn!(job, error = %e, "resize failed");
                        }
                    }
                    None => {}
                },
                Some(Err(e)) => {
                    warn!("terminal event error: {e}");
                    break "terminal input failed";
                }
                None => break "terminal input closed",
            },
            _ = lifecycle.tick() => {
                let alive = service
                    .session(job)
                    .await
                    .is_some_and(|s| s.lifecycle.is_active());
                if !alive {
                    break "session ended";
                }
            }
        }
    };

    drop(events);
    service.detach(job).await;
    service.shutdown().await;
    drop(guard);
    info!(job, reason = farewell, "left terminal");
    eprintln!("\r\nptylink: {farewell} ({job})");
    Ok(())
}
