//! `ptylink kill <job>`: terminate a job's remote PTY.

use anyhow::{Context, Result};
use tracing::info;

use crate::config::Config;

pub async fn run(cfg: &Config, job: &str) -> Result<()> {
    let service = super::connect(cfg).await?;
    service
        .ensure_session(job, false)
        .await
        .with_context(|| format!("no live terminal for job '{job}'"))?;
    service
        .kill(job)
        .await
        .with_context(|| format!("failed to kill terminal for job '{job}'"))?;
    service.shutdown().await;
    info!(job, "killed");
    println!("killed {job}");
    Ok(())
}
