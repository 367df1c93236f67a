//! `ptylink send <job> <text>`: type text into a terminal without attaching.

use anyhow::{Context, Result};

use crate::config::Config;

pub async fn run(cfg: &Config, job: &str, text: &str, enter: bool) -> Result<()> {
    let service = super::connect(cfg).await?;
    service
        .ensure_session(job, true)
        .await
        .with_context(|| format!("no terminal for job '{job}'"))?;
    service
        .send_large_text(job, text, enter)
        .await
        .with_context(|| format!("failed to send input to '{job}'"))?;
    service.shutdown().await;
    Ok(())
}
