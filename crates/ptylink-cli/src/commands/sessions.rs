//! `ptylink sessions`: list the producer's live terminals.

use anyhow::{Context, Result};

use crate::config::Config;

pub async fn run(cfg: &Config) -> Result<()> {
    let service = super::connect(cfg).await?;
    service
        .bootstrap_from_remote()
        .await
        .context("failed to list remote sessions")?;

    service.shutdown().await;

    let mut sessions = service.sessions().await;
    sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    println!("{:<24} {:<24} {:<20} {}", "SESSION", "JOB", "STATE", "CREATED");
    for s in &sessions {
        println!(
            "{:<24} {:<24} {:<20} {}",
            s.id,
            s.job_id,
            s.lifecycle.to_string(),
            s.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if sessions.is_empty() {
        println!("(no sessions)");
    }
    Ok(())
}
