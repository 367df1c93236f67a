//! `ptylink bindings`: inspect the locally persisted job/terminal bindings.
//!
//! Works offline; reads the binding file directly.

use anyhow::{Context, Result};
use ptylink_client::{BindingStore, ContextKind};

use crate::config::Config;

pub async fn run(cfg: &Config, clear: bool) -> Result<()> {
    let store = cfg.binding_store()?;
    if clear {
        store.clear().context("failed to clear bindings")?;
        println!("cleared bindings in {}", store.path().display());
        return Ok(());
    }

    let mut bindings = store.load_all().context("failed to read bindings")?;
    bindings.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    println!("{:<24} {:<8} {:<24} {}", "SESSION", "KIND", "JOB", "CREATED");
    for b in &bindings {
        let kind = match b.context {
            ContextKind::Job => "job",
            ContextKind::Plan => "plan",
            ContextKind::Adhoc => "adhoc",
        };
        println!(
            "{:<24} {:<8} {:<24} {}",
            b.terminal_session_id,
            kind,
            b.job_id.as_deref().unwrap_or("-"),
            b.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    if bindings.is_empty() {
        println!("(no bindings)");
    }
    Ok(())
}
