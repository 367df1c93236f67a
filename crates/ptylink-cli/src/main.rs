//! ptylink: attach to remote PTY sessions through a relay.
//!
//! Opens or reattaches a job's terminal on a producer device, streams its
//! output to the local terminal and forwards keystrokes and resizes back.

mod commands;
mod config;
mod terminal;

use clap::{Parser, Subcommand};
use tracing::error;

/// ptylink: remote PTY client
#[derive(Parser)]
#[command(name = "ptylink", version = "0.1.0", about = "Attach to remote PTY sessions through a relay")]
struct Cli {
    /// Relay WebSocket URL (overrides the config file)
    #[arg(short, long, global = true)]
    relay: Option<String>,

    /// Producer device id (overrides the config file)
    #[arg(short, long, global = true)]
    device: Option<String>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<String>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach to a job's terminal, starting it if needed
    Attach {
        /// Job identifier
        job: String,
        /// Fail instead of starting a stopped session
        #[arg(long)]
        no_autostart: bool,
    },

    /// List sessions known to the producer
    Sessions,

    /// Terminate a job's terminal
    Kill {
        /// Job identifier
        job: String,
    },

    /// Send text to a job's terminal
    Send {
        /// Job identifier
        job: String,
        /// Text to type into the terminal
        text: String,
        /// Do not press Enter after the text
        #[arg(long)]
        no_enter: bool,
    },

    /// Show locally persisted terminal bindings
    Bindings {
        /// Remove every stored binding
        #[arg(long)]
        clear: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "ptylink_client=debug,ptylink_core=debug,ptylink=debug"
    } else {
        "ptylink_client=warn,ptylink_core=warn,ptylink=warn"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(|| {
        dirs::home_dir()
            .map(|h| h.join(".ptylink").join("config.toml"))
            .unwrap_or_default()
            .to_string_lossy()
            .into_owned()
    });
    let mut cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ptylink: {e:#}");
            std::process::exit(1);
        }
    };
    if let Some(url) = cli.relay {
        cfg.relay.url = url;
    }
    if let Some(device) = cli.device {
        cfg.relay.device_id = Some(device);
    }

    let result = match cli.command {
        Command::Attach { job, no_autostart } => {
            commands::attach::run(&cfg, &job, !no_autostart).await
        }
        Command::Sessions => commands::sessions::run(&cfg).await,
        Command::Kill { job } => commands::kill::run(&cfg, &job).await,
        Command::Send { job, text, no_enter } => {
            commands::send::run(&cfg, &job, &text, !no_enter).await
        }
        Command::Bindings { clear } => commands::bindings::run(&cfg, clear).await,
    };

    if let Err(e) = result {
        error!("{:#}", e);
        eprintln!("ptylink: {e:#}");
        std::process::exit(1);
    }
}
