//! chargen-server: a Character Generator Protocol (RFC 864) server
//!
//! Every accepted connection receives an endless stream of 72-character
//! lines drawn from the 95 printable ASCII characters, each line rotated
//! one position from the previous one, until the peer disconnects.
//!
//! Features:
//! - Fixed connection capacity with first-fit slot admission
//! - Send-buffer-gated emission, one line per acknowledgement or poll
//! - mio reactor or Tokio message-passing transport
//! - Periodic connection status report
//! - Configuration via CLI arguments or TOML file

mod config;
mod flow;
mod pattern;
mod runtime;
mod slots;
mod status;

use config::{Config, RuntimeType};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_connections = config.max_connections,
        runtime = ?config.runtime,
        poll_interval_ms = config.poll_interval_ms,
        status_interval = config.status_interval,
        "Starting chargen server"
    );

    match config.runtime {
        RuntimeType::Mio => run_mio(config),
        RuntimeType::Tokio => run_tokio(config),
    }
}

/// Run with mio runtime (epoll on Linux, kqueue on macOS)
fn run_mio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using mio runtime (epoll/kqueue)");
    runtime::run_mio(config)?;
    Ok(())
}

/// Run with Tokio runtime (message-passing engine task)
fn run_tokio(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!("Using tokio runtime (message passing)");
    runtime::run_tokio(config)?;
    Ok(())
}
