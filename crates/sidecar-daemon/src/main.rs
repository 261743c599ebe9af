//! Sidecar Daemon
//!
//! Serves a WebSocket endpoint for a UI process and runs agent backends on
//! its behalf. Prints a single `SIDECAR_READY port=<n>` line on stdout once
//! the listener is bound; all logging goes to stderr.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use sidecar_core::ConfigStore;
use sidecar_core::config::default_settings_path;
use sidecar_daemon::agent::{AgentLoader, ProcessAgentLoader};
use sidecar_daemon::relay::{DEFAULT_DRAIN_LIMIT, RelayConfig};
use sidecar_daemon::server::{self, AppState};
use sidecar_daemon::shared::{WorkingDirectory, shared_config};

#[derive(Parser, Debug)]
#[command(name = "sidecar-daemon")]
#[command(version, about = "Sidecar daemon - relays agent backends to a WebSocket client")]
struct Args {
    /// TCP port to listen on (0 picks a free port)
    #[arg(long, default_value_t = 0, env = "SIDECAR_PORT")]
    port: u16,

    /// Bind address
    #[arg(long, default_value = "127.0.0.1", env = "SIDECAR_HOST")]
    host: String,

    /// Settings file path
    #[arg(long, env = "SIDECAR_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "SIDECAR_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "SIDECAR_LOG_JSON")]
    log_json: bool,

    /// Agent backend executable, overriding the settings file
    #[arg(long, env = "SIDECAR_AGENT_BIN")]
    agent_bin: Option<PathBuf>,

    /// Seconds an interaction waits for the client before its default reply
    #[arg(long, default_value_t = 300, env = "SIDECAR_REPLY_TIMEOUT")]
    reply_timeout: u64,

    /// Events still forwarded after a turn ends
    #[arg(long, default_value_t = DEFAULT_DRAIN_LIMIT, env = "SIDECAR_DRAIN_LIMIT")]
    drain_limit: usize,

    /// Initial working directory for agent backends (defaults to the current directory)
    #[arg(long, env = "SIDECAR_WORKDIR")]
    workdir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = format!("sidecar_daemon={0},sidecar_core={0}", args.log_level);
    sidecar_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let config_path = match args.config {
        Some(path) => path,
        None => default_settings_path()
            .ok_or_else(|| anyhow::anyhow!("Cannot determine config directory"))?,
    };
    let mut store = ConfigStore::load(&config_path)?;
    if let Some(bin) = args.agent_bin {
        let mut settings = store.settings().clone();
        settings.backend.program = bin;
        store = ConfigStore::with_settings(config_path.clone(), settings);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        agent = %store.settings().agent.default_agent,
        backend = %store.settings().backend.program.display(),
        "Starting sidecar-daemon"
    );

    let workdir = match args.workdir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let working_dir = WorkingDirectory::new(workdir);
    let config = shared_config(store);
    let loader: Arc<dyn AgentLoader> = Arc::new(ProcessAgentLoader::new(
        config.clone(),
        working_dir.clone(),
    ));
    let relay = RelayConfig {
        reply_timeout: Duration::from_secs(args.reply_timeout),
        drain_limit: args.drain_limit,
    };
    let state = AppState::new(config, working_dir, loader, relay)?;

    let listener = TcpListener::bind((args.host.as_str(), args.port)).await?;
    let port = listener.local_addr()?.port();

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut server_handle = tokio::spawn(server::serve(listener, state, shutdown_rx));

    announce_ready(port);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    info!(port, "Sidecar daemon ready");

    tokio::select! {
        result = &mut server_handle => {
            result??;
            info!("Server exited");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    server_handle.await??;

    info!("Daemon stopped");
    Ok(())
}

/// The parent process parses this exact line.
#[allow(clippy::print_stdout)]
fn announce_ready(port: u16) {
    println!("SIDECAR_READY port={port}");
}
