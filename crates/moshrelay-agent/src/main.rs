//! moshrelay
//!
//! Runs one side of a mosh session relayed through a rendezvous server. The
//! client role runs `mosh-client` locally; the server role runs `mosh-server`
//! and prints the rendezvous key for the client side to pick up.

use std::path::PathBuf;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use moshrelay_agent::{Orchestrator, SessionError};
use moshrelay_core::config::LauncherConfig;
use moshrelay_core::{Role, SessionConfig, Settings};

#[derive(Parser, Debug)]
#[command(name = "moshrelay")]
#[command(version, about = "mosh over a UDP rendezvous relay")]
struct Args {
    /// Which side of the session to run
    #[arg(long, default_value = "client", env = "MOSHRELAY_ROLE")]
    role: Role,

    /// Shorthand for `--role server`
    #[arg(
        long,
        env = "SERVER",
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    server: bool,

    /// API key announced to the relay server
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Relay server address (`host:port`)
    #[arg(long, env = "REMOTE_ADDR")]
    relay_addr: Option<String>,

    /// Rendezvous key of an already running server role (client role only).
    /// When omitted the launcher is started to obtain one.
    #[arg(long, env = "MOSH_KEY", hide_env_values = true)]
    rendezvous_key: Option<String>,

    /// Settings file (defaults to `~/.config/moshrelay/settings.json`)
    #[arg(long, env = "MOSHRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, env = "MOSHRELAY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long, env = "MOSHRELAY_LOG_JSON")]
    log_json: bool,

    /// Path to `mosh-client`
    #[arg(long, env = "MOSHRELAY_CLIENT_BINARY")]
    client_binary: Option<PathBuf>,

    /// Path to `mosh-server`
    #[arg(long, env = "MOSHRELAY_SERVER_BINARY")]
    server_binary: Option<PathBuf>,

    /// Command that starts the server role and prints `MOSH_KEY <key>`
    /// (client role). Takes every remaining argument.
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    launcher: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::load_default()?,
    };

    let level = args
        .log_level
        .clone()
        .or_else(|| settings.log_level.take())
        .unwrap_or_else(|| "info".into());
    let log_json = args.log_json || settings.log_json.unwrap_or(false);
    moshrelay_core::tracing_init::init_tracing(&level, log_json);

    let role = if args.server { Role::Server } else { args.role };
    let mut config = SessionConfig::new(
        role,
        args.api_key.unwrap_or_default(),
        args.relay_addr.unwrap_or_default(),
    );
    config.apply_settings(settings);
    config.rendezvous_key = args.rendezvous_key;
    if let Some(bin) = args.client_binary {
        config.client_binary = bin;
    }
    if let Some(bin) = args.server_binary {
        config.server_binary = bin;
    }
    if let Some(launcher) = LauncherConfig::from_parts(&args.launcher) {
        config.launcher = Some(launcher);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        role = %config.role,
        "Starting moshrelay"
    );

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    match Orchestrator::new(config).run(&cancel).await {
        Ok(()) => Ok(()),
        Err(SessionError::Cancelled) => {
            info!("Session cancelled");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Cancel the session on Ctrl+C or SIGTERM.
async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl+C");
                return;
            }
            info!("Received Ctrl+C shutdown signal");
        }
        () = terminate => {
            info!("Received SIGTERM shutdown signal");
        }
    }
    cancel.cancel();
}
