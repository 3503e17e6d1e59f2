//! Logging setup for the `moshrelay` binary.
//!
//! Logs always go to stderr: stdout belongs to the mosh subprocesses and to
//! the rendezvous-key line other tooling reads.

use std::io;

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Crates whose events follow the configured level.
const LOG_TARGETS: [&str; 3] = ["moshrelay", "moshrelay_agent", "moshrelay_core"];

/// Filter directives enabling `level` for every moshrelay crate, e.g.
/// `moshrelay=info,moshrelay_agent=info,moshrelay_core=info`.
pub fn default_directives(level: &str) -> String {
    LOG_TARGETS
        .iter()
        .map(|target| format!("{target}={level}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Initialise the global tracing subscriber.
///
/// `RUST_LOG` wins when it is set and parses; otherwise `level` applies to
/// the moshrelay crates only. With `log_json` each event is one JSON line.
pub fn init_tracing(level: &str, log_json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(level)));

    let (plain, json) = if log_json {
        (None, Some(fmt::layer().json().with_writer(io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(io::stderr)), None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(plain)
        .with(json)
        .init();
}
