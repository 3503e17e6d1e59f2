//! Session orchestrator.
//!
//! Wires the installer, the mosh processes and both links together for one
//! role, runs them concurrently, and tears everything down in reverse start
//! order once the first task ends.
//!
//! Client role:
//!
//! ```text
//! mosh-client <-> LocalLoopbackLink (listen) <-> RelayLink <-> relay server
//! ```
//!
//! Server role:
//!
//! ```text
//! relay server <-> RelayLink <-> LocalLoopbackLink (dial) <-> mosh-server
//! ```

mod errors;

use std::fmt;
use std::io::Write as _;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use moshrelay_core::protocol::key_line;
use moshrelay_core::{ParseError, Role, SessionConfig};

use crate::channel::packet_channel;
use crate::error::SessionError;
use crate::install::{InstallError, InstallTarget, Installer};
use crate::link::{self, LinkError, LocalLoopbackLink, RelayLink};
use crate::session::{LocalSession, ProcessError, RemoteLauncher, RemoteSession, SessionBinary};
use crate::stopper::Teardown;

pub use errors::{Aggregator, Reporter, error_channel};

/// Lifecycle of one orchestrated session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    Installing,
    Starting,
    Running,
    ShuttingDown,
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Installing => "installing",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::ShuttingDown => "shutting down",
            Self::Terminated => "terminated",
        };
        f.write_str(s)
    }
}

/// Runs one session for the configured role.
#[derive(Debug)]
pub struct Orchestrator {
    config: SessionConfig,
    state: watch::Sender<SessionState>,
}

impl Orchestrator {
    pub fn new(config: SessionConfig) -> Self {
        let (state, _) = watch::channel(SessionState::Initializing);
        Self { config, state }
    }

    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn transition(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        info!(from = %previous, to = %next, "Session state");
    }

    /// Run the session until the local client exits, a component fails or
    /// `cancel` fires.
    ///
    /// Everything started is stopped before this returns. A run error takes
    /// precedence over a stop error; cancellation yields
    /// [`SessionError::Cancelled`].
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        self.config.validate()?;
        info!(role = %self.config.role, relay = %self.config.relay_addr, "Starting session");

        let session = cancel.child_token();
        let tracker = TaskTracker::new();
        let mut teardown = Teardown::new();

        let result = match self.config.role {
            Role::Client => self.run_client(&session, &tracker, &mut teardown).await,
            Role::Server => self.run_server(&session, &tracker, &mut teardown).await,
        };
        match &result {
            Ok(()) => info!("Session finished"),
            Err(e) if e.is_shutdown() => info!(reason = %e, "Session ending"),
            Err(e) => warn!(error = %e, "Session failed"),
        }

        self.transition(SessionState::ShuttingDown);
        let stopped = teardown.stop_all().await;
        session.cancel();
        tracker.close();
        tracker.wait().await;
        self.transition(SessionState::Terminated);

        result.and(stopped)
    }

    async fn run_client(
        &self,
        session: &CancellationToken,
        tracker: &TaskTracker,
        teardown: &mut Teardown,
    ) -> Result<(), SessionError> {
        let config = &self.config;
        self.transition(SessionState::Installing);
        let client = SessionBinary::new(&config.client_binary);
        self.ensure_compatible(&client, session).await?;

        self.transition(SessionState::Starting);
        let relay_addr = resolve_relay(&config.relay_addr).await?;
        // launcher, relay link, loopback link, mosh-client
        let (reporter, mut errors) = error_channel(4);

        let rendezvous_key = match &config.rendezvous_key {
            Some(key) => key.clone(),
            None => {
                self.launch_remote(session, tracker, teardown, &reporter, &mut errors)
                    .await?
            }
        };

        let (from_client_tx, from_client_rx) = packet_channel();
        let (to_client_tx, to_client_rx) = packet_channel();
        let relay = Arc::new(RelayLink::new(
            relay_addr,
            config.api_key.as_str(),
            rendezvous_key.as_str(),
            to_client_tx,
            from_client_rx,
        ));
        let loopback = Arc::new(LocalLoopbackLink::listener(from_client_tx, to_client_rx));

        info!(relay = %relay_addr, "Starting relay link");
        teardown.push(relay.clone());
        spawn_link(tracker, &reporter, "failed to connect to relay server", {
            let relay = Arc::clone(&relay);
            let session = session.clone();
            async move { relay.connect(&session).await }
        });

        info!("Starting local loopback link");
        teardown.push(loopback.clone());
        spawn_link(tracker, &reporter, "local loopback link failed", {
            let loopback = Arc::clone(&loopback);
            let session = session.clone();
            async move { loopback.run(&session).await }
        });

        let addr = tokio::select! {
            biased;
            outcome = errors.first(session) => return outcome,
            addr = loopback.wait_bound(config.ready_poll_interval, session) => addr,
        };
        let addr = addr.ok_or(SessionError::Cancelled)?;

        info!(%addr, "Starting mosh client");
        let client = Arc::new(LocalSession::new(
            &config.client_binary,
            rendezvous_key,
            addr,
        ));
        teardown.push(client.clone());
        tracker.spawn({
            let reporter = reporter.clone();
            async move {
                let outcome = client
                    .start()
                    .await
                    .map_err(|e| SessionError::process("mosh client failed", e));
                reporter.report(outcome);
            }
        });

        self.transition(SessionState::Running);
        errors.first(session).await
    }

    /// Start the launcher and wait for the rendezvous key it prints.
    async fn launch_remote(
        &self,
        session: &CancellationToken,
        tracker: &TaskTracker,
        teardown: &mut Teardown,
        reporter: &Reporter,
        errors: &mut Aggregator,
    ) -> Result<String, SessionError> {
        let launcher = RemoteLauncher::from_config(&self.config).map_err(|source| {
            SessionError::process(
                "failed to start remote launcher",
                ProcessError::Spawn {
                    program: "current executable".into(),
                    source,
                },
            )
        })?;
        let launcher = Arc::new(launcher);
        info!(program = %launcher.program(), "Starting remote launcher");

        let (key_tx, key_rx) = oneshot::channel();
        teardown.push(launcher.clone());
        tracker.spawn({
            let reporter = reporter.clone();
            async move {
                match launcher.run(key_tx).await {
                    Ok(()) => info!("Remote launcher finished"),
                    Err(ProcessError::Parse(e)) => reporter.report(Err(SessionError::Parse(e))),
                    Err(e) => reporter.report(Err(SessionError::process("remote launcher failed", e))),
                }
            }
        });

        tokio::select! {
            biased;
            outcome = errors.first(session) => Err(key_missing(outcome)),
            key = key_rx => match key {
                Ok(key) => Ok(key),
                // The launcher always reports when it ends without a key.
                Err(_) => Err(key_missing(errors.first(session).await)),
            },
        }
    }

    async fn run_server(
        &self,
        session: &CancellationToken,
        tracker: &TaskTracker,
        teardown: &mut Teardown,
    ) -> Result<(), SessionError> {
        let config = &self.config;
        self.transition(SessionState::Installing);
        let server = Arc::new(RemoteSession::new(&config.server_binary));
        self.ensure_compatible(server.as_ref(), session).await?;

        self.transition(SessionState::Starting);
        info!("Starting mosh server");
        teardown.push(server.clone());
        server.run(session).await.map_err(|e| match e {
            ProcessError::Cancelled { .. } => SessionError::Cancelled,
            e => SessionError::process("failed to start mosh server", e),
        })?;
        let details = server.connection_details()?;
        info!(port = details.port, "Mosh server ready");
        publish_key(&details.rendezvous_key)?;

        let relay_addr = resolve_relay(&config.relay_addr).await?;
        // relay link, loopback link
        let (reporter, mut errors) = error_channel(2);
        let (from_server_tx, from_server_rx) = packet_channel();
        let (to_server_tx, to_server_rx) = packet_channel();

        let relay = Arc::new(RelayLink::new(
            relay_addr,
            config.api_key.as_str(),
            details.rendezvous_key.as_str(),
            to_server_tx,
            from_server_rx,
        ));
        info!(relay = %relay_addr, "Starting relay link");
        teardown.push(relay.clone());
        spawn_link(tracker, &reporter, "failed to connect to relay server", {
            let session = session.clone();
            async move { relay.connect(&session).await }
        });

        let loopback = Arc::new(LocalLoopbackLink::dialer(
            details.port,
            from_server_tx,
            to_server_rx,
        ));
        info!(port = details.port, "Starting local loopback link");
        teardown.push(loopback.clone());
        spawn_link(tracker, &reporter, "local loopback link failed", {
            let session = session.clone();
            async move { loopback.run(&session).await }
        });

        self.transition(SessionState::Running);
        errors.first(session).await
    }

    async fn ensure_compatible<T: InstallTarget>(
        &self,
        target: &T,
        cancel: &CancellationToken,
    ) -> Result<(), SessionError> {
        info!(binary = %target.name(), "Ensuring compatibility");
        let installer = Installer::new(target, &self.config.install);
        match installer.ensure_compatible(cancel).await {
            Ok(outcome) => {
                info!(binary = %target.name(), ?outcome, "Compatible");
                Ok(())
            }
            Err(InstallError::Cancelled) => Err(SessionError::Cancelled),
            Err(e) => Err(e.into()),
        }
    }
}

async fn resolve_relay(addr: &str) -> Result<SocketAddr, SessionError> {
    link::resolve(addr)
        .await
        .map_err(|e| SessionError::link("failed to resolve relay server", e))
}

/// Run a link on the tracker and report how it ended.
fn spawn_link<F>(tracker: &TaskTracker, reporter: &Reporter, stage: &'static str, link: F)
where
    F: Future<Output = Result<(), LinkError>> + Send + 'static,
{
    let reporter = reporter.clone();
    tracker.spawn(async move {
        reporter.report(link.await.map_err(|e| SessionError::link(stage, e)));
    });
}

/// The error to surface when no rendezvous key arrived.
fn key_missing(outcome: Result<(), SessionError>) -> SessionError {
    outcome
        .err()
        .unwrap_or(SessionError::Parse(ParseError::NoKeyFound))
}

/// Print the rendezvous key line for whoever launched the server role.
fn publish_key(rendezvous_key: &str) -> Result<(), SessionError> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", key_line(rendezvous_key))
        .and_then(|()| out.flush())
        .map_err(SessionError::Publish)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use moshrelay_core::ConfigError;

    use super::*;

    #[tokio::test]
    async fn missing_credentials_fail_before_anything_starts() {
        let orchestrator = Orchestrator::new(SessionConfig::new(Role::Client, "", "relay:7000"));
        let state = orchestrator.state();

        let err = orchestrator
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Config(ConfigError::Missing("API_KEY"))
        ));
        assert_eq!(*state.borrow(), SessionState::Initializing);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let mut config = SessionConfig::new(Role::Server, "api", "127.0.0.1:7000");
        config.server_binary = "moshrelay-no-such-server".into();
        let orchestrator = Orchestrator::new(config);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator.run(&cancel).await.unwrap_err();
        assert!(matches!(err, SessionError::Cancelled));
        assert_eq!(*orchestrator.state().borrow(), SessionState::Terminated);
    }

    #[test]
    fn state_names() {
        assert_eq!(SessionState::ShuttingDown.to_string(), "shutting down");
        assert_eq!(SessionState::Terminated.to_string(), "terminated");
    }
}
