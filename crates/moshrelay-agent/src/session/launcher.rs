//! Starts the server role and collects the rendezvous key it publishes.

use std::io::Write as _;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use moshrelay_core::config::LauncherConfig;
use moshrelay_core::protocol::parse_key_line;
use moshrelay_core::{ParseError, Role, SessionConfig};

use super::error::ProcessError;
use super::handle::ProcessHandle;
use crate::error::SessionError;
use crate::stopper::Stopper;

/// Process that runs the server role somewhere and prints `MOSH_KEY <key>`.
#[derive(Debug)]
pub struct RemoteLauncher {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    handle: ProcessHandle,
}

impl RemoteLauncher {
    pub fn new(launcher: LauncherConfig) -> Self {
        let handle = ProcessHandle::group(launcher.program.display().to_string());
        Self {
            program: launcher.program,
            args: launcher.args,
            envs: Vec::new(),
            handle,
        }
    }

    /// The configured launcher, or this executable re-run in server role
    /// with the session credentials in its environment.
    pub fn from_config(config: &SessionConfig) -> std::io::Result<Self> {
        if let Some(launcher) = &config.launcher {
            return Ok(Self::new(launcher.clone()));
        }
        let exe = std::env::current_exe()?;
        let launcher = Self::new(LauncherConfig {
            program: exe,
            args: vec!["--role".into(), Role::Server.to_string()],
        });
        Ok(launcher.with_env([
            ("API_KEY", config.api_key.as_str()),
            ("REMOTE_ADDR", config.relay_addr.as_str()),
            ("SERVER", "true"),
        ]))
    }

    #[must_use]
    pub fn with_env<'a>(mut self, vars: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        self.envs
            .extend(vars.into_iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    pub fn program(&self) -> String {
        self.program.display().to_string()
    }

    /// Run the launcher until it exits.
    ///
    /// Every output line is echoed to standard output. The first key line is
    /// sent on `key_tx`; if output ends without one the sender is dropped and
    /// a launcher that still exits cleanly fails with `NoKeyFound`.
    pub async fn run(&self, key_tx: oneshot::Sender<String>) -> Result<(), ProcessError> {
        let program = self.program();
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        self.handle.attach(child.id());
        info!(program = %program, pid = ?child.id(), "Started remote launcher");

        let io_err = |source: std::io::Error| ProcessError::Io {
            program: program.clone(),
            source,
        };
        let mut stdout = child.stdout.take().map(|s| BufReader::new(s).lines());
        let mut stderr = child.stderr.take().map(|s| BufReader::new(s).lines());
        let mut key_tx = Some(key_tx);

        while stdout.is_some() || stderr.is_some() {
            let (stream, line) = tokio::select! {
                line = next_line(stdout.as_mut()), if stdout.is_some() => (Stream::Stdout, line),
                line = next_line(stderr.as_mut()), if stderr.is_some() => (Stream::Stderr, line),
            };
            let Some(line) = line.map_err(io_err)? else {
                match stream {
                    Stream::Stdout => stdout = None,
                    Stream::Stderr => stderr = None,
                }
                continue;
            };
            echo(&line);
            if let Some(key) = parse_key_line(&line) {
                if let Some(tx) = key_tx.take() {
                    debug!(program = %program, "Received rendezvous key");
                    let _ = tx.send(key.to_string());
                }
            }
        }
        let delivered = key_tx.is_none();
        drop(key_tx);
        if !delivered {
            warn!(program = %program, "Launcher output ended without a key line");
        }

        let status = child.wait().await;
        self.handle.reaped();
        let status = status.map_err(io_err)?;
        info!(program = %program, %status, "Remote launcher exited");
        if !status.success() {
            return Err(ProcessError::Exited { program, status });
        }
        if !delivered {
            return Err(ParseError::NoKeyFound.into());
        }
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ProcessError> {
        self.handle.terminate().await
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

async fn next_line<R>(
    lines: Option<&mut tokio::io::Lines<R>>,
) -> std::io::Result<Option<String>>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => Ok(None),
    }
}

fn echo(line: &str) {
    let mut out = std::io::stdout().lock();
    if let Err(e) = writeln!(out, "{line}") {
        debug!(error = %e, "Failed to echo launcher output");
    }
}

#[async_trait]
impl Stopper for RemoteLauncher {
    fn component(&self) -> &'static str {
        "remote launcher"
    }

    async fn stop(&self) -> Result<(), SessionError> {
        Self::stop(self)
            .await
            .map_err(|e| SessionError::process("failed to stop remote launcher", e))
    }
}
