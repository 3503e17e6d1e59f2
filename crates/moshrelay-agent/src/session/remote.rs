//! `mosh-server` process on the host being reached.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::OnceLock;

use async_trait::async_trait;
use semver::Version;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use moshrelay_core::ParseError;
use moshrelay_core::protocol::{ConnectDetails, parse_connect_details};

use super::binary::SessionBinary;
use super::error::ProcessError;
use super::handle::ProcessHandle;
use crate::error::SessionError;
use crate::install::InstallTarget;
use crate::stopper::Stopper;

/// `mosh-server`, run to completion of its startup phase.
///
/// `mosh-server` prints its port and key, forks a detached server and exits.
/// It is spawned as leader of a new process group so `stop` can reach the
/// forked server as long as it stays in that group.
#[derive(Debug)]
pub struct RemoteSession {
    binary: SessionBinary,
    args: Vec<String>,
    output: OnceLock<String>,
    handle: ProcessHandle,
}

impl RemoteSession {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        let binary = SessionBinary::new(program);
        let handle = ProcessHandle::group(binary.display_name());
        Self {
            binary,
            args: Vec::new(),
            output: OnceLock::new(),
            handle,
        }
    }

    /// Extra arguments for `mosh-server` (e.g. `new -p 60001`).
    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub const fn binary(&self) -> &SessionBinary {
        &self.binary
    }

    /// Run `mosh-server` and capture its combined output.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), ProcessError> {
        let program = self.binary.display_name();
        let mut cmd = Command::new(self.binary.program());
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: program.clone(),
            source,
        })?;
        self.handle.attach(child.id());
        info!(program = %program, pid = ?child.id(), "Started mosh server");

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Err(ProcessError::Cancelled { program });
            }
            output = child.wait_with_output() => output,
        };
        self.handle.reaped();
        let output = output.map_err(|source| ProcessError::Io {
            program: program.clone(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        debug!(program = %program, %stdout, %stderr, "Mosh server output");
        if !output.status.success() {
            return Err(ProcessError::Failed {
                program,
                status: output.status,
                stderr: stderr.trim().to_string(),
            });
        }

        let _ = self.output.set(format!("{stdout}{stderr}"));
        Ok(())
    }

    /// Output captured by [`run`](Self::run); empty before it completes.
    pub fn output(&self) -> &str {
        self.output.get().map_or("", String::as_str)
    }

    /// Port and rendezvous key from the `MOSH CONNECT` line.
    pub fn connection_details(&self) -> Result<ConnectDetails, ParseError> {
        parse_connect_details(self.output())
    }

    /// Terminate the process group: SIGTERM, verify, SIGKILL if needed.
    ///
    /// A server that called `setsid()` has left the group and is not reached.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        self.handle.terminate().await
    }
}

impl InstallTarget for RemoteSession {
    fn name(&self) -> String {
        self.binary.display_name()
    }

    fn is_installed(&self) -> bool {
        self.binary.is_installed()
    }

    async fn detect_version(&self) -> Result<Version, ProcessError> {
        self.binary.version().await
    }
}

#[async_trait]
impl Stopper for RemoteSession {
    fn component(&self) -> &'static str {
        "mosh server"
    }

    async fn stop(&self) -> Result<(), SessionError> {
        Self::stop(self)
            .await
            .map_err(|e| SessionError::process("failed to stop mosh server", e))
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn details_before_run_are_missing() {
        let session = RemoteSession::new("mosh-server");
        assert_eq!(session.connection_details(), Err(ParseError::NoKeyFound));
    }

    #[tokio::test]
    async fn stop_before_run_is_ok() {
        let session = RemoteSession::new("mosh-server");
        session.stop().await.unwrap();
        session.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn details_from_script_output() {
        let session = RemoteSession::new("sh").with_args(vec![
            "-c".into(),
            "echo; echo 'MOSH CONNECT 60004 s3cr3tKey'; echo 'mosh-server (mosh 1.4.0)' >&2".into(),
        ]);
        session.run(&CancellationToken::new()).await.unwrap();

        let details = session.connection_details().unwrap();
        assert_eq!(details.port, 60004);
        assert_eq!(details.rendezvous_key, "s3cr3tKey");
        assert!(session.output().contains("mosh-server (mosh 1.4.0)"));

        session.stop().await.unwrap();
        session.stop().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_without_marker() {
        let session =
            RemoteSession::new("sh").with_args(vec!["-c".into(), "echo starting".into()]);
        session.run(&CancellationToken::new()).await.unwrap();
        assert_eq!(session.connection_details(), Err(ParseError::NoKeyFound));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_numeric_port() {
        let session = RemoteSession::new("sh")
            .with_args(vec!["-c".into(), "echo 'MOSH CONNECT abc key'".into()]);
        session.run(&CancellationToken::new()).await.unwrap();
        assert!(matches!(
            session.connection_details(),
            Err(ParseError::InvalidPort { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_server_reports_cause() {
        let session = RemoteSession::new("sh")
            .with_args(vec!["-c".into(), "echo 'no ports' >&2; exit 1".into()]);
        let err = session.run(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ProcessError::Failed { ref stderr, .. } if stderr == "no ports"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_observes_cancellation() {
        let session = RemoteSession::new("sleep").with_args(vec!["30".into()]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            session.run(&cancel).await,
            Err(ProcessError::Cancelled { .. })
        ));
    }
}
