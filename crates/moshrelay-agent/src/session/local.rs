//! Local `mosh-client` process.

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use semver::Version;
use tokio::process::Command;
use tracing::info;

use moshrelay_core::protocol::RENDEZVOUS_ENV;

use super::binary::SessionBinary;
use super::error::ProcessError;
use super::handle::ProcessHandle;
use crate::error::SessionError;
use crate::install::InstallTarget;
use crate::stopper::Stopper;

/// Interactive `mosh-client` pointed at the local loopback link.
///
/// The client owns the terminal: it inherits stdin, stdout and stderr and
/// stays in our process group.
#[derive(Debug)]
pub struct LocalSession {
    binary: SessionBinary,
    rendezvous_key: String,
    server_addr: SocketAddr,
    handle: ProcessHandle,
}

impl LocalSession {
    pub fn new(program: impl Into<PathBuf>, rendezvous_key: String, server_addr: SocketAddr) -> Self {
        let binary = SessionBinary::new(program);
        let handle = ProcessHandle::single(binary.display_name());
        Self {
            binary,
            rendezvous_key,
            server_addr,
            handle,
        }
    }

    pub const fn binary(&self) -> &SessionBinary {
        &self.binary
    }

    /// Arguments passed after the program name: `<ip> <port>`.
    pub fn args(&self) -> [String; 2] {
        [
            self.server_addr.ip().to_string(),
            self.server_addr.port().to_string(),
        ]
    }

    /// Spawn `mosh-client <ip> <port>` with the key in `MOSH_KEY` and wait
    /// for it to exit. A non-zero exit is an error.
    pub async fn start(&self) -> Result<(), ProcessError> {
        let program = self.binary.display_name();
        let mut child = Command::new(self.binary.program())
            .args(self.args())
            .env(RENDEZVOUS_ENV, &self.rendezvous_key)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;
        self.handle.attach(child.id());
        info!(program = %program, pid = ?child.id(), addr = %self.server_addr, "Started mosh client");

        let status = child.wait().await;
        self.handle.reaped();
        let status = status.map_err(|source| ProcessError::Io {
            program: program.clone(),
            source,
        })?;

        info!(program = %program, %status, "Mosh client exited");
        if status.success() {
            Ok(())
        } else {
            Err(ProcessError::Exited { program, status })
        }
    }

    /// Terminate the client if it is still running.
    pub async fn stop(&self) -> Result<(), ProcessError> {
        self.handle.terminate().await
    }
}

impl InstallTarget for LocalSession {
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
impl Stopper for LocalSession {
    fn component(&self) -> &'static str {
        "mosh client"
    }

    async fn stop(&self) -> Result<(), SessionError> {
        Self::stop(self)
            .await
            .map_err(|e| SessionError::process("failed to stop mosh client", e))
    }
}
