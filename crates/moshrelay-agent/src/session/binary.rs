//! Presence and version checks for a mosh binary.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use semver::Version;
use tokio::process::Command;
use tracing::debug;

use moshrelay_core::protocol::{VERSION_FLAG, parse_version_output};

use super::error::ProcessError;
use crate::install::InstallTarget;

/// A mosh executable, by name (looked up on `PATH`) or by path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinary {
    program: PathBuf,
}

impl SessionBinary {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn display_name(&self) -> String {
        self.program.display().to_string()
    }

    /// Resolve the executable the way `exec` would.
    pub fn locate(&self) -> Option<PathBuf> {
        if self.program.components().count() > 1 {
            return is_executable(&self.program).then(|| self.program.clone());
        }
        let path = std::env::var_os("PATH")?;
        std::env::split_paths(&path)
            .map(|dir| dir.join(&self.program))
            .find(|candidate| is_executable(candidate))
    }

    /// Run `<program> --version` and parse the reported version.
    pub async fn version(&self) -> Result<Version, ProcessError> {
        let program = self.display_name();
        debug!(program = %program, "Probing version");
        let output = Command::new(&self.program)
            .arg(VERSION_FLAG)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ProcessError::Spawn {
                program: program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(ProcessError::Failed {
                program,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(parse_version_output(&program, &stdout)?)
    }
}

impl InstallTarget for SessionBinary {
    fn name(&self) -> String {
        self.display_name()
    }

    fn is_installed(&self) -> bool {
        self.locate().is_some()
    }

    async fn detect_version(&self) -> Result<Version, ProcessError> {
        self.version().await
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
