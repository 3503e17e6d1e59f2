//! Compatibility installer for the pinned mosh release.
//!
//! Makes sure a mosh binary exists at exactly the required version. When it
//! is missing or reports any other version, the release tarball is
//! downloaded, unpacked and built from source.

mod archive;
mod build;
mod fetch;

use std::future::Future;
use std::path::Path;

use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use moshrelay_core::InstallConfig;

use crate::session::ProcessError;

pub use archive::extract_tarball;
pub use build::run_build_steps;
pub use fetch::{HttpFetcher, ReleaseFetcher};

/// Something the installer can check and, if needed, replace.
pub trait InstallTarget: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> String;

    fn is_installed(&self) -> bool;

    fn detect_version(&self) -> impl Future<Output = Result<Version, ProcessError>> + Send;
}

/// Installer failures. All of them abort the session before any link opens.
#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("failed to get process version: {0}")]
    Probe(#[source] ProcessError),

    #[error("invalid mosh version requirement {version:?}: {source}")]
    Requirement {
        version: String,
        #[source]
        source: semver::Error,
    },

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },

    #[error("failed to download {url} with status: {status}")]
    DownloadStatus { url: String, status: u16 },

    #[error("failed to extract mosh download: {0}")]
    Extract(String),

    #[error("failed to run step {step} ({command}): {reason}")]
    Build {
        step: usize,
        command: String,
        reason: String,
    },

    #[error("I/O error during install: {0}")]
    Io(#[from] std::io::Error),

    #[error("install cancelled")]
    Cancelled,
}

/// What `ensure_compatible` had to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallOutcome {
    /// The installed binary already matches the pinned version.
    AlreadyCompatible,
    /// A build from source was performed.
    Installed { previous: Option<Version> },
}

/// Ensures one [`InstallTarget`] is present at the pinned version.
pub struct Installer<'a, T, F = HttpFetcher> {
    target: &'a T,
    config: &'a InstallConfig,
    fetcher: F,
}

impl<'a, T: InstallTarget> Installer<'a, T, HttpFetcher> {
    pub fn new(target: &'a T, config: &'a InstallConfig) -> Self {
        Self {
            target,
            config,
            fetcher: HttpFetcher::new(),
        }
    }
}

impl<'a, T: InstallTarget, F: ReleaseFetcher> Installer<'a, T, F> {
    pub const fn with_fetcher(target: &'a T, config: &'a InstallConfig, fetcher: F) -> Self {
        Self {
            target,
            config,
            fetcher,
        }
    }

    /// Install the pinned release unless the target already reports exactly
    /// that version.
    pub async fn ensure_compatible(
        &self,
        cancel: &CancellationToken,
    ) -> Result<InstallOutcome, InstallError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(InstallError::Cancelled),
            result = self.ensure() => result,
        }
    }

    async fn ensure(&self) -> Result<InstallOutcome, InstallError> {
        let required =
            Version::parse(&self.config.version).map_err(|source| InstallError::Requirement {
                version: self.config.version.clone(),
                source,
            })?;

        if !self.target.is_installed() {
            info!(target = %self.target.name(), %required, "Not installed, installing");
            self.install().await?;
            return Ok(InstallOutcome::Installed { previous: None });
        }

        let installed = self
            .target
            .detect_version()
            .await
            .map_err(InstallError::Probe)?;
        if installed == required {
            info!(target = %self.target.name(), version = %installed, "Already compatible");
            return Ok(InstallOutcome::AlreadyCompatible);
        }

        info!(
            target = %self.target.name(),
            %installed,
            %required,
            "Version mismatch, installing"
        );
        self.install().await?;
        Ok(InstallOutcome::Installed {
            previous: Some(installed),
        })
    }

    /// Download, extract and build the release. The temporary directory
    /// holding the tarball and the source tree is removed on every path.
    async fn install(&self) -> Result<(), InstallError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("moshrelay-install-");
        let work = match &self.config.work_dir {
            Some(dir) => builder.tempdir_in(dir)?,
            None => builder.tempdir()?,
        };

        let result = self.install_in(work.path()).await;

        let path = work.path().to_path_buf();
        if let Err(e) = work.close() {
            warn!(path = %path.display(), error = %e, "Failed to remove install directory");
        }
        result
    }

    async fn install_in(&self, work: &Path) -> Result<(), InstallError> {
        let url = self.config.download_url();
        info!(url = %url, "Downloading release");
        let bytes = self.fetcher.fetch(&url).await?;

        let tarball = work.join(self.config.tarball_name());
        tokio::fs::write(&tarball, &bytes).await?;

        let extract_to = work.to_path_buf();
        let source_dir = extract_to.join(self.config.package_name());
        tokio::task::spawn_blocking(move || extract_tarball(&tarball, &extract_to))
            .await
            .map_err(|e| InstallError::Extract(e.to_string()))??;
        if !source_dir.is_dir() {
            return Err(InstallError::Extract(format!(
                "archive does not contain {}",
                self.config.package_name()
            )));
        }

        info!(dir = %source_dir.display(), "Building release");
        run_build_steps(&source_dir, &self.config.build_steps).await
    }
}
