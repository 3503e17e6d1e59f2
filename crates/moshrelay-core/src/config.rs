//! Configuration resolution for `moshrelay`.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (`~/.config/moshrelay/settings.json` or an explicit path)
//! 3. Environment variables
//! 4. CLI arguments (highest priority)
//!
//! Steps 3 and 4 are applied by the binary on top of [`SessionConfig`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::protocol::{CLIENT_BINARY, REQUIRED_VERSION, SERVER_BINARY};

/// Which side of the relay this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Runs `mosh-client` locally and reaches the server through the relay.
    #[default]
    Client,
    /// Runs `mosh-server` locally and publishes its rendezvous key.
    Server,
}

impl FromStr for Role {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Self::Client),
            "server" => Ok(Self::Server),
            other => Err(ConfigError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Where and how the mosh release is fetched and built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallConfig {
    /// Base URL release archives are published under.
    pub release_base_url: String,
    /// Archive and directory name prefix (`mosh` in `mosh-1.4.0.tar.gz`).
    pub package_prefix: String,
    /// Version to install.
    pub version: String,
    /// Commands run in order inside the extracted source tree.
    pub build_steps: Vec<Vec<String>>,
    /// Parent directory for temporary download and extraction directories.
    /// `None` uses the system temp directory.
    pub work_dir: Option<PathBuf>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            release_base_url: "https://github.com/mobile-shell/mosh/releases/download".to_string(),
            package_prefix: "mosh".to_string(),
            version: REQUIRED_VERSION.to_string(),
            build_steps: vec![
                vec!["./configure".to_string()],
                vec!["make".to_string()],
                vec!["make".to_string(), "install".to_string()],
            ],
            work_dir: None,
        }
    }
}

impl InstallConfig {
    /// `mosh-1.4.0`: release tag and top-level directory of the archive.
    pub fn package_name(&self) -> String {
        format!("{}-{}", self.package_prefix, self.version)
    }

    /// `mosh-1.4.0.tar.gz`
    pub fn tarball_name(&self) -> String {
        format!("{}.tar.gz", self.package_name())
    }

    pub fn download_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.release_base_url.trim_end_matches('/'),
            self.package_name(),
            self.tarball_name()
        )
    }
}

/// Command that starts the server role on the remote host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LauncherConfig {
    /// Split a `program arg...` list; `None` when empty.
    pub fn from_parts(parts: &[String]) -> Option<Self> {
        let (program, args) = parts.split_first()?;
        Some(Self {
            program: PathBuf::from(program),
            args: args.to_vec(),
        })
    }
}

/// Optional settings file contents. Every field overrides a built-in default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub release_base_url: Option<String>,
    pub package_prefix: Option<String>,
    pub build_steps: Option<Vec<Vec<String>>>,
    pub work_dir: Option<PathBuf>,
    pub client_binary: Option<PathBuf>,
    pub server_binary: Option<PathBuf>,
    pub launcher: Option<Vec<String>>,
    pub log_level: Option<String>,
    pub log_json: Option<bool>,
    pub ready_poll_interval_ms: Option<u64>,
}

impl Settings {
    /// Default settings path: `~/.config/moshrelay/settings.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("moshrelay").join("settings.json"))
    }

    /// Load settings from an explicit path. The file must exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file_error = |reason: String| ConfigError::File {
            path: path.display().to_string(),
            reason,
        };
        let content = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| file_error(e.to_string()))
    }

    /// Load settings from the default path, falling back to defaults when
    /// the file does not exist.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

/// Everything the orchestrator needs to run one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub role: Role,
    /// Credential for the relay announce datagram.
    pub api_key: String,
    /// Relay server `host:port`.
    pub relay_addr: String,
    /// Pre-shared rendezvous key (client role). When absent the key is read
    /// from the launcher's output.
    pub rendezvous_key: Option<String>,
    pub client_binary: PathBuf,
    pub server_binary: PathBuf,
    pub install: InstallConfig,
    /// Overrides the default launcher (this executable in server role).
    pub launcher: Option<LauncherConfig>,
    /// How often the client role checks whether the loopback link is bound.
    pub ready_poll_interval: Duration,
}

impl SessionConfig {
    pub fn new(role: Role, api_key: impl Into<String>, relay_addr: impl Into<String>) -> Self {
        Self {
            role,
            api_key: api_key.into(),
            relay_addr: relay_addr.into(),
            rendezvous_key: None,
            client_binary: PathBuf::from(CLIENT_BINARY),
            server_binary: PathBuf::from(SERVER_BINARY),
            install: InstallConfig::default(),
            launcher: None,
            ready_poll_interval: Duration::from_millis(50),
        }
    }

    /// Layer a settings file over the built-in defaults.
    pub fn apply_settings(&mut self, settings: Settings) {
        if let Some(url) = settings.release_base_url {
            self.install.release_base_url = url;
        }
        if let Some(prefix) = settings.package_prefix {
            self.install.package_prefix = prefix;
        }
        if let Some(steps) = settings.build_steps {
            self.install.build_steps = steps;
        }
        if settings.work_dir.is_some() {
            self.install.work_dir = settings.work_dir;
        }
        if let Some(bin) = settings.client_binary {
            self.client_binary = bin;
        }
        if let Some(bin) = settings.server_binary {
            self.server_binary = bin;
        }
        if let Some(launcher) = settings.launcher.as_deref().and_then(LauncherConfig::from_parts) {
            self.launcher = Some(launcher);
        }
        if let Some(ms) = settings.ready_poll_interval_ms {
            self.ready_poll_interval = Duration::from_millis(ms.max(1));
        }
    }

    /// Check required credentials and addresses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("API_KEY"));
        }
        if self.relay_addr.trim().is_empty() {
            return Err(ConfigError::Missing("REMOTE_ADDR"));
        }
        validate_host_port(&self.relay_addr)?;
        if self
            .rendezvous_key
            .as_deref()
            .is_some_and(|k| k.trim().is_empty())
        {
            return Err(ConfigError::Missing("MOSH_KEY"));
        }
        Ok(())
    }
}

fn validate_host_port(addr: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    };
    let (host, port) = addr.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>().map_err(|_| invalid("invalid port"))?;
    Ok(())
}
