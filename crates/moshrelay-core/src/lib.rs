//! `moshrelay` Core Library
//!
//! Shared functionality for `moshrelay` components:
//! - Wire contract with the relay server and the mosh binaries
//! - Configuration resolution and validation
//! - Common error types
//! - Tracing initialisation

pub mod config;
pub mod error;
pub mod protocol;
pub mod tracing_init;

pub use config::{InstallConfig, LauncherConfig, Role, SessionConfig, Settings};
pub use error::{ConfigError, ParseError};
