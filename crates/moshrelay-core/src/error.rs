//! Error types for `moshrelay` core library.

use thiserror::Error;

/// Errors from parsing output of the mosh binaries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The version probe printed nothing.
    #[error("no output from {program} {flag}", flag = crate::protocol::VERSION_FLAG)]
    EmptyOutput { program: String },

    /// The first line of the version probe has fewer than three tokens.
    #[error("unexpected output from {program}: {line:?}")]
    TooFewTokens { program: String, line: String },

    /// The version token is not a semantic version.
    #[error("invalid version {token:?}: {reason}")]
    InvalidVersion { token: String, reason: String },

    /// No session-ready marker line was found.
    #[error("no mosh key found")]
    NoKeyFound,

    /// A marker line was found but lacks port and key tokens.
    #[error("malformed connect line: {0:?}")]
    MalformedMarker(String),

    /// The port token of the marker line is not a valid port number.
    #[error("invalid port {token:?}")]
    InvalidPort { token: String },
}

/// Configuration errors, surfaced before any task starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid role {0:?}, expected \"client\" or \"server\"")]
    InvalidRole(String),

    #[error("invalid address {addr:?}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to load settings from {path}: {reason}")]
    File { path: String, reason: String },
}
