//! Session-level error taxonomy.
//!
//! Component errors are wrapped with the stage that produced them before
//! they reach the orchestrator's caller.

use moshrelay_core::{ConfigError, ParseError};

use crate::install::InstallError;
use crate::link::LinkError;
use crate::session::ProcessError;

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Missing or malformed configuration; nothing was started.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Install, version detection or build failed; no link was opened.
    #[error("failed to ensure compatibility: {0}")]
    Compatibility(#[from] InstallError),

    #[error("{stage}: {source}")]
    Link {
        stage: &'static str,
        #[source]
        source: LinkError,
    },

    #[error("{stage}: {source}")]
    Process {
        stage: &'static str,
        #[source]
        source: ProcessError,
    },

    /// Malformed version string or rendezvous marker.
    #[error("failed to get connection details: {0}")]
    Parse(#[from] ParseError),

    #[error("failed to print rendezvous key: {0}")]
    Publish(#[source] std::io::Error),

    /// The root cancellation signal fired.
    #[error("session cancelled")]
    Cancelled,
}

impl SessionError {
    pub const fn link(stage: &'static str, source: LinkError) -> Self {
        Self::Link { stage, source }
    }

    pub const fn process(stage: &'static str, source: ProcessError) -> Self {
        Self::Process { stage, source }
    }

    /// Errors that are the normal consequence of shutting down.
    pub const fn is_shutdown(&self) -> bool {
        matches!(
            self,
            Self::Cancelled
                | Self::Link {
                    source: LinkError::Closed,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_is_prefixed() {
        let err = SessionError::link("failed to connect to relay server", LinkError::Closed);
        assert_eq!(
            err.to_string(),
            "failed to connect to relay server: link closed"
        );
    }

    #[test]
    fn shutdown_errors() {
        assert!(SessionError::Cancelled.is_shutdown());
        assert!(SessionError::link("x", LinkError::Closed).is_shutdown());
        assert!(!SessionError::link("x", LinkError::NoPeer).is_shutdown());
        assert!(!SessionError::Parse(ParseError::NoKeyFound).is_shutdown());
    }
}
