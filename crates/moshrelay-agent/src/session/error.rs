//! Subprocess error types.

use std::process::ExitStatus;

use moshrelay_core::ParseError;

/// Errors from mosh and launcher subprocesses.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Exited { program: String, status: ExitStatus },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("process group {pid} still running after SIGKILL")]
    NotTerminated { pid: u32 },

    #[error("I/O error talking to {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid version output: {0}")]
    Parse(#[from] ParseError),

    #[error("cancelled while waiting for {program}")]
    Cancelled { program: String },
}
