//! Monitor Error Types
//!
//! Two layers of failure are distinguished:
//!
//! - [`SampleError`]: the outcome of a single read of one process. Two of its
//!   classes are routine (the process is gone, or its metrics are not
//!   readable right now); only [`SampleError::Unexpected`] is fatal.
//! - [`MonitorError`]: a failure of the whole run, propagated to the caller.

use std::io;

use thiserror::Error;

/// Failure of one metrics read for one process.
#[derive(Error, Debug)]
pub enum SampleError {
    /// The process no longer exists (or is a zombie awaiting its parent).
    #[error("process {pid} no longer exists")]
    NotFound { pid: u32 },

    /// The process exists but its metrics cannot be read by this user.
    #[error("permission denied reading metrics of process {pid}")]
    PermissionDenied { pid: u32 },

    /// Anything else; the run cannot trust its data anymore.
    #[error("unexpected failure reading process {pid}: {message}")]
    Unexpected { pid: u32, message: String },
}

impl SampleError {
    /// Creates an unexpected error from any displayable cause.
    pub fn unexpected<S: ToString>(pid: u32, cause: S) -> Self {
        SampleError::Unexpected {
            pid,
            message: cause.to_string(),
        }
    }

    /// Returns the pid the failed read was about.
    pub fn pid(&self) -> u32 {
        match self {
            SampleError::NotFound { pid }
            | SampleError::PermissionDenied { pid }
            | SampleError::Unexpected { pid, .. } => *pid,
        }
    }
}

/// Fatal failure of a monitored run.
#[derive(Error, Debug)]
pub enum MonitorError {
    #[error("cannot run an empty command")]
    EmptyCommand,

    #[error("sampling interval must be strictly positive")]
    InvalidInterval,

    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("failed waiting for the root process: {0}")]
    Wait(#[source] io::Error),

    #[error("resource accounting unavailable: {0}")]
    Accounting(#[source] io::Error),

    #[error("sampling failed: {0}")]
    Sampling(#[from] SampleError),
}

/// Result type alias for monitored runs.
pub type Result<T> = std::result::Result<T, MonitorError>;
