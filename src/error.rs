//! Error Taxonomy
//!
//! Four failure classes cross this subsystem's boundaries:
//!
//! - [`InitError`]: a backend could not acquire a required OS resource.
//!   Never partial — a failed constructor releases everything it took.
//! - [`SubmitError`]: a batch submission call failed outright. OS
//!   backpressure is *not* an error; `submit` simply stops and leaves the
//!   remainder pending for the next reactor pass.
//! - [`RequestError`]: caller misuse detected before a request is enqueued.
//! - [`ConfigError`]: invalid configuration values (see [`crate::config`]).
//!
//! Per-operation failures never surface through these types: they always
//! arrive via the completion callback with `result = -1` and a populated
//! platform error code.

use std::io;

use thiserror::Error;

/// Backend initialization failure.
///
/// Non-fatal to the process: the reactor may fall back to another backend
/// or fail startup explicitly.
#[derive(Debug, Error)]
pub enum InitError {
    /// The kernel AIO context could not be created (`io_setup`).
    #[error("failed to create kernel aio context: {0}")]
    KernelSetup(#[source] io::Error),

    /// The completion notification descriptor could not be created.
    #[error("failed to create notification descriptor: {0}")]
    NotifyFd(#[source] io::Error),

    /// No asynchronous I/O backend is available on this platform.
    #[error("no asynchronous disk I/O backend available on this platform")]
    Unsupported,
}

/// Batch submission failure.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The OS accepted only a prefix of a submitted batch.
    ///
    /// There is no defined remainder policy for this condition; silently
    /// dropping the rejected tail would leak the caller's buffers and
    /// callbacks, so it is reported loudly instead. The accepted prefix
    /// has already been moved to the submitted registry.
    #[error("batch partially accepted: {accepted} of {attempted} operations")]
    PartialSubmit {
        /// Operations the OS accepted before stopping.
        accepted: usize,
        /// Operations handed to the OS in the batch.
        attempted: usize,
    },

    /// The submission syscall itself failed (not backpressure).
    #[error("batch submission failed: {0}")]
    Io(#[source] io::Error),
}

/// Caller misuse of the request-issuing entry points.
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request is still pending or in flight and cannot be reissued.
    #[error("request is not in a terminal state")]
    NotTerminal,

    /// No completion callback has been assigned to the request.
    #[error("request has no completion callback assigned")]
    NoCallback,

    /// A zero-length transfer was requested.
    #[error("zero-length transfer")]
    ZeroLength,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_submit_reports_counts() {
        let err = SubmitError::PartialSubmit {
            accepted: 3,
            attempted: 8,
        };
        let msg = err.to_string();
        assert!(msg.contains('3'));
        assert!(msg.contains('8'));
    }

    #[test]
    fn submit_io_carries_source() {
        let err = SubmitError::Io(io::Error::from_raw_os_error(libc::EINVAL));
        assert!(std::error::Error::source(&err).is_some());
    }
}
