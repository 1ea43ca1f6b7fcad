//! Backend Contract and Platform Probing
//!
//! Every backend implements [`AioBackend`]: prepare control blocks without
//! syscalls, drain the pending queue into the OS in batches without
//! blocking, retrieve completions on wake-ups without starving, and race
//! cancellation safely against in-flight completions. Construction maps
//! the contract's `init` to each backend's `new` (which must leave no
//! partial resource allocation behind on failure) and `dealloc` to `Drop`
//! plus [`AioBackend::detach`] for reactor-side deregistration.
//!
//! [`create_native_backend`] picks the best implementation the platform
//! and the host reactor's capabilities allow:
//!
//! - Linux: kernel-native AIO, falling back to signal-driven POSIX AIO
//!   if the kernel context cannot be created.
//! - Other Unix: readiness-multiplexed POSIX AIO when the reactor
//!   supports per-operation completion filters, else signal-driven.
//!
//! Any richer selection policy belongs to the host.

use std::io;
use std::os::unix::io::RawFd;

use crate::config::AioConfig;
use crate::error::{InitError, SubmitError};
use crate::queue::AioQueues;
use crate::reactor::ReactorHandle;
use crate::request::{AioHandle, AioRequestId};

#[cfg(target_os = "linux")]
pub(crate) mod kernel;
#[cfg(unix)]
pub(crate) mod posix_readiness;
#[cfg(unix)]
pub(crate) mod posix_signal;

#[cfg(target_os = "linux")]
pub use kernel::KernelAio;
#[cfg(unix)]
pub use posix_readiness::PosixReadinessAio;
#[cfg(unix)]
pub use posix_signal::PosixSignalAio;

/// Why a drain pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// The backend's notification descriptor became readable.
    Notification,
    /// The completion signal was delivered (already deferred to the
    /// reactor's control flow).
    Signal,
    /// A per-operation completion filter fired for this request.
    Operation(AioRequestId),
}

/// One asynchronous disk I/O backend bound to a reactor instance.
pub trait AioBackend: Send {
    /// Human-readable backend name.
    fn name(&self) -> &'static str;

    /// Whether this backend owns a dedicated notification channel
    /// (descriptor or signal) the reactor must route back into the
    /// driver, as opposed to completions arriving through the reactor's
    /// existing readiness demultiplexer.
    fn need_direct_notification(&self) -> bool;

    /// Maximum operations handed to the OS per submission call.
    fn capacity(&self) -> usize;

    /// Populate the request's control block for a read. Performs no
    /// syscalls; calling it again before submission simply overwrites
    /// the block.
    fn prepare_read(
        &mut self,
        req: &AioHandle,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: i64,
        priority: i32,
    );

    /// Populate the request's control block for a write. Same contract
    /// as [`prepare_read`](Self::prepare_read).
    fn prepare_write(
        &mut self,
        req: &AioHandle,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: i64,
        priority: i32,
    );

    /// Drain the pending queue into the OS in batches of at most
    /// [`capacity`](Self::capacity), looping until the queue is empty or
    /// the OS reports backpressure. Never blocks; on backpressure the
    /// remainder stays pending for the next reactor pass.
    fn submit(
        &mut self,
        queues: &mut AioQueues,
        reactor: &mut dyn ReactorHandle,
    ) -> Result<(), SubmitError>;

    /// Best-effort cancellation. Pending requests are withdrawn without
    /// an OS call; submitted requests race the OS cancel primitive, and
    /// the OS call's own outcome decides which finalize path runs.
    fn cancel(&mut self, queues: &mut AioQueues, req: &AioHandle) -> io::Result<()>;

    /// Retrieve and finalize completions for one wake-up. Always
    /// non-blocking; drains any backlog larger than one retrieval call
    /// before returning. Returns the number of operations finalized.
    fn drain(&mut self, queues: &mut AioQueues, wake: Wake) -> io::Result<usize>;

    /// Deregister this backend's notification sources from the reactor.
    fn detach(&mut self, reactor: &mut dyn ReactorHandle);
}

/// Create the best available backend for this platform and reactor.
#[allow(unused_variables)]
pub fn create_native_backend(
    config: &AioConfig,
    reactor: &dyn ReactorHandle,
) -> Result<Box<dyn AioBackend>, InitError> {
    #[cfg(target_os = "linux")]
    {
        match KernelAio::new(config) {
            Ok(backend) => return Ok(Box::new(backend)),
            Err(e) => {
                tracing::warn!(error = %e, "kernel aio unavailable, falling back to posix aio");
            }
        }
    }

    #[cfg(unix)]
    {
        if reactor.supports_completion_filters() {
            return Ok(Box::new(PosixReadinessAio::new(config)?));
        }
        return Ok(Box::new(PosixSignalAio::new(config)?));
    }

    #[cfg(not(unix))]
    {
        Err(InitError::Unsupported)
    }
}
