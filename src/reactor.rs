//! Reactor Seam and Driver
//!
//! The host reactor stays external to this crate: its readiness loop,
//! timer heap, and signal plumbing are reached only through the
//! [`ReactorHandle`] trait, and everything the reactor needs to drive disk
//! I/O is bundled in one [`AioDriver`] per reactor instance.
//!
//! Control flow around one operation:
//!
//! ```text
//! caller ──read()──▶ pending FIFO ──submit()──▶ OS batch call
//!                                                   │
//!                     notification fd / signal / readiness filter
//!                                                   │
//! reactor ──on_notify()/on_signal()/on_op_ready()──▶ drain ──▶ activation
//! reactor ──dispatch()──▶ completion callbacks
//! ```
//!
//! Every method assumes the host reactor's serialization lock is already
//! held; nothing here blocks or takes internal locks beyond per-request
//! guards.

use std::io;
use std::os::unix::io::RawFd;

use tracing::debug;

use crate::backend::{create_native_backend, AioBackend, Wake};
use crate::config::AioConfig;
use crate::error::{InitError, RequestError, SubmitError};
use crate::queue::AioQueues;
use crate::request::{AioHandle, AioRequestId, OpKind};

/// The surface a host reactor exposes to the disk I/O backends.
///
/// Backends register their completion channels here and nothing else; the
/// reactor routes the resulting wake-ups back into the driver's
/// `on_notify`/`on_signal`/`on_op_ready` entry points on its own control
/// flow. In particular, signal delivery must never call back in from the
/// signal handler context — the handler schedules a deferred task that
/// calls [`AioDriver::on_signal`] from the normal event loop.
pub trait ReactorHandle {
    /// Start watching `fd` for readability, persistently. Fired wake-ups
    /// are routed to [`AioDriver::on_notify`].
    fn register_notify_fd(&mut self, fd: RawFd) -> io::Result<()>;

    /// Stop watching a notification descriptor.
    fn deregister_notify_fd(&mut self, fd: RawFd);

    /// Start watching for `signo`. Deliveries are routed (deferred) to
    /// [`AioDriver::on_signal`].
    fn register_signal(&mut self, signo: i32) -> io::Result<()>;

    /// Stop watching a completion signal.
    fn deregister_signal(&mut self, signo: i32);

    /// Whether this reactor's demultiplexer supports per-operation
    /// completion filters (kqueue-style `EVFILT_AIO`).
    fn supports_completion_filters(&self) -> bool {
        false
    }

    /// Register a per-operation completion filter for an in-flight
    /// control block. The reactor fires [`AioDriver::on_op_ready`] with
    /// the same ID exactly once when the operation finishes.
    #[cfg(unix)]
    fn register_completion_filter(
        &mut self,
        id: AioRequestId,
        control: *mut libc::aiocb,
    ) -> io::Result<()> {
        let _ = (id, control);
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// Per-reactor disk I/O driver: configuration, queues, and exactly one
/// backend, threaded explicitly through every call instead of living in
/// process-global state.
pub struct AioDriver {
    config: AioConfig,
    queues: AioQueues,
    backend: Box<dyn AioBackend>,
}

impl AioDriver {
    /// Create a driver around an explicit backend.
    pub fn new(config: AioConfig, backend: Box<dyn AioBackend>) -> Self {
        debug!(backend = backend.name(), "aio driver created");
        Self {
            config,
            queues: AioQueues::new(),
            backend,
        }
    }

    /// Create a driver with the best backend the platform and the host
    /// reactor's capabilities allow.
    pub fn with_native_backend(
        config: AioConfig,
        reactor: &dyn ReactorHandle,
    ) -> Result<Self, InitError> {
        let backend = create_native_backend(&config, reactor)?;
        Ok(Self::new(config, backend))
    }

    /// Name of the selected backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Whether the selected backend owns a dedicated notification channel
    /// the reactor must route back into this driver.
    pub fn need_direct_notification(&self) -> bool {
        self.backend.need_direct_notification()
    }

    /// Driver configuration.
    pub fn config(&self) -> &AioConfig {
        &self.config
    }

    /// Requests accepted but not yet handed to the OS.
    pub fn pending_len(&self) -> usize {
        self.queues.pending_len()
    }

    /// Requests currently in flight.
    pub fn submitted_len(&self) -> usize {
        self.queues.submitted_len()
    }

    /// Finalized requests whose callbacks have not run yet.
    pub fn active_len(&self) -> usize {
        self.queues.active_len()
    }

    /// Whether any operation is still owned by this driver.
    pub fn is_idle(&self) -> bool {
        self.pending_len() == 0 && self.submitted_len() == 0 && self.active_len() == 0
    }

    /// Issue a positioned read of `len` bytes into `buf` and enqueue it
    /// as pending. A callback must already be assigned.
    ///
    /// Reissuing a request that is still `Pending` only refreshes its
    /// parameters; it is not enqueued twice.
    ///
    /// # Safety
    ///
    /// `buf` must point to at least `len` writable bytes that stay valid
    /// and untouched by the caller until the request reaches a terminal
    /// state. The backend hands the pointer straight to the OS; it never
    /// copies the buffer.
    pub unsafe fn read(
        &mut self,
        req: &AioHandle,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: i64,
        priority: i32,
    ) -> Result<(), RequestError> {
        self.issue(req, OpKind::Read, fd, buf, len, offset, priority)
    }

    /// Issue a positioned write of `len` bytes from `buf` and enqueue it
    /// as pending. A callback must already be assigned.
    ///
    /// # Safety
    ///
    /// `buf` must point to at least `len` readable bytes that stay valid
    /// and untouched by the caller until the request reaches a terminal
    /// state. The backend hands the pointer straight to the OS; it never
    /// copies the buffer.
    pub unsafe fn write(
        &mut self,
        req: &AioHandle,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: i64,
        priority: i32,
    ) -> Result<(), RequestError> {
        self.issue(req, OpKind::Write, fd, buf, len, offset, priority)
    }

    fn issue(
        &mut self,
        req: &AioHandle,
        kind: OpKind,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: i64,
        priority: i32,
    ) -> Result<(), RequestError> {
        if len == 0 {
            return Err(RequestError::ZeroLength);
        }

        let enqueue = {
            let mut inner = req.lock();
            if inner.callback.is_none() {
                return Err(RequestError::NoCallback);
            }
            match inner.state {
                crate::request::RequestState::Submitted => return Err(RequestError::NotTerminal),
                crate::request::RequestState::Pending => {
                    inner.set_op(kind, fd, buf, len, offset, priority);
                    false
                }
                _ => {
                    inner.set_op(kind, fd, buf, len, offset, priority);
                    inner.state = crate::request::RequestState::Pending;
                    true
                }
            }
        };

        match kind {
            OpKind::Read => self.backend.prepare_read(req, fd, buf, len, offset, priority),
            OpKind::Write => self.backend.prepare_write(req, fd, buf, len, offset, priority),
        }

        if enqueue {
            self.queues.enqueue(req.clone());
        }
        Ok(())
    }

    /// Drain the pending queue into the OS, up to the backend's batch
    /// capacity per call, stopping on backpressure. Never blocks.
    pub fn submit(&mut self, reactor: &mut dyn ReactorHandle) -> Result<(), SubmitError> {
        self.backend.submit(&mut self.queues, reactor)
    }

    /// Best-effort cancellation; behavior depends on the request's state.
    ///
    /// A `Pending` request is withdrawn without any OS call and its
    /// callback never runs. A `Submitted` request races the OS: either
    /// the cancel wins and one callback fires with the cancellation
    /// status, or the real completion surfaces on a later drain — never
    /// both.
    pub fn cancel(&mut self, req: &AioHandle) -> io::Result<()> {
        self.backend.cancel(&mut self.queues, req)
    }

    /// Handle the backend's notification descriptor becoming readable.
    /// Returns the number of operations finalized.
    pub fn on_notify(&mut self) -> io::Result<usize> {
        self.backend.drain(&mut self.queues, Wake::Notification)
    }

    /// Handle a (deferred) delivery of the completion signal. Returns the
    /// number of operations finalized by the registry scan.
    pub fn on_signal(&mut self) -> io::Result<usize> {
        self.backend.drain(&mut self.queues, Wake::Signal)
    }

    /// Handle a per-operation completion filter firing for `id`. Returns
    /// the number of operations finalized (0 or 1).
    pub fn on_op_ready(&mut self, id: AioRequestId) -> io::Result<usize> {
        self.backend.drain(&mut self.queues, Wake::Operation(id))
    }

    /// Run the callbacks of every finalized request, in completion order,
    /// from the caller's (the reactor's) control flow. Returns the number
    /// of callbacks invoked.
    pub fn dispatch(&mut self) -> usize {
        let mut invoked = 0;
        while let Some(req) = self.queues.next_active() {
            let (mut callback, completion) = {
                let mut inner = req.lock();
                let completion = inner.completion(req.id());
                (inner.callback.take(), completion)
            };
            if let Some(cb) = callback.as_mut() {
                cb(&completion);
                invoked += 1;
            }
            // Restore the callback so the request can be reissued.
            let mut inner = req.lock();
            if inner.callback.is_none() {
                inner.callback = callback;
            }
        }
        invoked
    }

    /// Deregister the backend's notification sources from the reactor.
    ///
    /// Safe only once every request has reached a terminal state; OS
    /// resources themselves are released when the driver drops.
    pub fn detach(&mut self, reactor: &mut dyn ReactorHandle) {
        if !self.is_idle() {
            tracing::warn!(
                pending = self.pending_len(),
                submitted = self.submitted_len(),
                active = self.active_len(),
                "detach with live requests"
            );
        }
        self.backend.detach(reactor);
    }
}

impl std::fmt::Debug for AioDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AioDriver")
            .field("backend", &self.backend.name())
            .field("pending", &self.pending_len())
            .field("submitted", &self.submitted_len())
            .field("active", &self.active_len())
            .finish()
    }
}
