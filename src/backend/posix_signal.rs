//! Signal-Driven POSIX Backend
//!
//! Batches operations with `lio_listio(LIO_NOWAIT)` and asks the OS to
//! deliver one signal (default `SIGIO`) as completions land. The host
//! reactor watches that signal and calls back into the driver from its
//! normal control flow — never from the handler context — at which point
//! this backend scans the *entire* submitted registry with `aio_error`
//! and finalizes every operation that is no longer in progress.
//!
//! The scan is O(registry size) per wake-up by design: one multiplexed
//! signal cannot say which operation finished, so the registry is the
//! only source of truth. Hosts with many in-flight operations and a
//! filter-capable demultiplexer should prefer the readiness-multiplexed
//! backend instead.
//!
//! This module also owns the POSIX `aiocb` preparation and cancellation
//! paths shared with [`posix_readiness`](super::posix_readiness).

use std::io;
use std::os::unix::io::RawFd;

use tracing::{debug, trace, warn};

use crate::backend::{AioBackend, Wake};
use crate::config::AioConfig;
use crate::error::{InitError, SubmitError};
use crate::queue::AioQueues;
use crate::reactor::ReactorHandle;
use crate::request::{AioHandle, ControlBlock, RequestState};

/// Fill a request's POSIX control block. No syscalls; overwrites any
/// previous preparation. The per-operation sigevent stays `SIGEV_NONE` —
/// completion notification is decided per batch at submission time.
pub(crate) fn prepare_posix(
    req: &AioHandle,
    opcode: libc::c_int,
    fd: RawFd,
    buf: *mut u8,
    len: usize,
    offset: i64,
    priority: i32,
) {
    let mut cb: Box<libc::aiocb> = Box::new(unsafe { std::mem::zeroed() });
    cb.aio_fildes = fd;
    cb.aio_offset = offset as libc::off_t;
    cb.aio_buf = buf.cast::<libc::c_void>();
    cb.aio_nbytes = len;
    cb.aio_reqprio = priority;
    cb.aio_lio_opcode = opcode;
    cb.aio_sigevent.sigev_notify = libc::SIGEV_NONE;
    req.lock().control = ControlBlock::Posix(cb);
}

/// The single authorized downcast from a request to its POSIX control
/// block. The box keeps the address stable for the OS across
/// `lio_listio`, `aio_error`, `aio_return`, and `aio_cancel`.
pub(crate) fn posix_aiocb_ptr(req: &AioHandle) -> *mut libc::aiocb {
    match &mut req.lock().control {
        ControlBlock::Posix(cb) => &mut **cb as *mut libc::aiocb,
        _ => unreachable!("control block was not prepared by a posix backend"),
    }
}

/// Finalize one operation from its conclusive OS status.
fn finalize_posix(queues: &mut AioQueues, req: &AioHandle, error: libc::c_int) {
    let cb = posix_aiocb_ptr(req);
    if error == 0 {
        let res = unsafe { libc::aio_return(cb) };
        queues.mark_ready(req, res, 0);
    } else {
        let _ = unsafe { libc::aio_return(cb) };
        queues.mark_ready(req, -1, error);
    }
}

/// Cancellation path shared by both POSIX backends.
///
/// A pending request is withdrawn with no OS call. A submitted request
/// races `aio_cancel`: a conclusive outcome (`AIO_CANCELED`, or
/// `AIO_ALLDONE` — the operation finished and no further wake-up may
/// come for it) finalizes immediately; `AIO_NOTCANCELED` leaves the
/// request submitted for the normal completion path to finalize exactly
/// once.
pub(crate) fn cancel_posix(
    queues: &mut AioQueues,
    req: &AioHandle,
) -> io::Result<()> {
    match req.state() {
        RequestState::Pending => {
            queues.mark_cancelled(req);
            Ok(())
        }
        RequestState::Submitted => {
            let fd = req.lock().fd;
            let cb = posix_aiocb_ptr(req);
            match unsafe { libc::aio_cancel(fd, cb) } {
                libc::AIO_CANCELED | libc::AIO_ALLDONE => {
                    let error = unsafe { libc::aio_error(cb) };
                    finalize_posix(queues, req, error);
                    Ok(())
                }
                libc::AIO_NOTCANCELED => {
                    trace!(id = %req.id(), "cancel lost the race to completion");
                    Ok(())
                }
                _ => Err(io::Error::last_os_error()),
            }
        }
        _ => Ok(()),
    }
}

/// POSIX AIO backend with signal-multiplexed completion notification.
pub struct PosixSignalAio {
    signo: i32,
    capacity: usize,
    signal_registered: bool,
    batch: Vec<AioHandle>,
    aiocb_ptrs: Vec<*mut libc::aiocb>,
}

// The scratch pointer vector is only populated and consumed inside a
// single `submit` call, under the reactor's serialization lock.
unsafe impl Send for PosixSignalAio {}

impl PosixSignalAio {
    /// Create the backend. No OS resources are acquired up front; the
    /// completion signal is registered with the reactor lazily on the
    /// first submission.
    pub fn new(config: &AioConfig) -> Result<Self, InitError> {
        let capacity = config.listio_capacity();
        Ok(Self {
            signo: config.completion_signal,
            capacity,
            signal_registered: false,
            batch: Vec::with_capacity(capacity),
            aiocb_ptrs: Vec::with_capacity(capacity),
        })
    }

    /// Inspect every participant of a partially failed list submission:
    /// in-progress entries become submitted, conclusive ones finalize
    /// immediately without waiting for the signal.
    fn absorb_partial_failure(&mut self, queues: &mut AioQueues) {
        for req in &self.batch {
            let cb = posix_aiocb_ptr(req);
            let error = unsafe { libc::aio_error(cb) };
            if error == libc::EINPROGRESS {
                queues.mark_submitted(req);
            } else {
                finalize_posix(queues, req, error);
            }
        }
    }
}

impl AioBackend for PosixSignalAio {
    fn name(&self) -> &'static str {
        "posix-aio-signal"
    }

    fn need_direct_notification(&self) -> bool {
        true
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn prepare_read(
        &mut self,
        req: &AioHandle,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: i64,
        priority: i32,
    ) {
        prepare_posix(req, libc::LIO_READ, fd, buf, len, offset, priority);
    }

    fn prepare_write(
        &mut self,
        req: &AioHandle,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: i64,
        priority: i32,
    ) {
        prepare_posix(req, libc::LIO_WRITE, fd, buf, len, offset, priority);
    }

    fn submit(
        &mut self,
        queues: &mut AioQueues,
        reactor: &mut dyn ReactorHandle,
    ) -> Result<(), SubmitError> {
        loop {
            queues.claim_pending(self.capacity, &mut self.batch);
            if self.batch.is_empty() {
                return Ok(());
            }

            if !self.signal_registered {
                reactor
                    .register_signal(self.signo)
                    .map_err(SubmitError::Io)?;
                self.signal_registered = true;
            }

            self.aiocb_ptrs.clear();
            for req in &self.batch {
                self.aiocb_ptrs.push(posix_aiocb_ptr(req));
            }

            let mut sigev: libc::sigevent = unsafe { std::mem::zeroed() };
            sigev.sigev_notify = libc::SIGEV_SIGNAL;
            sigev.sigev_signo = self.signo;

            let rc = unsafe {
                libc::lio_listio(
                    libc::LIO_NOWAIT,
                    self.aiocb_ptrs.as_ptr(),
                    self.batch.len() as libc::c_int,
                    &mut sigev,
                )
            };

            if rc == 0 {
                for req in &self.batch {
                    queues.mark_submitted(req);
                }
                debug!(nent = self.batch.len(), "list handed to os");
                continue;
            }

            let list_err = io::Error::last_os_error();
            self.absorb_partial_failure(queues);
            if list_err.raw_os_error() == Some(libc::EAGAIN) {
                trace!("list submission backpressure, remainder stays pending");
            } else {
                debug!(error = %list_err, "list submission reported per-request failures");
            }
            return Ok(());
        }
    }

    fn cancel(&mut self, queues: &mut AioQueues, req: &AioHandle) -> io::Result<()> {
        cancel_posix(queues, req)
    }

    fn drain(&mut self, queues: &mut AioQueues, wake: Wake) -> io::Result<usize> {
        match wake {
            Wake::Signal => {}
            other => {
                warn!(?other, "unexpected wake for signal-driven backend");
                return Ok(0);
            }
        }

        // One multiplexed signal carries no operation identity: walk the
        // whole submitted registry and finalize everything conclusive.
        let mut finalized = 0;
        for id in queues.submitted_ids() {
            let Some(req) = queues.submitted(id) else {
                continue;
            };
            let cb = posix_aiocb_ptr(&req);
            let error = unsafe { libc::aio_error(cb) };
            if error == libc::EINPROGRESS {
                continue;
            }
            finalize_posix(queues, &req, error);
            finalized += 1;
        }
        trace!(finalized, remaining = queues.submitted_len(), "registry scan");
        Ok(finalized)
    }

    fn detach(&mut self, reactor: &mut dyn ReactorHandle) {
        if self.signal_registered {
            reactor.deregister_signal(self.signo);
            self.signal_registered = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::AioRequest;

    #[test]
    fn prepare_fills_aiocb() {
        let req = AioRequest::new();
        req.assign(Box::new(|_| {}));
        let mut buf = [0u8; 128];

        prepare_posix(&req, libc::LIO_READ, 5, buf.as_mut_ptr(), buf.len(), 256, 1);
        {
            let mut inner = req.lock();
            let cb = match &mut inner.control {
                ControlBlock::Posix(cb) => cb,
                other => panic!("unexpected control block: {other:?}"),
            };
            assert_eq!(cb.aio_fildes, 5);
            assert_eq!(cb.aio_nbytes, 128);
            assert_eq!(cb.aio_offset, 256);
            assert_eq!(cb.aio_lio_opcode, libc::LIO_READ);
            assert_eq!(cb.aio_sigevent.sigev_notify, libc::SIGEV_NONE);
        }

        // Idempotent re-preparation before submission.
        prepare_posix(&req, libc::LIO_WRITE, 6, buf.as_mut_ptr(), 64, 0, 0);
        let mut inner = req.lock();
        let cb = match &mut inner.control {
            ControlBlock::Posix(cb) => cb,
            other => panic!("unexpected control block: {other:?}"),
        };
        assert_eq!(cb.aio_fildes, 6);
        assert_eq!(cb.aio_lio_opcode, libc::LIO_WRITE);
        assert_eq!(cb.aio_nbytes, 64);
    }

    #[test]
    fn capacity_respects_listio_limit() {
        let config = AioConfig {
            batch_capacity: 1024,
            ..AioConfig::default()
        };
        let backend = PosixSignalAio::new(&config).unwrap();
        assert_eq!(backend.capacity(), 64);
    }

    #[test]
    fn cancel_pending_needs_no_os_call() {
        let mut queues = AioQueues::new();
        let req = AioRequest::new();
        req.assign(Box::new(|_| {}));
        req.lock().state = RequestState::Pending;
        queues.enqueue(req.clone());

        cancel_posix(&mut queues, &req).unwrap();
        assert_eq!(req.state(), RequestState::Cancelled);
        assert_eq!(queues.pending_len(), 0);
        assert_eq!(queues.active_len(), 0);
    }
}
