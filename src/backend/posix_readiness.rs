//! Readiness-Multiplexed POSIX Backend
//!
//! Same list-submission batching as the signal-driven backend, but with
//! no private notification channel at all: every submitted control block
//! is registered with the host reactor's own readiness demultiplexer as a
//! per-operation completion filter (kqueue `EVFILT_AIO` shape). The
//! reactor fires [`AioDriver::on_op_ready`](crate::AioDriver::on_op_ready)
//! exactly once per operation, so completion fan-out needs no registry
//! scan loop here.
//!
//! Requires a host whose demultiplexer reports
//! [`supports_completion_filters`](crate::ReactorHandle::supports_completion_filters).

use std::io;
use std::os::unix::io::RawFd;

use tracing::{debug, trace, warn};

use crate::backend::posix_signal::{cancel_posix, posix_aiocb_ptr, prepare_posix};
use crate::backend::{AioBackend, Wake};
use crate::config::AioConfig;
use crate::error::{InitError, SubmitError};
use crate::queue::AioQueues;
use crate::reactor::ReactorHandle;
use crate::request::AioHandle;

/// POSIX AIO backend that rides the reactor's readiness demultiplexer.
pub struct PosixReadinessAio {
    capacity: usize,
    batch: Vec<AioHandle>,
    aiocb_ptrs: Vec<*mut libc::aiocb>,
}

// The scratch pointer vector is only populated and consumed inside a
// single `submit` call, under the reactor's serialization lock.
unsafe impl Send for PosixReadinessAio {}

impl PosixReadinessAio {
    /// Create the backend. No OS resources and no notification channel;
    /// per-operation filters are registered at submission time.
    pub fn new(config: &AioConfig) -> Result<Self, InitError> {
        let capacity = config.listio_capacity();
        Ok(Self {
            capacity,
            batch: Vec::with_capacity(capacity),
            aiocb_ptrs: Vec::with_capacity(capacity),
        })
    }

    /// Move one accepted request to the submitted registry and hang its
    /// completion filter off the reactor. A filter the reactor refuses
    /// would strand the request forever, so refusal finalizes it as
    /// failed instead.
    fn submit_one(
        &self,
        queues: &mut AioQueues,
        reactor: &mut dyn ReactorHandle,
        req: &AioHandle,
    ) {
        queues.mark_submitted(req);
        let cb = posix_aiocb_ptr(req);
        if let Err(e) = reactor.register_completion_filter(req.id(), cb) {
            warn!(id = %req.id(), error = %e, "completion filter registration failed");
            queues.mark_ready(req, -1, e.raw_os_error().unwrap_or(libc::EIO));
        }
    }
}

impl AioBackend for PosixReadinessAio {
    fn name(&self) -> &'static str {
        "posix-aio-readiness"
    }

    fn need_direct_notification(&self) -> bool {
        false
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

            self.aiocb_ptrs.clear();
            for req in &self.batch {
                self.aiocb_ptrs.push(posix_aiocb_ptr(req));
            }

            let rc = unsafe {
                libc::lio_listio(
                    libc::LIO_NOWAIT,
                    self.aiocb_ptrs.as_ptr(),
                    self.batch.len() as libc::c_int,
                    std::ptr::null_mut(),
                )
            };

            if rc == 0 {
                for req in &self.batch {
                    self.submit_one(queues, reactor, req);
                }
                debug!(nent = self.batch.len(), "list handed to os");
                continue;
            }

            let list_err = io::Error::last_os_error();
            // Inspect every participant; a conclusive entry finalizes as
            // failed directly — there is no shared notification left to
            // dispatch its status through.
            for req in &self.batch {
                let cb = posix_aiocb_ptr(req);
                let error = unsafe { libc::aio_error(cb) };
                if error == libc::EINPROGRESS {
                    self.submit_one(queues, reactor, req);
                } else {
                    queues.mark_ready(req, -1, error);
                }
            }

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
        let id = match wake {
            Wake::Operation(id) => id,
            other => {
                warn!(?other, "unexpected wake for readiness-multiplexed backend");
                return Ok(0);
            }
        };

        let Some(req) = queues.submitted(id) else {
            trace!(%id, "filter fired for request no longer in flight");
            return Ok(0);
        };

        let cb = posix_aiocb_ptr(&req);
        let error = unsafe { libc::aio_error(cb) };
        if error == libc::EINPROGRESS {
            warn!(%id, "filter fired while operation still in progress");
            return Ok(0);
        }

        let res = unsafe { libc::aio_return(cb) };
        if error == 0 {
            queues.mark_ready(&req, res, 0);
        } else {
            queues.mark_ready(&req, -1, error);
        }
        Ok(1)
    }

    fn detach(&mut self, _reactor: &mut dyn ReactorHandle) {
        // Per-operation filters are one-shot and die with their
        // operations; there is no standing registration to remove.
    }
}
