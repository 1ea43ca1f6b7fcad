//! Request Data Model
//!
//! An [`AioRequest`] is the unit of work: one read or write against a file
//! descriptor, with a caller-owned buffer, a file offset, and a completion
//! callback. Requests move through a four-state machine:
//!
//! ```text
//!            read()/write()           submit()
//!   Idle ──────────────────▶ Pending ─────────▶ Submitted
//!                               │                   │
//!                        cancel │            drain / cancel
//!                               ▼                   ▼
//!                           Cancelled           Completed
//! ```
//!
//! `Completed` and `Cancelled` are terminal; a request object may be reused
//! for a new operation only after reaching one of them. Transitions out of
//! `Pending` and `Submitted` happen exactly once per issued operation —
//! the finalization guard in [`crate::queue`] enforces this.
//!
//! # Buffer ownership
//!
//! The buffer behind a request is owned by the caller and is never copied
//! or freed by this crate. While a request is `Pending` or `Submitted` the
//! OS may read or write the buffer at any moment, so the caller must not
//! reuse, move, or free it until the request reaches a terminal state. The
//! `unsafe` issuing entry points on [`AioDriver`](crate::AioDriver) carry
//! this contract.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

/// Unique request identifier.
///
/// Used to correlate OS completions back to their owning request and as
/// the submitted-registry key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AioRequestId(u64);

impl AioRequestId {
    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for AioRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AioRequest({})", self.0)
    }
}

/// Global request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

fn next_request_id() -> AioRequestId {
    AioRequestId(NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed))
}

/// Operation direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpKind {
    /// Positioned read into the caller's buffer.
    #[default]
    Read,
    /// Positioned write from the caller's buffer.
    Write,
}

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    /// Not issued, or finished and available for reuse.
    #[default]
    Idle,
    /// Accepted by the caller-facing API, not yet handed to the OS.
    Pending,
    /// Handed to the OS, awaiting completion.
    Submitted,
    /// Finalized; the callback has been scheduled or has run. Terminal.
    Completed,
    /// Withdrawn before the OS saw it; no callback. Terminal.
    Cancelled,
}

impl RequestState {
    /// Whether a new operation may be issued on a request in this state.
    pub fn is_reusable(&self) -> bool {
        matches!(
            self,
            RequestState::Idle | RequestState::Completed | RequestState::Cancelled
        )
    }

    /// Whether the state is terminal for the current operation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Completed | RequestState::Cancelled)
    }
}

/// Snapshot of a finalized operation, handed to the completion callback.
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    /// The finalized request.
    pub id: AioRequestId,
    /// Operation direction.
    pub kind: OpKind,
    /// The caller's buffer, valid again for reuse.
    pub buf: *mut u8,
    /// Requested transfer length in bytes.
    pub len: usize,
    /// File offset the operation targeted.
    pub offset: i64,
    /// Bytes transferred, or −1 on failure.
    pub result: isize,
    /// Platform error code when `result` is −1, otherwise 0.
    pub error: i32,
}

/// Completion callback invoked from the reactor's control flow.
pub type AioCallback = Box<dyn FnMut(&Completion) + Send>;

/// Backend-specific control block describing one operation to the OS.
///
/// Exactly one variant per backend kind; each backend downcasts only the
/// variant it wrote during `prepare_read`/`prepare_write`.
#[derive(Default)]
pub(crate) enum ControlBlock {
    /// No operation prepared yet.
    #[default]
    None,
    /// Linux kernel AIO submission block. Boxed so its address stays
    /// stable across `io_submit` and `io_cancel`.
    #[cfg(target_os = "linux")]
    Kernel(Box<crate::backend::kernel::KernelIocb>),
    /// POSIX `aiocb`, shared by the signal-driven and
    /// readiness-multiplexed backends.
    #[cfg(unix)]
    Posix(Box<libc::aiocb>),
}

impl fmt::Debug for ControlBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlBlock::None => f.write_str("None"),
            #[cfg(target_os = "linux")]
            ControlBlock::Kernel(_) => f.write_str("Kernel"),
            #[cfg(unix)]
            ControlBlock::Posix(_) => f.write_str("Posix"),
        }
    }
}

/// Mutable request body, guarded by the request's own mutex.
pub(crate) struct RequestInner {
    pub(crate) fd: RawFd,
    pub(crate) kind: OpKind,
    pub(crate) buf: *mut u8,
    pub(crate) len: usize,
    pub(crate) offset: i64,
    pub(crate) priority: i32,
    pub(crate) state: RequestState,
    pub(crate) result: isize,
    pub(crate) error: i32,
    pub(crate) callback: Option<AioCallback>,
    pub(crate) control: ControlBlock,
}

impl RequestInner {
    /// Reset the common operation fields for a fresh issue.
    pub(crate) fn set_op(
        &mut self,
        kind: OpKind,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        offset: i64,
        priority: i32,
    ) {
        self.kind = kind;
        self.fd = fd;
        self.buf = buf;
        self.len = len;
        self.offset = offset;
        self.priority = priority;
        self.result = 0;
        self.error = 0;
    }

    /// Build the callback-facing snapshot of this request.
    pub(crate) fn completion(&self, id: AioRequestId) -> Completion {
        Completion {
            id,
            kind: self.kind,
            buf: self.buf,
            len: self.len,
            offset: self.offset,
            result: self.result,
            error: self.error,
        }
    }
}

/// One asynchronous disk I/O operation.
///
/// Shared as an [`AioHandle`]; the handle held by the caller keeps the
/// request alive, while the driver's queues hold non-owning-in-spirit
/// clones only for the duration of the operation.
pub struct AioRequest {
    id: AioRequestId,
    inner: Mutex<RequestInner>,
}

/// Shared handle to an [`AioRequest`].
pub type AioHandle = Arc<AioRequest>;

// The raw buffer pointer and control-block pointers are only dereferenced
// while the caller upholds the buffer contract documented on this module,
// and all mutation happens under the host reactor's serialization lock.
unsafe impl Send for AioRequest {}
unsafe impl Sync for AioRequest {}

impl AioRequest {
    /// Create a fresh request in the `Idle` state.
    pub fn new() -> AioHandle {
        Arc::new(Self {
            id: next_request_id(),
            inner: Mutex::new(RequestInner {
                fd: -1,
                kind: OpKind::Read,
                buf: std::ptr::null_mut(),
                len: 0,
                offset: 0,
                priority: 0,
                state: RequestState::Idle,
                result: 0,
                error: 0,
                callback: None,
                control: ControlBlock::None,
            }),
        })
    }

    /// Bind the completion callback. Does not enqueue anything.
    ///
    /// Returns `false` if the request is currently pending or in flight,
    /// in which case the callback is left unchanged.
    pub fn assign(&self, callback: AioCallback) -> bool {
        let mut inner = self.inner.lock();
        if !inner.state.is_reusable() {
            return false;
        }
        inner.callback = Some(callback);
        true
    }

    /// This request's identifier.
    pub fn id(&self) -> AioRequestId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    /// Bytes transferred by the finalized operation, or −1 on failure.
    ///
    /// Meaningful only once the request is `Completed`.
    pub fn result(&self) -> isize {
        self.inner.lock().result
    }

    /// Platform error code of the finalized operation (0 on success).
    pub fn error(&self) -> i32 {
        self.inner.lock().error
    }

    /// Operation direction of the most recent issue.
    pub fn kind(&self) -> OpKind {
        self.inner.lock().kind
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, RequestInner> {
        self.inner.lock()
    }
}

impl fmt::Debug for AioRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("AioRequest")
            .field("id", &self.id)
            .field("kind", &inner.kind)
            .field("fd", &inner.fd)
            .field("len", &inner.len)
            .field("offset", &inner.offset)
            .field("state", &inner.state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = AioRequest::new();
        let b = AioRequest::new();
        assert_ne!(a.id(), b.id());
        assert!(b.id().as_u64() > a.id().as_u64());
    }

    #[test]
    fn new_request_is_idle() {
        let req = AioRequest::new();
        assert_eq!(req.state(), RequestState::Idle);
        assert!(req.state().is_reusable());
        assert!(!req.state().is_terminal());
    }

    #[test]
    fn assign_binds_callback_when_reusable() {
        let req = AioRequest::new();
        assert!(req.assign(Box::new(|_| {})));
        assert!(req.lock().callback.is_some());
    }

    #[test]
    fn assign_refused_in_flight() {
        let req = AioRequest::new();
        req.lock().state = RequestState::Submitted;
        assert!(!req.assign(Box::new(|_| {})));
        assert!(req.lock().callback.is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(RequestState::Completed.is_terminal());
        assert!(RequestState::Cancelled.is_terminal());
        assert!(!RequestState::Pending.is_terminal());
        assert!(!RequestState::Submitted.is_terminal());
        assert!(RequestState::Completed.is_reusable());
        assert!(!RequestState::Pending.is_reusable());
    }

    #[test]
    fn completion_snapshot_copies_fields() {
        let req = AioRequest::new();
        let mut buf = [0u8; 16];
        {
            let mut inner = req.lock();
            inner.set_op(OpKind::Write, 5, buf.as_mut_ptr(), buf.len(), 128, 2);
            inner.result = 16;
        }
        let c = req.lock().completion(req.id());
        assert_eq!(c.id, req.id());
        assert_eq!(c.kind, OpKind::Write);
        assert_eq!(c.len, 16);
        assert_eq!(c.offset, 128);
        assert_eq!(c.result, 16);
        assert_eq!(c.error, 0);
    }

    #[test]
    fn set_op_clears_prior_result() {
        let req = AioRequest::new();
        {
            let mut inner = req.lock();
            inner.result = -1;
            inner.error = libc::EIO;
            inner.set_op(OpKind::Read, 3, std::ptr::null_mut(), 4, 0, 0);
            assert_eq!(inner.result, 0);
            assert_eq!(inner.error, 0);
        }
    }
}
