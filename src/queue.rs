//! Pending Queue, Submitted Registry, Activation List
//!
//! One [`AioQueues`] instance lives inside each driver and is the only
//! queue surface backends may touch. Membership decides a request's
//! standing: the pending FIFO holds requests not yet handed to the OS, the
//! submitted registry holds in-flight requests keyed by ID for O(1)
//! completion correlation and cancellation lookup, and the activation list
//! holds finalized requests whose callbacks still await dispatch on the
//! reactor's own control flow.
//!
//! The `mark_*` methods are the seam contract between the driver machinery
//! and the backends: claim a batch, move it to submitted, finalize with a
//! result, or withdraw it. [`AioQueues::mark_ready`] carries the
//! exactly-once guard — finalizing an already-terminal request is a logged
//! no-op, never a second callback.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};

use tracing::{trace, warn};

use crate::request::{AioHandle, AioRequestId, RequestState};

/// Queue and registry state for one driver.
#[derive(Default)]
pub struct AioQueues {
    /// Not-yet-submitted requests in submission order.
    pending: VecDeque<AioHandle>,
    /// In-flight requests awaiting completion.
    submitted: HashMap<AioRequestId, AioHandle>,
    /// Finalized requests whose callbacks have not run yet.
    active: VecDeque<AioHandle>,
}

impl AioQueues {
    /// Create an empty queue set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of requests waiting to be handed to the OS.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Number of requests currently in flight.
    pub fn submitted_len(&self) -> usize {
        self.submitted.len()
    }

    /// Number of finalized requests awaiting callback dispatch.
    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    /// Append a freshly issued request to the pending FIFO.
    pub(crate) fn enqueue(&mut self, req: AioHandle) {
        trace!(id = %req.id(), "request enqueued");
        self.pending.push_back(req);
    }

    /// Copy up to `max` pending requests, oldest first, into `out`.
    ///
    /// Non-destructive: the requests stay pending until
    /// [`mark_submitted`](Self::mark_submitted) moves them, so a batch the
    /// OS refuses is retried untouched on the next reactor pass.
    pub fn claim_pending(&mut self, max: usize, out: &mut Vec<AioHandle>) {
        out.clear();
        for req in self.pending.iter().take(max) {
            out.push(req.clone());
        }
    }

    /// Record that the OS accepted a request: Pending → Submitted,
    /// registry insert, pending-queue removal.
    pub fn mark_submitted(&mut self, req: &AioHandle) {
        {
            let mut inner = req.lock();
            if inner.state != RequestState::Pending {
                warn!(id = %req.id(), state = ?inner.state, "mark_submitted on non-pending request");
                return;
            }
            inner.state = RequestState::Submitted;
        }
        self.remove_pending(req.id());
        match self.submitted.entry(req.id()) {
            Entry::Vacant(slot) => {
                slot.insert(req.clone());
            }
            Entry::Occupied(_) => {
                warn!(id = %req.id(), "request already in submitted registry");
            }
        }
        trace!(id = %req.id(), "request submitted");
    }

    /// Withdraw a request the OS never saw: Pending → Cancelled, queue
    /// removal, no callback.
    pub fn mark_cancelled(&mut self, req: &AioHandle) {
        {
            let mut inner = req.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = RequestState::Cancelled;
        }
        self.remove_pending(req.id());
        self.submitted.remove(&req.id());
        trace!(id = %req.id(), "request cancelled");
    }

    /// Finalize a request with its OS-reported outcome and schedule the
    /// owner's callback for the next dispatch pass.
    ///
    /// Idempotence guard: a request that already reached a terminal state
    /// is left untouched, so a cancellation racing a real completion can
    /// never finalize twice.
    pub fn mark_ready(&mut self, req: &AioHandle, result: isize, error: i32) {
        {
            let mut inner = req.lock();
            if inner.state.is_terminal() {
                warn!(id = %req.id(), state = ?inner.state, "duplicate finalization suppressed");
                return;
            }
            inner.state = RequestState::Completed;
            inner.result = result;
            inner.error = error;
        }
        self.remove_pending(req.id());
        self.submitted.remove(&req.id());
        self.active.push_back(req.clone());
        trace!(id = %req.id(), result, error, "request ready");
    }

    /// Look up an in-flight request by ID.
    pub fn submitted(&self, id: AioRequestId) -> Option<AioHandle> {
        self.submitted.get(&id).cloned()
    }

    /// IDs of every in-flight request, for registry scans.
    pub fn submitted_ids(&self) -> Vec<AioRequestId> {
        self.submitted.keys().copied().collect()
    }

    /// Pop the next finalized request awaiting callback dispatch.
    pub(crate) fn next_active(&mut self) -> Option<AioHandle> {
        self.active.pop_front()
    }

    fn remove_pending(&mut self, id: AioRequestId) {
        // Batches are claimed from the front, so the common case is a
        // front removal.
        match self.pending.front() {
            Some(front) if front.id() == id => {
                self.pending.pop_front();
            }
            _ => {
                if let Some(pos) = self.pending.iter().position(|r| r.id() == id) {
                    self.pending.remove(pos);
                }
            }
        }
    }
}
