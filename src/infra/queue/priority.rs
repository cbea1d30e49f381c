//! Blocking priority queue of pending IOCBs.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::core::iocb::{IoPayload, Iocb, IocbState, QueueLink};
use crate::core::IoError;

/// Heap entry: priority captured at insertion, plus an insertion sequence.
struct QueueEntry<Req, Rsp> {
    priority: i32,
    seq: u64,
    iocb: Iocb<Req, Rsp>,
}

impl<Req, Rsp> PartialEq for QueueEntry<Req, Rsp> {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl<Req, Rsp> Eq for QueueEntry<Req, Rsp> {}

impl<Req, Rsp> PartialOrd for QueueEntry<Req, Rsp> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<Req, Rsp> Ord for QueueEntry<Req, Rsp> {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then FIFO (lower seq wins, reversed for max-heap)
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<Req, Rsp> {
    heap: BinaryHeap<QueueEntry<Req, Rsp>>,
    seq: u64,
}

struct QueueInner<Req, Rsp> {
    name: String,
    state: Mutex<QueueState<Req, Rsp>>,
    not_empty: Condvar,
}

impl<Req: IoPayload, Rsp: IoPayload> QueueInner<Req, Rsp> {
    fn remove(&self, iocb: &Iocb<Req, Rsp>) -> bool {
        let mut state = self.state.lock();
        let before = state.heap.len();
        state.heap.retain(|e| !e.iocb.ptr_eq(iocb));
        let removed = state.heap.len() < before;
        if state.heap.is_empty() {
            // let blocked getters re-check their deadline
            self.not_empty.notify_all();
        }
        removed
    }
}

impl<Req: IoPayload, Rsp: IoPayload> QueueLink<Req, Rsp> for QueueInner<Req, Rsp> {
    fn unlink(&self, iocb: &Iocb<Req, Rsp>) {
        if self.remove(iocb) {
            trace!(queue = %self.name, iocb_id = iocb.id(), "iocb unlinked");
        }
    }
}

/// Priority queue of `Pending` IOCBs with blocking retrieval.
///
/// Higher priorities dequeue first. Equal priorities dequeue in insertion
/// order. Each IOCB's priority is read once, when it is put.
///
/// An IOCB that triggers while queued (for example because it was aborted)
/// removes itself.
pub struct IoQueue<Req, Rsp> {
    inner: Arc<QueueInner<Req, Rsp>>,
}

impl<Req, Rsp> Clone for IoQueue<Req, Rsp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req: IoPayload, Rsp: IoPayload> IoQueue<Req, Rsp> {
    /// Create an empty queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name: name.into(),
                state: Mutex::new(QueueState {
                    heap: BinaryHeap::new(),
                    seq: 0,
                }),
                not_empty: Condvar::new(),
            }),
        }
    }

    /// Queue name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of queued IOCBs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().heap.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().heap.is_empty()
    }

    /// Insert a `Pending` IOCB and wake one blocked getter.
    ///
    /// # Errors
    ///
    /// `IoError::InvalidStateTransition` if the IOCB is not `Pending`; the
    /// queue is left untouched.
    pub fn put(&self, iocb: Iocb<Req, Rsp>) -> Result<(), IoError> {
        let state = iocb.state();
        if state != IocbState::Pending {
            return Err(IoError::InvalidStateTransition {
                id: iocb.id(),
                from: state,
                to: IocbState::Pending,
            });
        }
        let link = Arc::downgrade(&self.inner);
        let link: Weak<dyn QueueLink<Req, Rsp>> = link;
        iocb.link_queue(link);
        let priority = iocb.priority();

        let mut state = self.inner.state.lock();
        let seq = state.seq;
        state.seq = state.seq.wrapping_add(1);
        trace!(queue = %self.inner.name, iocb_id = iocb.id(), priority, "iocb queued");
        state.heap.push(QueueEntry {
            priority,
            seq,
            iocb,
        });
        self.inner.not_empty.notify_one();
        Ok(())
    }

    /// Pop the highest-priority IOCB.
    ///
    /// - `block == false`: returns `None` immediately when empty.
    /// - `block == true`, `timeout == None`: waits until an IOCB arrives.
    /// - `block == true`, `timeout == Some(t)`: returns `None` if nothing
    ///   arrives within `t`. A `t` too large to fall on the clock waits
    ///   without a deadline.
    pub fn get(&self, block: bool, timeout: Option<Duration>) -> Option<Iocb<Req, Rsp>> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.inner.state.lock();
        while state.heap.is_empty() {
            if !block {
                return None;
            }
            match deadline {
                None => self.inner.not_empty.wait(&mut state),
                Some(deadline) => {
                    if self
                        .inner
                        .not_empty
                        .wait_until(&mut state, deadline)
                        .timed_out()
                        && state.heap.is_empty()
                    {
                        return None;
                    }
                }
            }
        }
        let entry = state.heap.pop()?;
        drop(state);
        entry.iocb.clear_queue_link();
        Some(entry.iocb)
    }

    /// Remove a specific IOCB. Returns whether it was queued.
    pub fn remove(&self, iocb: &Iocb<Req, Rsp>) -> bool {
        let removed = self.inner.remove(iocb);
        if removed {
            iocb.clear_queue_link();
        }
        removed
    }

    /// Drain the queue, aborting every member with `err`.
    pub fn abort(&self, err: &IoError) {
        let drained: Vec<_> = {
            let mut state = self.inner.state.lock();
            let entries = std::mem::take(&mut state.heap).into_sorted_vec();
            self.inner.not_empty.notify_all();
            entries
        };
        debug!(queue = %self.inner.name, count = drained.len(), error = %err, "queue aborted");
        // highest priority first
        for entry in drained.into_iter().rev() {
            entry.iocb.clear_queue_link();
            if let Err(e) = entry.iocb.abort(err.clone()) {
                debug!(iocb_id = entry.iocb.id(), error = %e, "abort of queued iocb failed");
            }
        }
    }
}
