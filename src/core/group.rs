//! Fan-in over several IOCBs.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::core::iocb::{IoPayload, Iocb};
use crate::core::IoError;

type GroupCallback<Req, Rsp> = Box<dyn FnOnce(&IoGroup<Req, Rsp>) + Send>;

struct GroupState<Req, Rsp> {
    members: Vec<Iocb<Req, Rsp>>,
    pending: usize,
    callbacks: Vec<GroupCallback<Req, Rsp>>,
}

struct GroupInner<Req, Rsp> {
    state: Mutex<GroupState<Req, Rsp>>,
    done: Condvar,
    #[cfg(feature = "tokio-runtime")]
    done_async: tokio::sync::Notify,
}

/// A set of IOCBs observed as one.
///
/// The group is complete once every member has triggered. An empty group is
/// complete. Adding an untriggered member makes it incomplete again.
pub struct IoGroup<Req, Rsp> {
    inner: Arc<GroupInner<Req, Rsp>>,
}

impl<Req, Rsp> Clone for IoGroup<Req, Rsp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req: IoPayload, Rsp: IoPayload> Default for IoGroup<Req, Rsp> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Req: IoPayload, Rsp: IoPayload> IoGroup<Req, Rsp> {
    /// Create an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(GroupInner {
                state: Mutex::new(GroupState {
                    members: Vec::new(),
                    pending: 0,
                    callbacks: Vec::new(),
                }),
                done: Condvar::new(),
                #[cfg(feature = "tokio-runtime")]
                done_async: tokio::sync::Notify::new(),
            }),
        }
    }

    /// Add a member.
    pub fn add(&self, iocb: &Iocb<Req, Rsp>) {
        {
            let mut state = self.inner.state.lock();
            state.members.push(iocb.clone());
            state.pending += 1;
        }
        trace!(iocb_id = iocb.id(), "iocb joined group");
        let weak: Weak<GroupInner<Req, Rsp>> = Arc::downgrade(&self.inner);
        iocb.add_callback(move |_| {
            if let Some(inner) = weak.upgrade() {
                IoGroup { inner }.member_triggered();
            }
        });
    }

    fn member_triggered(&self) {
        let callbacks = {
            let mut state = self.inner.state.lock();
            state.pending = state.pending.saturating_sub(1);
            if state.pending > 0 {
                return;
            }
            self.inner.done.notify_all();
            #[cfg(feature = "tokio-runtime")]
            self.inner.done_async.notify_waiters();
            std::mem::take(&mut state.callbacks)
        };
        debug!(callbacks = callbacks.len(), "group complete");
        for cb in callbacks {
            cb(self);
        }
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.state.lock().members.len()
    }

    /// Whether the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().members.is_empty()
    }

    /// Snapshot of the members in insertion order.
    #[must_use]
    pub fn members(&self) -> Vec<Iocb<Req, Rsp>> {
        self.inner.state.lock().members.clone()
    }

    /// Whether every member has triggered.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().pending == 0
    }

    /// Run `f` once the group completes; immediately if it already has.
    pub fn add_callback<F>(&self, f: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        {
            let mut state = self.inner.state.lock();
            if state.pending > 0 {
                state.callbacks.push(Box::new(f));
                return;
            }
        }
        f(self);
    }

    /// Block until every member has triggered.
    pub fn wait(&self) {
        let mut state = self.inner.state.lock();
        while state.pending > 0 {
            self.inner.done.wait(&mut state);
        }
    }

    /// Block until complete or `timeout` elapses. Returns true if complete.
    ///
    /// A timeout too large to fall on the clock behaves like [`IoGroup::wait`].
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut state = self.inner.state.lock();
        while state.pending > 0 {
            if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                return state.pending == 0;
            }
        }
        true
    }

    #[cfg(feature = "tokio-runtime")]
    pub(crate) fn done_async(&self) -> &tokio::sync::Notify {
        &self.inner.done_async
    }

    /// Abort every member that has not finished.
    pub fn abort(&self, err: &IoError) {
        for member in self.members() {
            if let Err(e) = member.abort(err.clone()) {
                debug!(iocb_id = member.id(), error = %e, "group member abort failed");
            }
        }
    }
}
