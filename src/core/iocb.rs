//! I/O Control Blocks.
//!
//! An [`Iocb`] correlates one request with its eventual response. The issuer
//! keeps a handle, hands a clone to a controller, and later observes the
//! outcome through [`Iocb::wait`], a callback, or by polling [`Iocb::state`].
//!
//! Lifecycle:
//!
//! ```text
//! Idle -> Pending -> Active -> Completed
//!                          \-> Aborted
//! ```
//!
//! `Completed` and `Aborted` are terminal: the response (or error) is set
//! exactly once and never changes afterwards.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::core::controller::IoControl;
use crate::core::scheduler::Scheduler;
use crate::core::task::{Schedule, Task};
use crate::core::IoError;

/// Unique, monotonically increasing IOCB identifier.
pub type IocbId = u64;

static NEXT_IOCB_ID: AtomicU64 = AtomicU64::new(1);

/// Marker trait for request and response payloads.
///
/// Payloads cross from the issuing thread to the scheduler thread and to
/// transport callbacks, so they must be `Send + Sync`.
pub trait IoPayload: Send + Sync + 'static {}

/// Blanket implementation: any type meeting the requirements is an `IoPayload`.
impl<T> IoPayload for T where T: Send + Sync + 'static {}

/// Lifecycle state of an IOCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IocbState {
    /// Created, not yet submitted.
    Idle,
    /// Submitted and waiting for a controller.
    Pending,
    /// Being serviced by a controller.
    Active,
    /// Finished with a response.
    Completed,
    /// Finished with an error.
    Aborted,
}

impl IocbState {
    /// Whether the state is `Completed` or `Aborted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }
}

/// Opaque identity of the peer a request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Arc<str>);

impl Address {
    /// Build an address from any string-like identity.
    pub fn new(addr: impl AsRef<str>) -> Self {
        Self(Arc::from(addr.as_ref()))
    }

    /// Borrow the identity.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

/// Implemented by containers that can hold an IOCB and must release it when
/// the IOCB triggers.
pub(crate) trait QueueLink<Req, Rsp>: Send + Sync {
    fn unlink(&self, iocb: &Iocb<Req, Rsp>);
}

type Callback<Req, Rsp> = Box<dyn FnOnce(&Iocb<Req, Rsp>) + Send>;

struct IocbCore<Req, Rsp> {
    state: IocbState,
    priority: i32,
    response: Option<Rsp>,
    error: Option<IoError>,
    controller: Option<Weak<dyn IoControl<Req, Rsp>>>,
    queue: Option<Weak<dyn QueueLink<Req, Rsp>>>,
    timeout: Option<(Scheduler, Task)>,
    callbacks: Vec<Callback<Req, Rsp>>,
    // Set when trigger starts; callbacks are taken exactly once.
    triggered: bool,
    // Set once waiters may return.
    released: bool,
}

struct IocbInner<Req, Rsp> {
    id: IocbId,
    request: Req,
    destination: Option<Address>,
    core: Mutex<IocbCore<Req, Rsp>>,
    released: Condvar,
    #[cfg(feature = "tokio-runtime")]
    released_async: tokio::sync::Notify,
}

/// Shared handle to an I/O Control Block.
///
/// Clones refer to the same block; the block is freed with the last handle.
pub struct Iocb<Req, Rsp> {
    inner: Arc<IocbInner<Req, Rsp>>,
}

impl<Req, Rsp> Clone for Iocb<Req, Rsp> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Req: IoPayload, Rsp: IoPayload> Iocb<Req, Rsp> {
    /// Create an idle IOCB with priority 0.
    pub fn new(request: Req, destination: Option<Address>) -> Self {
        let id = NEXT_IOCB_ID.fetch_add(1, Ordering::Relaxed);
        trace!(iocb_id = id, "iocb created");
        Self {
            inner: Arc::new(IocbInner {
                id,
                request,
                destination,
                core: Mutex::new(IocbCore {
                    state: IocbState::Idle,
                    priority: 0,
                    response: None,
                    error: None,
                    controller: None,
                    queue: None,
                    timeout: None,
                    callbacks: Vec::new(),
                    triggered: false,
                    released: false,
                }),
                released: Condvar::new(),
                #[cfg(feature = "tokio-runtime")]
                released_async: tokio::sync::Notify::new(),
            }),
        }
    }

    /// Create an idle IOCB addressed to `destination`.
    pub fn to(destination: impl Into<Address>, request: Req) -> Self {
        Self::new(request, Some(destination.into()))
    }

    /// Set the priority; higher values are serviced first.
    #[must_use]
    pub fn with_priority(self, priority: i32) -> Self {
        self.set_priority(priority);
        self
    }

    /// Change the priority. Takes effect the next time the IOCB is queued.
    pub fn set_priority(&self, priority: i32) {
        self.inner.core.lock().priority = priority;
    }

    /// Identifier.
    #[must_use]
    pub fn id(&self) -> IocbId {
        self.inner.id
    }

    /// Request payload.
    #[must_use]
    pub fn request(&self) -> &Req {
        &self.inner.request
    }

    /// Destination identity, if any.
    #[must_use]
    pub fn destination(&self) -> Option<&Address> {
        self.inner.destination.as_ref()
    }

    /// Current priority.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.inner.core.lock().priority
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> IocbState {
        self.inner.core.lock().state
    }

    /// Whether the IOCB has completed or aborted.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Whether [`Iocb::trigger`] has run.
    #[must_use]
    pub fn is_triggered(&self) -> bool {
        self.inner.core.lock().triggered
    }

    /// Error of an aborted IOCB.
    #[must_use]
    pub fn error(&self) -> Option<IoError> {
        self.inner.core.lock().error.clone()
    }

    /// Returns true if both handles refer to the same block.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register a completion callback.
    ///
    /// Callbacks run in registration order when the IOCB triggers. A callback
    /// added after the trigger runs immediately on the calling thread.
    pub fn add_callback<F>(&self, f: F)
    where
        F: FnOnce(&Self) + Send + 'static,
    {
        {
            let mut core = self.inner.core.lock();
            if !core.triggered {
                core.callbacks.push(Box::new(f));
                return;
            }
        }
        f(self);
    }

    /// Block until the IOCB has triggered.
    pub fn wait(&self) {
        let mut core = self.inner.core.lock();
        while !core.released {
            self.inner.released.wait(&mut core);
        }
    }

    /// Block until the IOCB has triggered or `timeout` elapses.
    ///
    /// Returns true if the IOCB triggered. A timeout too large to fall on
    /// the clock behaves like [`Iocb::wait`].
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut core = self.inner.core.lock();
        while !core.released {
            if self.inner.released.wait_until(&mut core, deadline).timed_out() {
                return core.released;
            }
        }
        true
    }

    /// Release the IOCB: unlink it from its queue, cancel its timeout, wake
    /// waiters and run callbacks in registration order.
    ///
    /// Only the first call has any effect.
    pub fn trigger(&self) {
        let (queue, timeout, callbacks) = {
            let mut core = self.inner.core.lock();
            if core.triggered {
                return;
            }
            core.triggered = true;
            (
                core.queue.take(),
                core.timeout.take(),
                std::mem::take(&mut core.callbacks),
            )
        };
        debug!(iocb_id = self.id(), callbacks = callbacks.len(), "iocb triggered");

        if let Some(queue) = queue.and_then(|q| q.upgrade()) {
            queue.unlink(self);
        }
        if let Some((scheduler, task)) = timeout {
            scheduler.suspend_task(&task);
        }

        self.inner.core.lock().released = true;
        self.inner.released.notify_all();
        #[cfg(feature = "tokio-runtime")]
        self.inner.released_async.notify_waiters();

        for cb in callbacks {
            cb(self);
        }
    }

    /// Finish with a response.
    ///
    /// Delegates to the bound controller if there is one. A no-op on an IOCB
    /// that is already terminal.
    ///
    /// # Errors
    ///
    /// Whatever the controller reports, e.g. `IoError::NotCurrentIocb`.
    pub fn complete(&self, response: Rsp) -> Result<(), IoError> {
        let Some(controller) = self.live_controller() else {
            return Ok(());
        };
        match controller {
            Some(controller) => controller.complete_io(self, response),
            None => {
                if self.finish_complete(response) {
                    self.trigger();
                }
                Ok(())
            }
        }
    }

    /// Finish with an error.
    ///
    /// Delegates to the bound controller if there is one. A no-op on an IOCB
    /// that is already terminal.
    ///
    /// # Errors
    ///
    /// Whatever the controller reports.
    pub fn abort(&self, err: IoError) -> Result<(), IoError> {
        let Some(controller) = self.live_controller() else {
            return Ok(());
        };
        match controller {
            Some(controller) => controller.abort_io(self, err),
            None => {
                if self.finish_abort(err) {
                    self.trigger();
                }
                Ok(())
            }
        }
    }

    /// `None` if terminal, otherwise the upgraded controller (if bound).
    fn live_controller(&self) -> Option<Option<Arc<dyn IoControl<Req, Rsp>>>> {
        let core = self.inner.core.lock();
        if core.state.is_terminal() {
            return None;
        }
        Some(core.controller.as_ref().and_then(Weak::upgrade))
    }

    /// Abort with `IoError::Timeout` after `timeout` unless triggered first.
    ///
    /// Calling again replaces the previous timeout. A timeout too large for
    /// the clock never fires.
    pub fn set_timeout(&self, scheduler: &Scheduler, timeout: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let id = self.id();
        let task = Task::one_shot_delete(format!("iocb-{id}-timeout"), move || {
            if let Some(inner) = weak.upgrade() {
                debug!(iocb_id = id, "iocb timed out");
                Iocb { inner }.abort(IoError::Timeout)?;
            }
            Ok(())
        });

        let previous = {
            let mut core = self.inner.core.lock();
            if core.triggered {
                return;
            }
            core.timeout.replace((scheduler.clone(), task.clone()))
        };
        if let Some((old_scheduler, old_task)) = previous {
            old_scheduler.suspend_task(&old_task);
        }
        if let Err(e) = scheduler.install_task(&task, Schedule::After(timeout)) {
            // past the end of the clock: the IOCB never times out
            debug!(iocb_id = id, error = %e, "timeout not installed");
            return;
        }
        // a trigger between the store above and the install could not cancel it
        if self.is_triggered() {
            scheduler.suspend_task(&task);
        }
    }

    /// Whether waiters may return.
    #[cfg(feature = "tokio-runtime")]
    pub(crate) fn is_released(&self) -> bool {
        self.inner.core.lock().released
    }

    #[cfg(feature = "tokio-runtime")]
    pub(crate) fn released_async(&self) -> &tokio::sync::Notify {
        &self.inner.released_async
    }

    pub(crate) fn bind(&self, controller: Weak<dyn IoControl<Req, Rsp>>) {
        self.inner.core.lock().controller = Some(controller);
    }

    pub(crate) fn set_pending(&self) -> Result<(), IoError> {
        self.transition(IocbState::Pending, &[IocbState::Idle, IocbState::Pending])
    }

    pub(crate) fn set_active(&self) -> Result<(), IoError> {
        self.transition(IocbState::Active, &[IocbState::Idle, IocbState::Pending])
    }

    fn transition(&self, to: IocbState, allowed: &[IocbState]) -> Result<(), IoError> {
        let mut core = self.inner.core.lock();
        if !allowed.contains(&core.state) {
            return Err(IoError::InvalidStateTransition {
                id: self.inner.id,
                from: core.state,
                to,
            });
        }
        trace!(iocb_id = self.inner.id, from = ?core.state, to = ?to, "iocb state");
        core.state = to;
        Ok(())
    }

    /// Set `Completed`; false if the IOCB was already terminal.
    pub(crate) fn finish_complete(&self, response: Rsp) -> bool {
        let mut core = self.inner.core.lock();
        if core.state.is_terminal() {
            return false;
        }
        core.state = IocbState::Completed;
        core.response = Some(response);
        true
    }

    /// Set `Aborted`; false if the IOCB was already terminal.
    pub(crate) fn finish_abort(&self, err: IoError) -> bool {
        let mut core = self.inner.core.lock();
        if core.state.is_terminal() {
            return false;
        }
        core.state = IocbState::Aborted;
        core.error = Some(err);
        true
    }

    pub(crate) fn link_queue(&self, queue: Weak<dyn QueueLink<Req, Rsp>>) {
        self.inner.core.lock().queue = Some(queue);
    }

    pub(crate) fn clear_queue_link(&self) {
        self.inner.core.lock().queue = None;
    }
}

impl<Req: IoPayload, Rsp: IoPayload + Clone> Iocb<Req, Rsp> {
    /// Response of a completed IOCB.
    #[must_use]
    pub fn response(&self) -> Option<Rsp> {
        self.inner.core.lock().response.clone()
    }

    /// Outcome once terminal: the response or the abort error.
    #[must_use]
    pub fn outcome(&self) -> Option<Result<Rsp, IoError>> {
        let core = self.inner.core.lock();
        match core.state {
            IocbState::Completed => core.response.clone().map(Ok),
            IocbState::Aborted => core.error.clone().map(Err),
            _ => None,
        }
    }
}

impl<Req, Rsp> fmt::Debug for Iocb<Req, Rsp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("Iocb")
            .field("id", &self.inner.id)
            .field("state", &core.state)
            .field("priority", &core.priority)
            .field("destination", &self.inner.destination)
            .finish_non_exhaustive()
    }
}
