//! Controller with single-flight admission control.
//!
//! At most one IOCB is active at a time. Requests arriving while the
//! controller is busy wait in a priority [`IoQueue`]. After each completion
//! the controller either returns to idle right away or, with a settle delay
//! configured, waits that long before admitting the next IOCB.
//!
//! ```text
//!            request (idle)            complete, delay > 0
//!   Idle ---------------------> Active ---------------------> Waiting
//!    ^                            |                              |
//!    |  complete, no delay        |                              |
//!    +----------------------------+           delay elapsed      |
//!    +-----------------------------------------------------------+
//! ```
//!
//! Backlog dispatch always goes through the scheduler: one IOCB per tick, so
//! a strategy that completes synchronously cannot recurse.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::core::controller::{ControllerCounters, ControllerStats, IoControl, ProcessIo};
use crate::core::iocb::{IoPayload, Iocb, IocbState};
use crate::core::scheduler::Scheduler;
use crate::core::IoError;
use crate::infra::queue::IoQueue;

/// Admission state of an [`IoqController`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    /// Ready to admit the next IOCB.
    Idle,
    /// One IOCB is being serviced.
    Active,
    /// Settle delay after a completion.
    Waiting,
}

struct Slot<Req, Rsp> {
    state: ControllerState,
    active: Option<Iocb<Req, Rsp>>,
    // A thread is inside the strategy on behalf of this controller.
    dispatching: bool,
}

/// Queued, single-flight controller.
pub struct IoqController<Req, Rsp> {
    name: String,
    strategy: Arc<dyn ProcessIo<Req, Rsp>>,
    scheduler: Scheduler,
    settle: Duration,
    slot: Mutex<Slot<Req, Rsp>>,
    queue: IoQueue<Req, Rsp>,
    me: Weak<Self>,
    counters: ControllerCounters,
}

impl<Req: IoPayload, Rsp: IoPayload> IoqController<Req, Rsp> {
    /// Create a controller around `strategy`.
    ///
    /// `settle` is the idle period enforced after each completion; zero
    /// disables it.
    pub fn new<S>(
        name: impl Into<String>,
        scheduler: &Scheduler,
        settle: Duration,
        strategy: S,
    ) -> Arc<Self>
    where
        S: ProcessIo<Req, Rsp> + 'static,
    {
        Self::with_strategy(name, scheduler, settle, Arc::new(strategy))
    }

    /// Create a controller around a shared strategy.
    pub fn with_strategy(
        name: impl Into<String>,
        scheduler: &Scheduler,
        settle: Duration,
        strategy: Arc<dyn ProcessIo<Req, Rsp>>,
    ) -> Arc<Self> {
        let name = name.into();
        let queue = IoQueue::new(format!("{name}-queue"));
        Arc::new_cyclic(|me| Self {
            name,
            strategy,
            scheduler: scheduler.clone(),
            settle,
            slot: Mutex::new(Slot {
                state: ControllerState::Idle,
                active: None,
                dispatching: false,
            }),
            queue,
            me: me.clone(),
            counters: ControllerCounters::default(),
        })
    }

    /// Admission state.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.slot.lock().state
    }

    /// The IOCB currently being serviced.
    #[must_use]
    pub fn active_iocb(&self) -> Option<Iocb<Req, Rsp>> {
        self.slot.lock().active.clone()
    }

    /// Number of IOCBs waiting for admission.
    #[must_use]
    pub fn backlog(&self) -> usize {
        self.queue.len()
    }

    /// Whether nothing is active, being dispatched, or queued.
    ///
    /// A controller in its settle delay with an empty backlog is quiescent.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        let slot = self.slot.lock();
        slot.active.is_none() && !slot.dispatching && self.queue.is_empty()
    }

    /// Whether a strategy call is in progress.
    #[must_use]
    pub fn is_dispatching(&self) -> bool {
        self.slot.lock().dispatching
    }

    /// Configured settle delay.
    #[must_use]
    pub const fn settle_delay(&self) -> Duration {
        self.settle
    }

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        self.counters.snapshot(self.queue.len())
    }

    /// Submit `iocb`.
    ///
    /// When idle, the strategy runs on the calling thread; otherwise the IOCB
    /// is queued by priority. A strategy error aborts the failing IOCB and
    /// every queued IOCB.
    ///
    /// # Errors
    ///
    /// `IoError::InvalidStateTransition` if the IOCB was already submitted
    /// past `Pending` or is terminal.
    pub fn request_io(&self, iocb: &Iocb<Req, Rsp>) -> Result<(), IoError> {
        let me = self.me.clone();
        let me: Weak<dyn IoControl<Req, Rsp>> = me;
        iocb.bind(me);
        iocb.set_pending()?;
        self.counters.requested.fetch_add(1, Ordering::Relaxed);

        {
            let mut slot = self.slot.lock();
            if slot.state != ControllerState::Idle || slot.dispatching {
                self.queue.put(iocb.clone())?;
                debug!(
                    controller = %self.name,
                    iocb_id = iocb.id(),
                    state = ?slot.state,
                    backlog = self.queue.len(),
                    "controller busy, iocb queued"
                );
                return Ok(());
            }
            slot.dispatching = true;
        }

        debug!(controller = %self.name, iocb_id = iocb.id(), "controller idle, processing");
        self.process(iocb);
        self.finish_dispatch();
        Ok(())
    }

    /// Fail every queued IOCB with `err`. The active IOCB is left alone.
    ///
    /// A no-op while idle.
    pub fn abort(&self, err: &IoError) {
        if self.state() == ControllerState::Idle {
            return;
        }
        self.abort_backlog(err);
    }

    fn abort_backlog(&self, err: &IoError) {
        warn!(controller = %self.name, backlog = self.queue.len(), error = %err, "aborting backlog");
        self.queue.abort(err);
    }

    fn process(&self, iocb: &Iocb<Req, Rsp>) {
        if let Err(e) = self.strategy.process_io(self, iocb) {
            let err = IoError::processing(e);
            warn!(controller = %self.name, iocb_id = iocb.id(), error = %err, "process_io failed");
            // a fault on the shared resource fails everything waiting for it
            self.abort_backlog(&err);
            if let Err(e) = self.abort_io(iocb, err) {
                debug!(controller = %self.name, iocb_id = iocb.id(), error = %e, "abort after failure");
            }
        }
    }

    fn finish_dispatch(&self) {
        let idle = {
            let mut slot = self.slot.lock();
            slot.dispatching = false;
            slot.state == ControllerState::Idle
        };
        if idle && !self.queue.is_empty() {
            self.schedule_dispatch();
        }
    }

    fn schedule_dispatch(&self) {
        let me = self.me.clone();
        self.scheduler.deferred(move || {
            if let Some(me) = me.upgrade() {
                me.dispatch();
            }
            Ok(())
        });
    }

    /// Admit the next queued IOCB, if idle.
    fn dispatch(&self) {
        let iocb = {
            let mut slot = self.slot.lock();
            if slot.state != ControllerState::Idle || slot.dispatching {
                return;
            }
            loop {
                match self.queue.get(false, None) {
                    None => return,
                    // aborted while queued, before it could unlink itself
                    Some(iocb) if iocb.is_terminal() => continue,
                    Some(iocb) => {
                        slot.dispatching = true;
                        break iocb;
                    }
                }
            }
        };
        trace!(controller = %self.name, iocb_id = iocb.id(), "dispatching from backlog");
        self.process(&iocb);
        self.finish_dispatch();
    }

    fn wait_trigger(&self) {
        {
            let mut slot = self.slot.lock();
            if slot.state != ControllerState::Waiting {
                return;
            }
            slot.state = ControllerState::Idle;
        }
        trace!(controller = %self.name, "settle delay elapsed");
        self.dispatch();
    }

    /// Finish `iocb` and free the slot, if the slot holds it.
    ///
    /// The IOCB reaches its terminal state before the slot opens, so a new
    /// IOCB never becomes active next to it. Returns `None` if `iocb` is not
    /// the active one, otherwise whether `finish` changed its state.
    fn release_slot(
        &self,
        iocb: &Iocb<Req, Rsp>,
        next: ControllerState,
        finish: impl FnOnce() -> bool,
    ) -> Option<bool> {
        let mut slot = self.slot.lock();
        match &slot.active {
            Some(active) if active.ptr_eq(iocb) => {
                let finished = finish();
                slot.active = None;
                slot.state = next;
                Some(finished)
            }
            _ => None,
        }
    }
}

impl<Req: IoPayload, Rsp: IoPayload> IoControl<Req, Rsp> for IoqController<Req, Rsp> {
    fn name(&self) -> &str {
        &self.name
    }

    fn active_io(&self, iocb: &Iocb<Req, Rsp>) -> Result<(), IoError> {
        let mut slot = self.slot.lock();
        if slot.active.as_ref().is_some_and(|a| !a.ptr_eq(iocb)) {
            return Err(IoError::InvalidStateTransition {
                id: iocb.id(),
                from: iocb.state(),
                to: IocbState::Active,
            });
        }
        iocb.set_active()?;
        slot.active = Some(iocb.clone());
        slot.state = ControllerState::Active;
        Ok(())
    }

    fn complete_io(&self, iocb: &Iocb<Req, Rsp>, response: Rsp) -> Result<(), IoError> {
        let next = if self.settle.is_zero() {
            ControllerState::Idle
        } else {
            ControllerState::Waiting
        };
        let Some(finished) = self.release_slot(iocb, next, || iocb.finish_complete(response))
        else {
            return Err(IoError::NotCurrentIocb(iocb.id()));
        };
        debug!(controller = %self.name, iocb_id = iocb.id(), state = ?next, "iocb complete");

        if finished {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            iocb.trigger();
        }

        if next == ControllerState::Waiting {
            let me = self.me.clone();
            self.scheduler
                .call_later(format!("{}-settle", self.name), self.settle, move || {
                    if let Some(me) = me.upgrade() {
                        me.wait_trigger();
                    }
                    Ok(())
                });
        } else {
            self.schedule_dispatch();
        }
        Ok(())
    }

    fn abort_io(&self, iocb: &Iocb<Req, Rsp>, err: IoError) -> Result<(), IoError> {
        let mut err = Some(err);
        let released = self.release_slot(iocb, ControllerState::Idle, || {
            err.take().is_some_and(|e| iocb.finish_abort(e))
        });
        let finished = match (released, err) {
            (Some(finished), _) => finished,
            // not the active one, e.g. aborted while queued
            (None, Some(e)) => iocb.finish_abort(e),
            (None, None) => false,
        };

        if finished {
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            iocb.trigger();
        }

        if released.is_some() {
            self.schedule_dispatch();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type TestIocb = Iocb<u32, u32>;

    fn hold(ctl: &dyn IoControl<u32, u32>, iocb: &TestIocb) -> anyhow::Result<()> {
        ctl.active_io(iocb)?;
        Ok(())
    }

    fn controller(settle: Duration) -> (Scheduler, Arc<IoqController<u32, u32>>) {
        let scheduler = Scheduler::default();
        let ctl = IoqController::new("ioq", &scheduler, settle, hold);
        (scheduler, ctl)
    }

    #[test]
    fn test_busy_controller_queues() {
        let (_s, ctl) = controller(Duration::ZERO);
        let a = TestIocb::new(1, None);
        let b = TestIocb::new(2, None);
        ctl.request_io(&a).unwrap();
        ctl.request_io(&b).unwrap();

        assert_eq!(ctl.state(), ControllerState::Active);
        assert!(ctl.active_iocb().unwrap().ptr_eq(&a));
        assert_eq!(b.state(), IocbState::Pending);
        assert_eq!(ctl.backlog(), 1);
    }

    #[test]
    fn test_complete_dispatches_next_on_tick() {
        let (s, ctl) = controller(Duration::ZERO);
        let a = TestIocb::new(1, None);
        let b = TestIocb::new(2, None);
        ctl.request_io(&a).unwrap();
        ctl.request_io(&b).unwrap();

        a.complete(10).unwrap();
        assert_eq!(ctl.state(), ControllerState::Idle);
        assert_eq!(b.state(), IocbState::Pending);

        s.tick();
        assert_eq!(b.state(), IocbState::Active);
        assert!(ctl.active_iocb().unwrap().ptr_eq(&b));
    }

    #[test]
    fn test_complete_rejects_non_active() {
        let (_s, ctl) = controller(Duration::ZERO);
        let a = TestIocb::new(1, None);
        let b = TestIocb::new(2, None);
        ctl.request_io(&a).unwrap();
        ctl.request_io(&b).unwrap();

        let err = b.complete(3).unwrap_err();
        assert!(matches!(err, IoError::NotCurrentIocb(id) if id == b.id()));
        assert_eq!(b.state(), IocbState::Pending);
    }

    #[test]
    fn test_settle_delay_enters_waiting() {
        let (s, ctl) = controller(Duration::from_secs(60));
        let a = TestIocb::new(1, None);
        let b = TestIocb::new(2, None);
        ctl.request_io(&a).unwrap();
        a.complete(1).unwrap();
        assert_eq!(ctl.state(), ControllerState::Waiting);

        ctl.request_io(&b).unwrap();
        s.tick();
        assert_eq!(b.state(), IocbState::Pending);
        assert_eq!(s.stats().scheduled_tasks, 1);
    }

    #[test]
    fn test_waiting_with_empty_backlog_is_quiescent() {
        let (_s, ctl) = controller(Duration::from_secs(60));
        let a = TestIocb::new(1, None);
        ctl.request_io(&a).unwrap();
        assert!(!ctl.is_quiescent());

        a.complete(1).unwrap();
        assert_eq!(ctl.state(), ControllerState::Waiting);
        assert!(ctl.is_quiescent());
        assert!(!ctl.is_dispatching());
    }

    #[test]
    fn test_abort_queued_leaves_active() {
        let (_s, ctl) = controller(Duration::ZERO);
        let a = TestIocb::new(1, None);
        let b = TestIocb::new(2, None);
        ctl.request_io(&a).unwrap();
        ctl.request_io(&b).unwrap();

        b.abort(IoError::Aborted("cancelled".into())).unwrap();
        assert_eq!(b.state(), IocbState::Aborted);
        assert_eq!(ctl.backlog(), 0);
        assert_eq!(ctl.state(), ControllerState::Active);
        assert!(ctl.active_iocb().unwrap().ptr_eq(&a));
    }

    #[test]
    fn test_controller_abort_spares_active() {
        let (_s, ctl) = controller(Duration::ZERO);
        let a = TestIocb::new(1, None);
        let b = TestIocb::new(2, None);
        let c = TestIocb::new(3, None);
        for i in [&a, &b, &c] {
            ctl.request_io(i).unwrap();
        }
        ctl.abort(&IoError::Aborted("link down".into()));
        assert_eq!(a.state(), IocbState::Active);
        assert_eq!(b.state(), IocbState::Aborted);
        assert_eq!(c.state(), IocbState::Aborted);
    }

    #[test]
    fn test_abort_while_idle_is_noop() {
        let (_s, ctl) = controller(Duration::ZERO);
        ctl.abort(&IoError::Timeout);
        assert_eq!(ctl.state(), ControllerState::Idle);
    }

    #[test]
    fn test_abort_active_returns_to_idle() {
        let (s, ctl) = controller(Duration::ZERO);
        let a = TestIocb::new(1, None);
        let b = TestIocb::new(2, None);
        ctl.request_io(&a).unwrap();
        ctl.request_io(&b).unwrap();

        a.abort(IoError::Timeout).unwrap();
        assert_eq!(ctl.state(), ControllerState::Idle);
        s.tick();
        assert_eq!(b.state(), IocbState::Active);
    }
}
