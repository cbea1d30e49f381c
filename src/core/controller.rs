//! Controller traits and the base single-request controller.
//!
//! A controller binds IOCBs to a [`ProcessIo`] strategy and owns their
//! terminal transitions. The strategy does the actual work (usually handing
//! the request to a transport) and calls back into the controller through
//! [`IoControl`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use crate::core::iocb::{IoPayload, Iocb};
use crate::core::IoError;

/// Operations a controller exposes to strategies and to its IOCBs.
pub trait IoControl<Req, Rsp>: Send + Sync {
    /// Controller name, used in log output.
    fn name(&self) -> &str;

    /// Mark `iocb` as being serviced.
    ///
    /// # Errors
    ///
    /// `IoError::InvalidStateTransition` unless the IOCB is `Idle` or `Pending`.
    fn active_io(&self, iocb: &Iocb<Req, Rsp>) -> Result<(), IoError>;

    /// Finish `iocb` with `response`.
    ///
    /// # Errors
    ///
    /// Controller specific, e.g. `IoError::NotCurrentIocb`.
    fn complete_io(&self, iocb: &Iocb<Req, Rsp>, response: Rsp) -> Result<(), IoError>;

    /// Finish `iocb` with `err`.
    ///
    /// # Errors
    ///
    /// Controller specific.
    fn abort_io(&self, iocb: &Iocb<Req, Rsp>, err: IoError) -> Result<(), IoError>;
}

/// Strategy that performs the work behind a controller.
///
/// `process_io` usually calls `controller.active_io(iocb)` and hands the
/// request to a transport. The outcome is reported later through
/// [`Iocb::complete`] or [`Iocb::abort`]. A returned error aborts the IOCB
/// (and, for queued controllers, the whole backlog).
pub trait ProcessIo<Req, Rsp>: Send + Sync {
    /// Start servicing `iocb`.
    ///
    /// # Errors
    ///
    /// Any transport or encoding failure.
    fn process_io(&self, controller: &dyn IoControl<Req, Rsp>, iocb: &Iocb<Req, Rsp>)
        -> anyhow::Result<()>;
}

impl<Req, Rsp, F> ProcessIo<Req, Rsp> for F
where
    F: Fn(&dyn IoControl<Req, Rsp>, &Iocb<Req, Rsp>) -> anyhow::Result<()> + Send + Sync,
{
    fn process_io(
        &self,
        controller: &dyn IoControl<Req, Rsp>,
        iocb: &Iocb<Req, Rsp>,
    ) -> anyhow::Result<()> {
        self(controller, iocb)
    }
}

/// Snapshot of controller activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ControllerStats {
    /// IOCBs submitted through `request_io`.
    pub requested: u64,
    /// IOCBs finished with a response.
    pub completed: u64,
    /// IOCBs finished with an error.
    pub aborted: u64,
    /// IOCBs currently waiting in the backlog.
    pub queued: u64,
}

/// Lock-free counters behind [`ControllerStats`].
#[derive(Debug, Default)]
pub(crate) struct ControllerCounters {
    pub requested: AtomicU64,
    pub completed: AtomicU64,
    pub aborted: AtomicU64,
}

impl ControllerCounters {
    pub fn snapshot(&self, queued: usize) -> ControllerStats {
        ControllerStats {
            requested: self.requested.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            queued: queued as u64,
        }
    }
}

/// Controller without admission control: every request goes straight to the
/// strategy.
pub struct IoController<Req, Rsp> {
    name: String,
    strategy: Arc<dyn ProcessIo<Req, Rsp>>,
    me: Weak<Self>,
    counters: ControllerCounters,
}

impl<Req: IoPayload, Rsp: IoPayload> IoController<Req, Rsp> {
    /// Create a controller around `strategy`.
    pub fn new<S>(name: impl Into<String>, strategy: S) -> Arc<Self>
    where
        S: ProcessIo<Req, Rsp> + 'static,
    {
        Self::with_strategy(name, Arc::new(strategy))
    }

    /// Create a controller around a shared strategy.
    pub fn with_strategy(
        name: impl Into<String>,
        strategy: Arc<dyn ProcessIo<Req, Rsp>>,
    ) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|me| Self {
            name,
            strategy,
            me: me.clone(),
            counters: ControllerCounters::default(),
        })
    }

    /// Submit `iocb`: bind it, mark it `Pending` and run the strategy.
    ///
    /// A strategy error aborts the IOCB; it is observed through the IOCB, not
    /// through this return value.
    ///
    /// # Errors
    ///
    /// `IoError::InvalidStateTransition` if the IOCB was already submitted
    /// past `Pending` or is terminal.
    pub fn request_io(&self, iocb: &Iocb<Req, Rsp>) -> Result<(), IoError> {
        debug!(controller = %self.name, iocb_id = iocb.id(), "request_io");
        let me = self.me.clone();
        let me: Weak<dyn IoControl<Req, Rsp>> = me;
        iocb.bind(me);
        iocb.set_pending()?;
        self.counters.requested.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.strategy.process_io(self, iocb) {
            warn!(controller = %self.name, iocb_id = iocb.id(), error = %e, "process_io failed");
            self.abort_io(iocb, IoError::processing(e))?;
        }
        Ok(())
    }

    /// Activity counters.
    #[must_use]
    pub fn stats(&self) -> ControllerStats {
        self.counters.snapshot(0)
    }
}

impl<Req: IoPayload, Rsp: IoPayload> IoControl<Req, Rsp> for IoController<Req, Rsp> {
    fn name(&self) -> &str {
        &self.name
    }

    fn active_io(&self, iocb: &Iocb<Req, Rsp>) -> Result<(), IoError> {
        iocb.set_active()
    }

    fn complete_io(&self, iocb: &Iocb<Req, Rsp>, response: Rsp) -> Result<(), IoError> {
        if iocb.finish_complete(response) {
            self.counters.completed.fetch_add(1, Ordering::Relaxed);
            iocb.trigger();
        }
        Ok(())
    }

    fn abort_io(&self, iocb: &Iocb<Req, Rsp>, err: IoError) -> Result<(), IoError> {
        if iocb.finish_abort(err) {
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            iocb.trigger();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::iocb::IocbState;

    type TestIocb = Iocb<u32, u32>;

    fn echo(ctl: &dyn IoControl<u32, u32>, iocb: &TestIocb) -> anyhow::Result<()> {
        ctl.active_io(iocb)?;
        ctl.complete_io(iocb, *iocb.request() * 2)?;
        Ok(())
    }

    #[test]
    fn test_request_io_completes_through_strategy() {
        let ctl: Arc<IoController<u32, u32>> = IoController::new("echo", echo);
        let iocb = TestIocb::new(21, None);
        ctl.request_io(&iocb).unwrap();
        assert_eq!(iocb.state(), IocbState::Completed);
        assert_eq!(iocb.response(), Some(42));
        assert_eq!(ctl.stats().completed, 1);
    }

    #[test]
    fn test_strategy_error_aborts_iocb() {
        let ctl: Arc<IoController<u32, u32>> = IoController::new(
            "broken",
            |_: &dyn IoControl<u32, u32>, _: &TestIocb| -> anyhow::Result<()> {
                anyhow::bail!("no route")
            },
        );
        let iocb = TestIocb::new(1, None);
        ctl.request_io(&iocb).unwrap();
        assert_eq!(iocb.state(), IocbState::Aborted);
        assert!(matches!(iocb.error(), Some(IoError::Processing(_))));
        assert_eq!(ctl.stats().aborted, 1);
    }

    #[test]
    fn test_active_io_rejects_terminal() {
        let ctl: Arc<IoController<u32, u32>> = IoController::new(
            "idle",
            |_: &dyn IoControl<u32, u32>, _: &TestIocb| -> anyhow::Result<()> { Ok(()) },
        );
        let iocb = TestIocb::new(1, None);
        ctl.request_io(&iocb).unwrap();
        assert_eq!(iocb.state(), IocbState::Pending);

        // bound iocb delegates its completion to the controller
        iocb.complete(3).unwrap();
        assert_eq!(ctl.stats().completed, 1);
        assert!(ctl.active_io(&iocb).is_err());
        assert!(ctl.request_io(&iocb).is_err());
    }
}
