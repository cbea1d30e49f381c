//! Awaiting IOCBs and groups from tokio tasks.
//!
//! Waiting registers on a [`tokio::sync::Notify`] owned by the IOCB or group,
//! so no runtime thread blocks. A wait that is dropped, for example by a
//! timeout, deregisters with its future and leaves nothing behind.

use std::pin::pin;
use std::time::Duration;

use tokio::sync::Notify;

use crate::core::group::IoGroup;
use crate::core::iocb::{IoPayload, Iocb};

async fn wait_until(notify: &Notify, done: impl Fn() -> bool) {
    loop {
        let mut notified = pin!(notify.notified());
        // registered before the check, so a release in between still wakes us
        notified.as_mut().enable();
        if done() {
            return;
        }
        notified.await;
    }
}

impl<Req: IoPayload, Rsp: IoPayload> Iocb<Req, Rsp> {
    /// Resolve once the IOCB has triggered.
    pub async fn wait_async(&self) {
        wait_until(self.released_async(), || self.is_released()).await;
    }

    /// Like [`Iocb::wait_async`], bounded by `timeout`.
    ///
    /// Returns true if the IOCB triggered in time.
    pub async fn wait_async_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_async()).await.is_ok()
    }
}

impl<Req: IoPayload, Rsp: IoPayload> IoGroup<Req, Rsp> {
    /// Resolve once every member has triggered.
    pub async fn wait_async(&self) {
        wait_until(self.done_async(), || self.is_complete()).await;
    }

    /// Like [`IoGroup::wait_async`], bounded by `timeout`.
    ///
    /// Returns true if the group completed in time.
    pub async fn wait_async_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_async()).await.is_ok()
    }
}
