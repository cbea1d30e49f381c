//! # BACnet I/O core
//!
//! Scheduling and admission control for request/response traffic in a BACnet
//! stack.
//!
//! The crate is built from a few small pieces:
//!
//! - **Scheduler**: a single dispatch thread firing one-shot and recurring
//!   [`Task`](core::Task)s at their due time, plus a deferred-callback queue
//!   drained on every tick.
//! - **IOCB**: an [`Iocb`](core::Iocb) correlates one request with its
//!   eventual response or error. Issuers wait on it, poll it, or register
//!   callbacks.
//! - **Controllers**: [`IoController`](core::IoController) hands every
//!   request straight to a processing strategy.
//!   [`IoqController`](core::IoqController) admits one request at a time,
//!   queues the rest by priority, and can enforce a settle delay between
//!   requests.
//! - **Sieves**: a [`SieveQueue`](core::SieveQueue) serializes traffic to
//!   one destination; [`SieveClientController`](core::SieveClientController)
//!   keeps one sieve per destination.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use bacnet_iocore::core::{Address, Iocb, Scheduler, SendFn, SieveQueue};
//!
//! let scheduler = Scheduler::default();
//! let send: SendFn<&'static str> =
//!     Arc::new(|_dest: &Address, _req: &&'static str| -> anyhow::Result<()> { Ok(()) });
//! let sieve: SieveQueue<&'static str, u32> =
//!     SieveQueue::new(&scheduler, "10.0.0.7".into(), Duration::ZERO, send);
//!
//! let first = Iocb::to("10.0.0.7", "read-property");
//! let second = Iocb::to("10.0.0.7", "write-property");
//! sieve.request_io(&first).unwrap();
//! sieve.request_io(&second).unwrap();
//!
//! // the response to the first request frees the sieve for the second
//! sieve.complete_active(72).unwrap();
//! scheduler.tick();
//! assert_eq!(first.response(), Some(72));
//! assert!(sieve.active_iocb().is_some_and(|i| i.ptr_eq(&second)));
//! ```
//!
//! ## Threading
//!
//! Every public type is `Send + Sync`. Task bodies, deferred callbacks, IOCB
//! callbacks and processing strategies never run while an engine lock is
//! held, so they may call back into the engine freely.

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Scheduler, IOCBs and controllers.
pub mod core;
/// Configuration models for the scheduler and sieves.
pub mod config;
/// Builders to construct engine components from configuration.
pub mod builders;
/// Queues backing the controllers.
pub mod infra;
/// Async runtime adapters.
pub mod runtime;
/// Shared utilities.
pub mod util;
