//! Task scheduling, IOCBs and the controllers that service them.

pub mod controller;
pub mod error;
pub mod group;
pub mod iocb;
pub mod ioq_controller;
pub mod scheduler;
pub mod sieve;
pub mod task;

pub use controller::{ControllerStats, IoControl, IoController, ProcessIo};
pub use error::{AppResult, IoError, SchedulerError};
pub use group::IoGroup;
pub use iocb::{Address, IoPayload, Iocb, IocbId, IocbState};
pub use ioq_controller::{ControllerState, IoqController};
pub use scheduler::{Scheduler, SchedulerStats};
pub use sieve::{SendFn, SieveClientController, SieveQueue};
pub use task::{Schedule, Task, TaskId, TaskKind};
