//! Builders to construct the scheduler and sieve client from configuration.

use crate::config::EngineConfig;
use crate::core::{IoPayload, Scheduler, SchedulerError, SendFn, SieveClientController};

/// Build a scheduler from validated configuration.
///
/// The dispatch thread is not started; call [`Scheduler::start`] or drive
/// [`Scheduler::tick`] from a host loop.
///
/// # Errors
///
/// `SchedulerError::InvalidConfig` if validation fails.
pub fn build_scheduler(cfg: &EngineConfig) -> Result<Scheduler, SchedulerError> {
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;
    Ok(Scheduler::new(cfg.scheduler.clone()))
}

/// Build a sieve client controller bound to `scheduler`.
///
/// Every per-destination sieve uses the configured settle delay and hands
/// requests to `send`.
///
/// # Errors
///
/// `SchedulerError::InvalidConfig` if validation fails.
pub fn build_sieve_client<Req, Rsp>(
    cfg: &EngineConfig,
    scheduler: &Scheduler,
    send: SendFn<Req>,
) -> Result<SieveClientController<Req, Rsp>, SchedulerError>
where
    Req: IoPayload,
    Rsp: IoPayload,
{
    cfg.validate().map_err(SchedulerError::InvalidConfig)?;
    Ok(SieveClientController::new(
        scheduler,
        cfg.sieve.settle_delay(),
        send,
    ))
}
