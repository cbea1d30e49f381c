//! Configuration models for the scheduler and sieve controllers.

pub mod engine;

pub use engine::{EngineConfig, SchedulerConfig, SieveConfig};
