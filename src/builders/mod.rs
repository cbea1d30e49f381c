//! Builders that assemble engine components from configuration.

pub mod engine_builder;

pub use engine_builder::{build_scheduler, build_sieve_client};
