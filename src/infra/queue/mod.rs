//! Queue backends.

pub mod priority;

pub use priority::IoQueue;
