//! Infrastructure shared by the controllers.

pub mod queue;

pub use queue::IoQueue;
