//! SQLite-backed implementations of the persistence ports.

pub mod environment;
pub mod pool;
pub mod testcase;
pub mod workflow;
