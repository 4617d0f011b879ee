//! Ports: the narrow interfaces the engine consumes from the outside world.
//!
//! `attest-infra` provides the production implementations; tests provide
//! in-memory ones.

pub mod dispatch;
pub mod environment;
pub mod testcase;
pub mod workflow;
