//! Workflow execution engine for the Attest test-management platform.
//!
//! This crate is the runtime core: it validates graph-structured workflows,
//! schedules steps in parallel topological layers, dispatches the six built-in
//! action kinds, evaluates the `{{…}}` expression sub-language, and records a
//! full execution timeline through the `WorkflowStore` port.
//!
//! Persistence, live HTTP/command transports, and environment variable
//! sources are ports defined in [`repository`]; `attest-infra` implements
//! them.

pub mod event;
pub mod repository;
pub mod workflow;
