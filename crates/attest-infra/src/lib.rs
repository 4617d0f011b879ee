//! Infrastructure adapters for the Attest workflow engine.
//!
//! Implements the ports defined in `attest-core`: SQLite persistence for
//! runs/steps/logs/variable-changes, the test-case library, the environment
//! variable injector, and the live transport dispatcher (HTTP + commands).

pub mod dispatch;
pub mod sqlite;
