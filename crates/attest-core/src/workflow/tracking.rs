//! Step logging and variable-change tracking handles.
//!
//! Both traits are object-safe (boxed futures) so the execution context can
//! carry them as `Arc<dyn …>` across spawned step tasks. The store-backed
//! implementations persist through the `WorkflowStore` port and mirror to
//! `tracing`; append failures are logged and swallowed -- a run never aborts
//! because a log row could not be written.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use attest_types::workflow::{ChangeKind, LogLevel, StepLogEntry, VariableChange};
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::repository::workflow::WorkflowStore;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Persisted per-step logging.
pub trait StepLogger: Send + Sync {
    fn log(
        &self,
        level: LogLevel,
        step_id: &str,
        message: &str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    fn debug(&self, step_id: &str, message: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.log(LogLevel::Debug, step_id, message)
    }

    fn info(&self, step_id: &str, message: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.log(LogLevel::Info, step_id, message)
    }

    fn warn(&self, step_id: &str, message: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.log(LogLevel::Warn, step_id, message)
    }

    fn error(&self, step_id: &str, message: &str) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        self.log(LogLevel::Error, step_id, message)
    }
}

/// Records every output-mapped mutation of a named workflow variable.
pub trait VariableChangeTracker: Send + Sync {
    fn track(
        &self,
        step_id: &str,
        variable_name: &str,
        old_value: Option<Value>,
        new_value: Option<Value>,
        change_kind: ChangeKind,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

// ---------------------------------------------------------------------------
// Store-backed implementations
// ---------------------------------------------------------------------------

/// Step logger writing `StepLogEntry` rows for one run.
pub struct StoreStepLogger<S: WorkflowStore> {
    run_id: Uuid,
    store: Arc<S>,
}

impl<S: WorkflowStore> StoreStepLogger<S> {
    pub fn new(run_id: Uuid, store: Arc<S>) -> Self {
        Self { run_id, store }
    }
}

impl<S: WorkflowStore + 'static> StepLogger for StoreStepLogger<S> {
    fn log(
        &self,
        level: LogLevel,
        step_id: &str,
        message: &str,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let entry = StepLogEntry {
            id: Uuid::now_v7(),
            run_id: self.run_id,
            step_id: step_id.to_string(),
            level,
            message: message.to_string(),
            timestamp: Utc::now(),
        };

        Box::pin(async move {
            match level {
                LogLevel::Debug => {
                    tracing::debug!(run_id = %entry.run_id, step_id = entry.step_id.as_str(), "{}", entry.message);
                }
                LogLevel::Info => {
                    tracing::info!(run_id = %entry.run_id, step_id = entry.step_id.as_str(), "{}", entry.message);
                }
                LogLevel::Warn => {
                    tracing::warn!(run_id = %entry.run_id, step_id = entry.step_id.as_str(), "{}", entry.message);
                }
                LogLevel::Error => {
                    tracing::error!(run_id = %entry.run_id, step_id = entry.step_id.as_str(), "{}", entry.message);
                }
            }

            if let Err(e) = self.store.append_log(&entry).await {
                tracing::warn!(run_id = %entry.run_id, error = %e, "failed to persist step log");
            }
        })
    }
}

/// Change tracker writing `VariableChange` rows for one run.
pub struct StoreChangeTracker<S: WorkflowStore> {
    run_id: Uuid,
    store: Arc<S>,
}

impl<S: WorkflowStore> StoreChangeTracker<S> {
    pub fn new(run_id: Uuid, store: Arc<S>) -> Self {
        Self { run_id, store }
    }
}

impl<S: WorkflowStore + 'static> VariableChangeTracker for StoreChangeTracker<S> {
    fn track(
        &self,
        step_id: &str,
        variable_name: &str,
        old_value: Option<Value>,
        new_value: Option<Value>,
        change_kind: ChangeKind,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let change = VariableChange {
            id: Uuid::now_v7(),
            run_id: self.run_id,
            step_id: step_id.to_string(),
            variable_name: variable_name.to_string(),
            old_value,
            new_value,
            change_kind,
            timestamp: Utc::now(),
        };

        Box::pin(async move {
            if let Err(e) = self.store.append_variable_change(&change).await {
                tracing::warn!(
                    run_id = %change.run_id,
                    variable = change.variable_name.as_str(),
                    error = %e,
                    "failed to persist variable change"
                );
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------
