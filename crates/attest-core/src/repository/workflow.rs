//! Workflow persistence port.
//!
//! The engine commits one record per event: a run per execution, a step
//! execution per attempt/iteration, a log row per step log line, and a
//! variable change per output-mapped mutation. It assumes no particular
//! schema. Uses native async fn in traits (RPITIT), so store types stay
//! generic rather than boxed.

use attest_types::error::StoreError;
use attest_types::workflow::{
    StepExecution, StepLogEntry, VariableChange, WorkflowDefinition, WorkflowRun,
};

/// Storage interface required by the workflow engine.
pub trait WorkflowStore: Send + Sync {
    /// Load a stored workflow definition by external id.
    fn get_definition(
        &self,
        workflow_id: &str,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowDefinition>, StoreError>> + Send;

    /// Create the run record at execution start.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Rewrite the run record (status, end time, context snapshot, error).
    fn update_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Create a step execution record (status=running or skipped).
    fn create_step_exec(
        &self,
        exec: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Finalise a step execution record by its record id.
    fn update_step_exec(
        &self,
        exec: &StepExecution,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Append one step log line. Failures here must not abort a run.
    fn append_log(
        &self,
        entry: &StepLogEntry,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Append one variable change record. Failures here must not abort a run.
    fn append_variable_change(
        &self,
        change: &VariableChange,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}
