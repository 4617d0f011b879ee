//! Workflow domain types for Attest.
//!
//! Defines the wire-format workflow definition (JSON, camelCase keys) and the
//! execution tracking records: runs, step executions, step logs, and variable
//! changes. The records are shaped so that a finished run's timeline can be
//! reconstructed from persistence alone.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A complete workflow definition.
///
/// The wire format is JSON with `steps` keyed by step id. Step configs are
/// free-form JSON carrying `{{…}}` placeholders anywhere a string appears.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    /// Initial workflow variables (overlaid on environment variables).
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    /// Steps keyed by step id.
    #[serde(default)]
    pub steps: HashMap<String, StepDefinition>,
}

/// A single step in the workflow DAG.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepDefinition {
    /// Step id, unique within a workflow. Filled from the map key if omitted.
    #[serde(default)]
    pub id: String,
    /// Human-readable step name.
    #[serde(default)]
    pub name: String,
    /// The action kind this step dispatches.
    #[serde(rename = "type", default)]
    pub step_type: StepType,
    /// Action configuration; strings may contain `{{…}}` placeholders.
    #[serde(default)]
    pub config: Map<String, Value>,
    /// Literal input parameters, snapshotted with the step record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Map<String, Value>>,
    /// Output mapping: action output key -> variable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<HashMap<String, String>>,
    /// Ids of steps that must complete before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Boolean gate expression; false means skip, not fail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,

    /// forEach loop: collection expression, e.g. `{{productIds}}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_over: Option<String>,
    /// forEach loop: variable name bound to the current item.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_var: Option<String>,
    /// while loop: boolean condition checked before each iteration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_condition: Option<String>,
    /// count loop: fixed number of iterations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_count: Option<u32>,
    /// Safety cap for while loops (default 100).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<u32>,
    /// Run forEach iterations concurrently.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub parallel: bool,
    /// In-flight bound for parallel iterations (default 10).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Retry policy for the dispatch phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// What a final failure does to the rest of the run.
    #[serde(default)]
    pub on_error: OnError,
}

impl StepDefinition {
    /// Whether this step carries any loop specification.
    pub fn has_loop(&self) -> bool {
        self.loop_over.is_some() || self.loop_condition.is_some() || self.loop_count.is_some()
    }
}

/// The six built-in action kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepType {
    #[default]
    Http,
    Command,
    Database,
    Script,
    Assert,
    TestCase,
}

/// Retry policy: constant interval, bounded attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum attempts; 0 and 1 both mean a single attempt.
    #[serde(default)]
    pub max_attempts: u32,
    /// Sleep between attempts, in milliseconds.
    #[serde(default)]
    pub interval: u64,
}

/// Failure policy for a step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    /// Abort the run after the current layer drains.
    #[default]
    Abort,
    /// Log a warning and let the run continue.
    Continue,
}

// ---------------------------------------------------------------------------
// Execution statuses
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

/// Status of an individual step execution record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Success,
    Failed,
    Skipped,
}

/// Severity of a persisted step log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// How a tracked variable mutation changed the variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

/// One record per `execute` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run id.
    pub id: Uuid,
    pub workflow_id: String,
    pub tenant_id: String,
    pub project_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Final context snapshot: `{"variables": …, "outputs": …}`.
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One record per attempted step (one per loop iteration).
///
/// Skipped steps still get a record, with empty output. Once a record reaches
/// a terminal status it is never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    /// UUIDv7 record id.
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub step_name: String,
    pub status: StepStatus,
    /// Un-interpolated `{input, config}` snapshot taken before dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// A persisted step log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub level: LogLevel,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A tracked mutation of a named workflow variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableChange {
    pub id: Uuid,
    pub run_id: Uuid,
    pub step_id: String,
    pub variable_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_value: Option<Value>,
    pub change_kind: ChangeKind,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

/// In-memory per-step result kept in the execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecutionResult {
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-step entry in a [`WorkflowResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepSummary {
    pub step_id: String,
    pub status: StepStatus,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The value returned by `WorkflowEngine::execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    /// Count of steps with at least one step-execution record (incl. skipped).
    pub total_steps: usize,
    pub completed_steps: usize,
    pub failed_steps: usize,
    pub step_executions: Vec<StepSummary>,
    /// Final `{"variables": …, "outputs": …}` snapshot.
    pub context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Tenant context and optional variable overrides for one execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionParams {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub project_id: String,
    /// Overrides applied on top of environment and workflow variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, Value>>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
