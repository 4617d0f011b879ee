//! Single-step lifecycle: gate, record, interpolate, dispatch, retry,
//! finalise, broadcast.
//!
//! One `dispatch_once` call produces exactly one step-execution record, so a
//! loop iteration and a plain step persist the same way. Records are written
//! before dispatch (status running, un-interpolated input snapshot) and
//! finalised exactly once; retries stay within the record of the attempt
//! group.

use std::sync::Arc;
use std::time::{Duration, Instant};

use attest_types::event::WorkflowEvent;
use attest_types::workflow::{
    OnError, StepDefinition, StepExecution, StepExecutionResult, StepStatus,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::dispatch::UnifiedActionDispatcher;
use crate::repository::testcase::TestCaseRepository;
use crate::repository::workflow::WorkflowStore;

use super::actions::{Action, ActionContext};
use super::context::ExecutionContext;
use super::expression::Evaluator;
use super::loops;
use super::EngineSettings;

// ---------------------------------------------------------------------------
// StepError
// ---------------------------------------------------------------------------

/// Errors a step surfaces to the scheduler. A `Failed` step aborts the run
/// after its layer drains unless the step carries `onError: continue` (which
/// the runner resolves internally).
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("step '{step_id}' failed: {error}")]
    Failed { step_id: String, error: String },

    #[error("store error: {0}")]
    Store(#[from] attest_types::error::StoreError),
}

// ---------------------------------------------------------------------------
// StepRunner
// ---------------------------------------------------------------------------

/// Executes one step against the shared execution context.
pub struct StepRunner<S: WorkflowStore> {
    pub(crate) store: Arc<S>,
    pub(crate) events: EventBus,
    pub(crate) dispatcher: Option<Arc<dyn UnifiedActionDispatcher>>,
    pub(crate) test_cases: Option<Arc<dyn TestCaseRepository>>,
    pub(crate) settings: EngineSettings,
}

impl<S: WorkflowStore + 'static> StepRunner<S> {
    pub fn new(
        store: Arc<S>,
        events: EventBus,
        dispatcher: Option<Arc<dyn UnifiedActionDispatcher>>,
        test_cases: Option<Arc<dyn TestCaseRepository>>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            events,
            dispatcher,
            test_cases,
            settings,
        }
    }

    /// Run a step: gate on `when`, then either loop or dispatch once.
    ///
    /// Takes an `Arc` receiver because parallel loop iterations spawn tasks
    /// that each need their own handle on the runner.
    pub async fn run(
        self: Arc<Self>,
        step: &StepDefinition,
        ctx: &ExecutionContext,
    ) -> Result<(), StepError> {
        if let Some(when) = step.when.as_deref().filter(|w| !w.is_empty()) {
            let evaluator = ctx.evaluator_for_step(step);
            let decision = match evaluator.evaluate_bool(when) {
                Ok(decision) => decision,
                Err(e) => {
                    ctx.logger
                        .warn(
                            &step.id,
                            &format!("Condition evaluation error: {e}; skipping step"),
                        )
                        .await;
                    false
                }
            };

            self.events.publish(WorkflowEvent::BranchDecision {
                run_id: ctx.run_id,
                step_id: step.id.clone(),
                step_name: step.name.clone(),
                condition: when.to_string(),
                decision,
            });

            if !decision {
                return self.record_skipped(step, ctx, when).await;
            }
        }

        if step.has_loop() {
            loops::run_loop(&self, step, ctx).await
        } else {
            self.dispatch_once(step, ctx).await
        }
    }

    /// One dispatch pass: pending record, interpolation, action + retries,
    /// finalisation, events. Loops call this once per iteration.
    pub(crate) async fn dispatch_once(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
    ) -> Result<(), StepError> {
        ctx.logger
            .info(&step.id, &format!("Starting step: {}", step.name))
            .await;
        self.events.publish(WorkflowEvent::StepStart {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
        });

        let mut exec = StepExecution {
            id: Uuid::now_v7(),
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            status: StepStatus::Running,
            input: Some(json!({ "input": step.input, "config": step.config })),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };
        self.store.create_step_exec(&exec).await?;

        let start = Instant::now();
        let evaluator = ctx.evaluator_for_step(step);

        let config = match interpolate_config(&step.config, &evaluator) {
            Ok(config) => config,
            Err(e) => {
                let error = format!("variable interpolation failed: {e}");
                return self.finalize_failure(step, ctx, exec, start, error).await;
            }
        };

        let action = match Action::for_step(step, config) {
            Ok(action) => action,
            Err(error) => {
                return self.finalize_failure(step, ctx, exec, start, error).await;
            }
        };

        let action_ctx = ActionContext {
            step_id: &step.id,
            step_name: &step.name,
            variables: ctx.snapshot_variables(),
            step_outputs: ctx.snapshot_outputs(),
            dispatcher: self.dispatcher.as_ref(),
            test_cases: self.test_cases.as_ref(),
            logger: &ctx.logger,
            allow_mock_dispatch: self.settings.allow_mock_dispatch,
        };

        // Dispatch with retry: constant interval, first success wins.
        // max_attempts of 0 behaves as 1.
        let max_attempts = step.retry.map(|r| r.max_attempts.max(1)).unwrap_or(1);
        let interval = step.retry.map(|r| r.interval).unwrap_or(0);

        let mut result = action.execute(&action_ctx).await;
        let mut attempt = 1;
        while !result.is_success() && attempt < max_attempts {
            ctx.logger
                .warn(&step.id, &format!("Attempt {attempt} failed, retrying..."))
                .await;
            if interval > 0 {
                tokio::time::sleep(Duration::from_millis(interval)).await;
            }
            result = action.execute(&action_ctx).await;
            attempt += 1;
        }

        let duration_ms = start.elapsed().as_millis() as u64;

        if !result.is_success() {
            let error = result
                .error
                .unwrap_or_else(|| "step execution failed".to_string());
            return self.finalize_failure(step, ctx, exec, start, error).await;
        }

        // Finalise on success: capture output, map variables, persist, emit.
        let output_value = Value::Object(result.output.clone());
        ctx.set_step_output(&step.id, output_value.clone());
        ctx.apply_output_mapping(step, &result.output).await;

        exec.status = StepStatus::Success;
        exec.output = Some(output_value.clone());
        exec.completed_at = Some(Utc::now());
        exec.duration_ms = Some(duration_ms);
        self.store.update_step_exec(&exec).await?;

        ctx.record_result(
            &step.id,
            StepExecutionResult {
                status: StepStatus::Success,
                duration_ms,
                output: Some(output_value),
                error: None,
            },
        );

        self.events.publish(WorkflowEvent::StepComplete {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            status: StepStatus::Success,
            duration: duration_ms,
        });
        ctx.logger
            .info(&step.id, &format!("Step completed in {duration_ms}ms"))
            .await;

        Ok(())
    }

    /// Finalise a failed dispatch and resolve the step's error policy.
    async fn finalize_failure(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        mut exec: StepExecution,
        start: Instant,
        error: String,
    ) -> Result<(), StepError> {
        let duration_ms = start.elapsed().as_millis() as u64;

        exec.status = StepStatus::Failed;
        exec.error = Some(error.clone());
        exec.completed_at = Some(Utc::now());
        exec.duration_ms = Some(duration_ms);
        self.store.update_step_exec(&exec).await?;

        ctx.record_result(
            &step.id,
            StepExecutionResult {
                status: StepStatus::Failed,
                duration_ms,
                output: None,
                error: Some(error.clone()),
            },
        );

        self.events.publish(WorkflowEvent::StepComplete {
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            status: StepStatus::Failed,
            duration: duration_ms,
        });

        if step.on_error == OnError::Continue {
            ctx.logger
                .warn(&step.id, "Step failed but continuing due to onError=continue")
                .await;
            return Ok(());
        }

        Err(StepError::Failed {
            step_id: step.id.clone(),
            error,
        })
    }

    /// Persist a skipped record: no dispatch, no outputs, no variable changes.
    async fn record_skipped(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        condition: &str,
    ) -> Result<(), StepError> {
        ctx.logger
            .info(
                &step.id,
                &format!("Step skipped due to condition: {condition}"),
            )
            .await;

        let now = Utc::now();
        let exec = StepExecution {
            id: Uuid::now_v7(),
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            status: StepStatus::Skipped,
            input: None,
            output: None,
            error: None,
            started_at: now,
            completed_at: Some(now),
            duration_ms: Some(0),
        };
        self.store.create_step_exec(&exec).await?;

        ctx.record_result(
            &step.id,
            StepExecutionResult {
                status: StepStatus::Skipped,
                duration_ms: 0,
                output: None,
                error: None,
            },
        );

        Ok(())
    }

    /// Persist a failed record for steps that never reached dispatch (loop
    /// collection or condition evaluation failures).
    pub(crate) async fn record_immediate_failure(
        &self,
        step: &StepDefinition,
        ctx: &ExecutionContext,
        error: &str,
    ) -> Result<(), StepError> {
        let now = Utc::now();
        let exec = StepExecution {
            id: Uuid::now_v7(),
            run_id: ctx.run_id,
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            status: StepStatus::Failed,
            input: Some(json!({ "input": step.input, "config": step.config })),
            output: None,
            error: Some(error.to_string()),
            started_at: now,
            completed_at: Some(now),
            duration_ms: Some(0),
        };
        self.store.create_step_exec(&exec).await?;

        ctx.record_result(
            &step.id,
            StepExecutionResult {
                status: StepStatus::Failed,
                duration_ms: 0,
                output: None,
                error: Some(error.to_string()),
            },
        );

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config interpolation
// ---------------------------------------------------------------------------

/// Rewrite a config tree: strings through lenient substitution, maps and
/// arrays recursed, other scalars untouched. Errors carry the failing key
/// path.
pub(crate) fn interpolate_config(
    config: &Map<String, Value>,
    evaluator: &Evaluator,
) -> Result<Map<String, Value>, String> {
    let mut out = Map::new();
    for (key, value) in config {
        let interpolated = interpolate_value(value, evaluator)
            .map_err(|e| format!("failed to interpolate key '{key}': {e}"))?;
        out.insert(key.clone(), interpolated);
    }
    Ok(out)
}

fn interpolate_value(value: &Value, evaluator: &Evaluator) -> Result<Value, String> {
    match value {
        Value::String(s) => Ok(Value::String(evaluator.evaluate_string(s))),
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, inner) in map {
                let interpolated = interpolate_value(inner, evaluator)
                    .map_err(|e| format!("failed to interpolate map key '{key}': {e}"))?;
                out.insert(key.clone(), interpolated);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (index, item) in items.iter().enumerate() {
                let interpolated = interpolate_value(item, evaluator)
                    .map_err(|e| format!("failed to interpolate array index {index}: {e}"))?;
                out.push(interpolated);
            }
            Ok(Value::Array(out))
        }
        other => Ok(other.clone()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_interpolate_config_rewrites_nested_strings() {
        let mut variables = HashMap::new();
        variables.insert("base".to_string(), json!("https://api.test"));
        variables.insert("token".to_string(), json!("tk-1"));
        let evaluator = Evaluator::new(variables, HashMap::new());

        let config: Map<String, Value> = serde_json::from_value(json!({
            "url": "{{base}}/orders",
            "headers": { "Authorization": "Bearer {{token}}" },
            "retries": 3,
            "tags": ["{{token}}", "static"]
        }))
        .unwrap();

        let out = interpolate_config(&config, &evaluator).unwrap();
        assert_eq!(out["url"], json!("https://api.test/orders"));
        assert_eq!(out["headers"]["Authorization"], json!("Bearer tk-1"));
        assert_eq!(out["retries"], json!(3), "non-strings pass through");
        assert_eq!(out["tags"][0], json!("tk-1"));
    }

    #[test]
    fn test_interpolate_config_leaves_unresolved_fragments() {
        let evaluator = Evaluator::new(HashMap::new(), HashMap::new());
        let config: Map<String, Value> =
            serde_json::from_value(json!({ "url": "{{missing}}/x" })).unwrap();

        let out = interpolate_config(&config, &evaluator).unwrap();
        assert_eq!(out["url"], json!("{{missing}}/x"));
    }
}
