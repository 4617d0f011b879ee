//! The workflow engine: parse, validate, schedule in layers, finalise.
//!
//! `execute` creates exactly one run record, fans each layer out on a
//! `JoinSet` (one task per step), waits for the whole layer, and only then
//! starts the next -- so a layer always observes every write of its
//! predecessors. The first non-continue step failure stops the run after the
//! current layer drains. Validation failures abort before any persistence.

use std::sync::Arc;
use std::time::Instant;

use attest_types::event::WorkflowEvent;
use attest_types::workflow::{
    ExecutionParams, RunStatus, StepStatus, StepSummary, WorkflowResult, WorkflowRun,
};
use chrono::Utc;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::dispatch::UnifiedActionDispatcher;
use crate::repository::environment::VariableInjector;
use crate::repository::testcase::TestCaseRepository;
use crate::repository::workflow::WorkflowStore;

use super::context::ExecutionContext;
use super::dag::build_execution_layers;
use super::definition::{parse_definition, validate_definition, DefinitionSource, WorkflowError};
use super::step_runner::{StepError, StepRunner};
use super::tracking::{StoreChangeTracker, StoreStepLogger};
use super::EngineSettings;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors returned from the engine boundary. Step failures during execution
/// are reported through the `WorkflowResult` (status failed), not here.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("store error: {0}")]
    Store(#[from] attest_types::error::StoreError),

    #[error("step '{step_id}' failed: {error}")]
    StepFailed { step_id: String, error: String },

    #[error("workflow not found: {0}")]
    NotFound(String),
}

impl From<StepError> for EngineError {
    fn from(e: StepError) -> Self {
        match e {
            StepError::Failed { step_id, error } => EngineError::StepFailed { step_id, error },
            StepError::Store(e) => EngineError::Store(e),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Layer-scheduled workflow executor, generic over the persistence store.
pub struct WorkflowEngine<S: WorkflowStore> {
    store: Arc<S>,
    events: EventBus,
    dispatcher: Option<Arc<dyn UnifiedActionDispatcher>>,
    test_cases: Option<Arc<dyn TestCaseRepository>>,
    injector: Option<Arc<dyn VariableInjector>>,
    settings: EngineSettings,
}

impl<S: WorkflowStore + 'static> WorkflowEngine<S> {
    pub fn new(store: Arc<S>) -> Self {
        let settings = EngineSettings::default();
        Self {
            store,
            events: EventBus::new(settings.event_capacity),
            dispatcher: None,
            test_cases: None,
            injector: None,
            settings,
        }
    }

    /// Wire the live transport dispatcher for `http`/`command`/`test-case`.
    pub fn with_dispatcher(mut self, dispatcher: Arc<dyn UnifiedActionDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_test_cases(mut self, repo: Arc<dyn TestCaseRepository>) -> Self {
        self.test_cases = Some(repo);
        self
    }

    pub fn with_variable_injector(mut self, injector: Arc<dyn VariableInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.events = EventBus::new(settings.event_capacity);
        self.settings = settings;
        self
    }

    /// The bus carrying run/step/loop lifecycle events.
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Load a stored definition by id and execute it.
    pub async fn execute_stored(
        &self,
        workflow_id: &str,
        params: &ExecutionParams,
    ) -> Result<WorkflowResult, EngineError> {
        let def = self
            .store
            .get_definition(workflow_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(workflow_id.to_string()))?;
        self.execute(workflow_id, DefinitionSource::Typed(def), params).await
    }

    /// Run a workflow to completion.
    ///
    /// Returns `Err` for definition/validation/persistence problems that
    /// precede execution; once steps run, failures come back as a result
    /// with `status: failed`.
    pub async fn execute(
        &self,
        workflow_id: &str,
        definition: impl Into<DefinitionSource>,
        params: &ExecutionParams,
    ) -> Result<WorkflowResult, EngineError> {
        let def = parse_definition(workflow_id, definition.into())?;
        validate_definition(&def)?;
        let layers = build_execution_layers(&def.steps)?;

        let run_id = Uuid::now_v7();
        let ctx = ExecutionContext::new(
            run_id,
            Arc::new(StoreStepLogger::new(run_id, Arc::clone(&self.store))),
            Arc::new(StoreChangeTracker::new(run_id, Arc::clone(&self.store))),
        );

        // Variable layering: environment base, workflow definition, then
        // per-execution overrides. An unavailable environment is logged and
        // skipped, not fatal.
        if let Some(injector) = &self.injector {
            match injector
                .active_environment_variables(&params.tenant_id, &params.project_id)
                .await
            {
                Ok(env_vars) => ctx.overlay_variables(&env_vars),
                Err(e) => {
                    tracing::warn!(
                        run_id = %run_id,
                        error = %e,
                        "failed to load environment variables; continuing without them"
                    );
                }
            }
        }
        ctx.overlay_variables(&def.variables);
        if let Some(overrides) = &params.variables {
            ctx.overlay_variables(overrides);
        }

        let started_at = Utc::now();
        let mut run = WorkflowRun {
            id: run_id,
            workflow_id: workflow_id.to_string(),
            tenant_id: params.tenant_id.clone(),
            project_id: params.project_id.clone(),
            status: RunStatus::Running,
            started_at,
            completed_at: None,
            duration_ms: None,
            context: ctx.context_blob(),
            error: None,
        };
        self.store.create_run(&run).await?;

        self.events.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow_id: workflow_id.to_string(),
        });
        tracing::info!(
            run_id = %run_id,
            workflow = def.name.as_str(),
            steps = def.steps.len(),
            "starting workflow execution"
        );

        let runner = Arc::new(StepRunner::new(
            Arc::clone(&self.store),
            self.events.clone(),
            self.dispatcher.clone(),
            self.test_cases.clone(),
            self.settings.clone(),
        ));

        let start = Instant::now();
        let mut exec_error: Option<EngineError> = None;

        for (layer_index, layer) in layers.iter().enumerate() {
            tracing::debug!(
                run_id = %run_id,
                layer = layer_index,
                steps = layer.len(),
                "processing layer"
            );

            let mut join_set = JoinSet::new();
            for step_id in layer {
                let Some(step) = def.steps.get(step_id) else {
                    continue;
                };
                let step = step.clone();
                let runner = Arc::clone(&runner);
                let step_ctx = ctx.clone();
                join_set.spawn(async move { runner.run(&step, &step_ctx).await });
            }

            // The whole layer drains before the first error is acted on.
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if exec_error.is_none() {
                            exec_error = Some(e.into());
                        }
                    }
                    Err(join_err) => {
                        if exec_error.is_none() {
                            exec_error = Some(EngineError::Workflow(
                                WorkflowError::ExecutionError(format!(
                                    "task join error: {join_err}"
                                )),
                            ));
                        }
                    }
                }
            }

            if exec_error.is_some() {
                break;
            }
        }

        let duration_ms = start.elapsed().as_millis() as u64;
        run.completed_at = Some(Utc::now());
        run.duration_ms = Some(duration_ms);
        run.context = ctx.context_blob();
        match &exec_error {
            Some(e) => {
                run.status = RunStatus::Failed;
                run.error = Some(e.to_string());
            }
            None => run.status = RunStatus::Success,
        }
        self.store.update_run(&run).await?;

        match &exec_error {
            Some(e) => {
                self.events.publish(WorkflowEvent::RunFailed {
                    run_id,
                    error: e.to_string(),
                });
                tracing::warn!(run_id = %run_id, error = %e, "workflow run failed");
            }
            None => {
                self.events.publish(WorkflowEvent::RunCompleted {
                    run_id,
                    status: RunStatus::Success,
                    duration: duration_ms,
                });
                tracing::info!(run_id = %run_id, duration_ms, "workflow run completed");
            }
        }

        Ok(build_result(&run, &ctx))
    }
}

/// Project the in-memory step results into the returned summary.
fn build_result(run: &WorkflowRun, ctx: &ExecutionContext) -> WorkflowResult {
    let mut step_executions: Vec<StepSummary> = ctx
        .step_results
        .iter()
        .map(|entry| StepSummary {
            step_id: entry.key().clone(),
            status: entry.value().status,
            duration_ms: entry.value().duration_ms,
            output: entry.value().output.clone(),
            error: entry.value().error.clone(),
        })
        .collect();
    step_executions.sort_by(|a, b| a.step_id.cmp(&b.step_id));

    let completed_steps = step_executions
        .iter()
        .filter(|s| s.status == StepStatus::Success)
        .count();
    let failed_steps = step_executions
        .iter()
        .filter(|s| s.status == StepStatus::Failed)
        .count();

    WorkflowResult {
        run_id: run.id,
        status: run.status,
        started_at: run.started_at,
        completed_at: run.completed_at.unwrap_or(run.started_at),
        duration_ms: run.duration_ms.unwrap_or(0),
        total_steps: step_executions.len(),
        completed_steps,
        failed_steps,
        step_executions,
        context: run.context.clone(),
        error: run.error.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
