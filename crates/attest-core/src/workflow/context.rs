//! Per-run execution context: variables, step outputs, step results.
//!
//! The context is the mutable state of one run. The maps live behind
//! `Arc<DashMap>` so the scheduler can hand the same context to every step
//! task in a layer: siblings write disjoint keys (same-key writes from
//! siblings are a workflow-authoring bug with an undefined winner), and the
//! layer barrier makes all writes visible to the next layer. Parallel loop
//! iterations get a forked variable map so loop bindings cannot race.

use std::collections::HashMap;
use std::sync::Arc;

use attest_types::workflow::{ChangeKind, StepDefinition, StepExecutionResult};
use dashmap::DashMap;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use super::expression::Evaluator;
use super::tracking::{StepLogger, VariableChangeTracker};

/// Mutable state carried through one workflow run.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: Uuid,
    /// Named workflow variables (environment base + workflow + overrides).
    pub variables: Arc<DashMap<String, Value>>,
    /// One entry per successfully completed step, keyed by step id.
    pub step_outputs: Arc<DashMap<String, Value>>,
    /// Latest in-memory result per step id (success/failed/skipped).
    pub step_results: Arc<DashMap<String, StepExecutionResult>>,
    pub logger: Arc<dyn StepLogger>,
    pub tracker: Arc<dyn VariableChangeTracker>,
}

impl ExecutionContext {
    pub fn new(
        run_id: Uuid,
        logger: Arc<dyn StepLogger>,
        tracker: Arc<dyn VariableChangeTracker>,
    ) -> Self {
        Self {
            run_id,
            variables: Arc::new(DashMap::new()),
            step_outputs: Arc::new(DashMap::new()),
            step_results: Arc::new(DashMap::new()),
            logger,
            tracker,
        }
    }

    /// Lay a variable map over the current one; later layers win on collision.
    ///
    /// Called in order with environment variables, workflow variables, and
    /// per-execution overrides. Initial seeding is not change-tracked.
    pub fn overlay_variables(&self, vars: &HashMap<String, Value>) {
        for (key, value) in vars {
            self.variables.insert(key.clone(), value.clone());
        }
    }

    /// Build an evaluator over snapshots of the current maps.
    ///
    /// Reads race-free by construction: the scheduler only evaluates between
    /// the writes of one layer and the reads of the next, or inside a single
    /// step's own task.
    pub fn evaluator(&self) -> Evaluator {
        Evaluator::new(self.snapshot_variables(), self.snapshot_outputs())
    }

    /// Evaluator with `$prev` bound to the output of the step's most recent
    /// listed dependency, when that dependency produced one.
    pub fn evaluator_for_step(&self, step: &StepDefinition) -> Evaluator {
        let prev = step
            .depends_on
            .iter()
            .rev()
            .find_map(|dep| self.step_outputs.get(dep).map(|v| v.value().clone()));
        self.evaluator().with_prev(prev)
    }

    pub fn snapshot_variables(&self) -> HashMap<String, Value> {
        self.variables
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    pub fn snapshot_outputs(&self) -> HashMap<String, Value> {
        self.step_outputs
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Record a completed step's output (exactly once per successful step).
    pub fn set_step_output(&self, step_id: &str, output: Value) {
        self.step_outputs.insert(step_id.to_string(), output);
    }

    pub fn record_result(&self, step_id: &str, result: StepExecutionResult) {
        self.step_results.insert(step_id.to_string(), result);
    }

    /// Apply a step's output mapping (`output key -> variable name`) and emit
    /// one change record per assigned variable. Output keys absent from the
    /// action result are skipped silently.
    pub async fn apply_output_mapping(
        &self,
        step: &StepDefinition,
        output: &Map<String, Value>,
    ) {
        let Some(mapping) = &step.output else {
            return;
        };

        for (output_key, variable_name) in mapping {
            let Some(value) = output.get(output_key) else {
                continue;
            };
            let old = self
                .variables
                .insert(variable_name.clone(), value.clone());
            let kind = if old.is_some() {
                ChangeKind::Update
            } else {
                ChangeKind::Create
            };
            self.tracker
                .track(&step.id, variable_name, old, Some(value.clone()), kind)
                .await;
        }
    }

    /// Remove loop-scoped bindings after a loop finishes. Scoped bindings are
    /// not change-tracked.
    pub fn remove_variables(&self, names: &[&str]) {
        for name in names {
            self.variables.remove(*name);
        }
    }

    /// Fork for a parallel loop iteration: own copy of the variables, shared
    /// outputs and results.
    pub fn fork_variables(&self) -> Self {
        let forked = DashMap::new();
        for entry in self.variables.iter() {
            forked.insert(entry.key().clone(), entry.value().clone());
        }
        Self {
            run_id: self.run_id,
            variables: Arc::new(forked),
            step_outputs: Arc::clone(&self.step_outputs),
            step_results: Arc::clone(&self.step_results),
            logger: Arc::clone(&self.logger),
            tracker: Arc::clone(&self.tracker),
        }
    }

    /// The `{variables, outputs}` snapshot persisted with the run record.
    pub fn context_blob(&self) -> Value {
        json!({
            "variables": self.snapshot_variables(),
            "outputs": self.snapshot_outputs(),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tracking::test_support::{NullLogger, RecordingTracker};
    use attest_types::workflow::StepStatus;
    use serde_json::json;

    fn context_with_tracker() -> (ExecutionContext, Arc<RecordingTracker>) {
        let tracker = Arc::new(RecordingTracker::default());
        let ctx = ExecutionContext::new(
            Uuid::now_v7(),
            Arc::new(NullLogger),
            tracker.clone(),
        );
        (ctx, tracker)
    }

    fn make_step(output: &[(&str, &str)]) -> StepDefinition {
        StepDefinition {
            id: "login".to_string(),
            name: "Login".to_string(),
            output: Some(
                output
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_overlay_later_layers_win() {
        let (ctx, _) = context_with_tracker();
        ctx.overlay_variables(&HashMap::from([
            ("env".to_string(), json!("staging")),
            ("region".to_string(), json!("eu")),
        ]));
        ctx.overlay_variables(&HashMap::from([("env".to_string(), json!("prod"))]));

        let vars = ctx.snapshot_variables();
        assert_eq!(vars["env"], json!("prod"));
        assert_eq!(vars["region"], json!("eu"));
    }

    #[tokio::test]
    async fn test_output_mapping_assigns_and_tracks_create() {
        let (ctx, tracker) = context_with_tracker();
        let step = make_step(&[("token", "authToken")]);

        let mut output = Map::new();
        output.insert("token".to_string(), json!("tk-1"));
        ctx.apply_output_mapping(&step, &output).await;

        assert_eq!(ctx.snapshot_variables()["authToken"], json!("tk-1"));
        let changes = tracker.changes();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].variable_name, "authToken");
        assert_eq!(changes[0].change_kind, ChangeKind::Create);
        assert_eq!(changes[0].new_value, Some(json!("tk-1")));
        assert_eq!(changes[0].old_value, None);
    }

    #[tokio::test]
    async fn test_output_mapping_tracks_update_with_old_value() {
        let (ctx, tracker) = context_with_tracker();
        ctx.overlay_variables(&HashMap::from([("authToken".to_string(), json!("old"))]));
        let step = make_step(&[("token", "authToken")]);

        let mut output = Map::new();
        output.insert("token".to_string(), json!("new"));
        ctx.apply_output_mapping(&step, &output).await;

        let changes = tracker.changes();
        assert_eq!(changes[0].change_kind, ChangeKind::Update);
        assert_eq!(changes[0].old_value, Some(json!("old")));
    }

    #[tokio::test]
    async fn test_output_mapping_skips_missing_keys() {
        let (ctx, tracker) = context_with_tracker();
        let step = make_step(&[("missing", "never")]);

        ctx.apply_output_mapping(&step, &Map::new()).await;

        assert!(ctx.snapshot_variables().is_empty());
        assert!(tracker.changes().is_empty());
    }

    #[test]
    fn test_fork_isolates_variables_shares_outputs() {
        let (ctx, _) = context_with_tracker();
        ctx.overlay_variables(&HashMap::from([("x".to_string(), json!(1))]));

        let fork = ctx.fork_variables();
        fork.variables.insert("x".to_string(), json!(2));
        fork.set_step_output("s1", json!({ "ok": true }));

        assert_eq!(ctx.snapshot_variables()["x"], json!(1));
        assert_eq!(fork.snapshot_variables()["x"], json!(2));
        // Outputs are shared both ways.
        assert_eq!(ctx.snapshot_outputs()["s1"], json!({ "ok": true }));
    }

    #[test]
    fn test_evaluator_for_step_binds_prev_from_last_dependency() {
        let (ctx, _) = context_with_tracker();
        ctx.set_step_output("a", json!({ "from": "a" }));
        ctx.set_step_output("b", json!({ "from": "b" }));

        let step = StepDefinition {
            id: "c".to_string(),
            depends_on: vec!["a".to_string(), "b".to_string()],
            ..Default::default()
        };
        let eval = ctx.evaluator_for_step(&step);
        assert_eq!(eval.evaluate("{{$prev.from}}").unwrap(), json!("b"));
    }

    #[test]
    fn test_context_blob_shape() {
        let (ctx, _) = context_with_tracker();
        ctx.overlay_variables(&HashMap::from([("k".to_string(), json!("v"))]));
        ctx.set_step_output("s", json!(1));
        ctx.record_result(
            "s",
            StepExecutionResult {
                status: StepStatus::Success,
                duration_ms: 5,
                output: Some(json!(1)),
                error: None,
            },
        );

        let blob = ctx.context_blob();
        assert_eq!(blob["variables"]["k"], json!("v"));
        assert_eq!(blob["outputs"]["s"], json!(1));
    }
}
