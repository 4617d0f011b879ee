//! The action layer: typed wrappers over the six step kinds.
//!
//! A step's `type` selects an [`Action`] variant; `execute` validates the
//! required config keys, performs the transport-specific work, and produces a
//! uniform [`ActionResult`]. Actions are total over their input: in-band
//! failures come back as `status: failed`, never as a panic or `Err`, so the
//! step runner can record every outcome the same way.
//!
//! `http` and `command` (and `test-case`, which re-enters the same path)
//! delegate the transport itself to the `UnifiedActionDispatcher` port;
//! `database`, `script`, and `assert` are implemented in-engine.

mod assert;
mod database;
mod script;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use attest_types::testcase::{DispatchRequest, TestCaseKind};
use attest_types::workflow::{StepDefinition, StepType};
use serde_json::{json, Map, Value};

use crate::repository::dispatch::UnifiedActionDispatcher;
use crate::repository::testcase::TestCaseRepository;
use crate::workflow::tracking::StepLogger;

// ---------------------------------------------------------------------------
// ActionResult
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionStatus {
    Success,
    Failed,
}

/// Uniform result of one action dispatch.
#[derive(Debug, Clone)]
pub struct ActionResult {
    pub status: ActionStatus,
    pub output: Map<String, Value>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ActionResult {
    pub fn success(output: Map<String, Value>) -> Self {
        Self {
            status: ActionStatus::Success,
            output,
            error: None,
            duration_ms: 0,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ActionStatus::Failed,
            output: Map::new(),
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    pub fn failed_with_output(error: impl Into<String>, output: Map<String, Value>) -> Self {
        Self {
            status: ActionStatus::Failed,
            output,
            error: Some(error.into()),
            duration_ms: 0,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ActionStatus::Success
    }
}

// ---------------------------------------------------------------------------
// ActionContext
// ---------------------------------------------------------------------------

/// Everything an action may need from the running step's surroundings.
pub struct ActionContext<'a> {
    pub step_id: &'a str,
    pub step_name: &'a str,
    /// Variable snapshot (script context injection, assert resolution).
    pub variables: HashMap<String, Value>,
    /// Step output snapshot.
    pub step_outputs: HashMap<String, Value>,
    pub dispatcher: Option<&'a Arc<dyn UnifiedActionDispatcher>>,
    pub test_cases: Option<&'a Arc<dyn TestCaseRepository>>,
    pub logger: &'a Arc<dyn StepLogger>,
    /// Whether a missing dispatcher yields a mock success (unit-test mode).
    pub allow_mock_dispatch: bool,
}

// ---------------------------------------------------------------------------
// Action
// ---------------------------------------------------------------------------

/// The tagged variant over the six built-in action kinds.
#[derive(Debug, Clone)]
pub enum Action {
    Http { config: Map<String, Value> },
    Command { config: Map<String, Value> },
    Database { config: Map<String, Value> },
    Script { config: Map<String, Value> },
    Assert { config: Map<String, Value> },
    TestCase { test_id: String },
}

impl Action {
    /// Build the action for a step from its interpolated config.
    pub fn for_step(
        step: &StepDefinition,
        config: Map<String, Value>,
    ) -> Result<Self, String> {
        match step.step_type {
            StepType::Http => Ok(Action::Http { config }),
            StepType::Command => Ok(Action::Command { config }),
            StepType::Database => Ok(Action::Database { config }),
            StepType::Script => Ok(Action::Script { config }),
            StepType::Assert => Ok(Action::Assert { config }),
            StepType::TestCase => {
                let test_id = config
                    .get("testId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| "testId not specified for test-case step".to_string())?;
                Ok(Action::TestCase { test_id })
            }
        }
    }

    /// Run the action to completion. Total: failures are in-band.
    pub async fn execute(&self, ctx: &ActionContext<'_>) -> ActionResult {
        let start = Instant::now();
        let mut result = match self {
            Action::Http { config } => {
                dispatch_unified(ctx, TestCaseKind::Http, Value::Object(config.clone())).await
            }
            Action::Command { config } => {
                dispatch_unified(ctx, TestCaseKind::Command, Value::Object(config.clone())).await
            }
            Action::Database { config } => database::execute(ctx, config).await,
            Action::Script { config } => script::execute(ctx, config).await,
            Action::Assert { config } => assert::execute(ctx, config).await,
            Action::TestCase { test_id } => run_test_case(ctx, test_id).await,
        };
        if result.duration_ms == 0 {
            result.duration_ms = start.elapsed().as_millis() as u64;
        }
        result
    }
}

// ---------------------------------------------------------------------------
// http / command / test-case dispatch
// ---------------------------------------------------------------------------

/// Hand a transport request to the unified dispatcher and map the outcome.
///
/// Without a dispatcher this returns a mock success when the engine allows it
/// (unit-test mode) and a failure otherwise.
async fn dispatch_unified(
    ctx: &ActionContext<'_>,
    kind: TestCaseKind,
    config: Value,
) -> ActionResult {
    let Some(dispatcher) = ctx.dispatcher else {
        if ctx.allow_mock_dispatch {
            let mut output = Map::new();
            output.insert("mock".to_string(), json!(true));
            output.insert("status".to_string(), json!("passed"));
            return ActionResult::success(output);
        }
        return ActionResult::failed("no action dispatcher configured");
    };

    let request = DispatchRequest {
        id: ctx.step_id.to_string(),
        name: ctx.step_name.to_string(),
        kind,
        config,
    };

    let outcome = dispatcher.dispatch(request).await;

    let mut output = Map::new();
    output.insert(
        "status".to_string(),
        json!(if outcome.passed { "passed" } else { "failed" }),
    );
    output.insert("response".to_string(), outcome.response);

    if outcome.passed {
        let mut result = ActionResult::success(output);
        result.duration_ms = outcome.duration_ms;
        result
    } else {
        let error = outcome
            .error
            .unwrap_or_else(|| "dispatch failed".to_string());
        let mut result = ActionResult::failed_with_output(error, output);
        result.duration_ms = outcome.duration_ms;
        result
    }
}

/// Load a stored test case and re-enter the dispatch path with its config.
async fn run_test_case(ctx: &ActionContext<'_>, test_id: &str) -> ActionResult {
    ctx.logger
        .info(ctx.step_id, &format!("Executing test case: {test_id}"))
        .await;

    let Some(repo) = ctx.test_cases else {
        return ActionResult::failed("test case repository not configured");
    };

    let case = match repo.get_test_case(test_id).await {
        Ok(Some(case)) => case,
        Ok(None) => return ActionResult::failed(format!("test case not found: {test_id}")),
        Err(e) => return ActionResult::failed(format!("failed to load test case: {e}")),
    };

    dispatch_unified(ctx, case.kind, Value::Object(case.config)).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tracking::test_support::NullLogger;
    use attest_types::testcase::{DispatchOutcome, TestCase};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    fn ctx<'a>(logger: &'a Arc<dyn StepLogger>) -> ActionContext<'a> {
        ActionContext {
            step_id: "step-1",
            step_name: "Step One",
            variables: HashMap::new(),
            step_outputs: HashMap::new(),
            dispatcher: None,
            test_cases: None,
            logger,
            allow_mock_dispatch: true,
        }
    }

    /// Dispatcher stub returning a canned outcome and recording requests.
    struct StubDispatcher {
        outcome: DispatchOutcome,
        requests: Mutex<Vec<DispatchRequest>>,
    }

    impl StubDispatcher {
        fn passing() -> Self {
            Self {
                outcome: DispatchOutcome {
                    passed: true,
                    response: json!({ "status": 200 }),
                    duration_ms: 12,
                    error: None,
                },
                requests: Mutex::new(vec![]),
            }
        }

        fn failing(error: &str) -> Self {
            Self {
                outcome: DispatchOutcome {
                    passed: false,
                    response: json!({ "status": 500 }),
                    duration_ms: 3,
                    error: Some(error.to_string()),
                },
                requests: Mutex::new(vec![]),
            }
        }
    }

    impl UnifiedActionDispatcher for StubDispatcher {
        fn dispatch(
            &self,
            request: DispatchRequest,
        ) -> Pin<Box<dyn Future<Output = DispatchOutcome> + Send + '_>> {
            self.requests.lock().unwrap().push(request);
            let outcome = self.outcome.clone();
            Box::pin(async move { outcome })
        }
    }

    struct StubTestCases(TestCase);

    impl TestCaseRepository for StubTestCases {
        fn get_test_case(
            &self,
            test_id: &str,
        ) -> Pin<Box<dyn Future<Output = Result<Option<TestCase>, attest_types::error::StoreError>> + Send + '_>>
        {
            let found = (test_id == self.0.id).then(|| self.0.clone());
            Box::pin(async move { Ok(found) })
        }
    }

    #[tokio::test]
    async fn test_http_without_dispatcher_mocks_success() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = ctx(&logger);
        let action = Action::Http { config: Map::new() };

        let result = action.execute(&ctx).await;
        assert!(result.is_success());
        assert_eq!(result.output["mock"], json!(true));
    }

    #[tokio::test]
    async fn test_mock_fallback_can_be_disabled() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let mut ctx = ctx(&logger);
        ctx.allow_mock_dispatch = false;
        let action = Action::Command { config: Map::new() };

        let result = action.execute(&ctx).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("dispatcher"));
    }

    #[tokio::test]
    async fn test_http_maps_passed_outcome() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let dispatcher: Arc<dyn UnifiedActionDispatcher> = Arc::new(StubDispatcher::passing());
        let mut ctx = ctx(&logger);
        ctx.dispatcher = Some(&dispatcher);

        let mut config = Map::new();
        config.insert("url".to_string(), json!("https://api.test/health"));
        let action = Action::Http { config };

        let result = action.execute(&ctx).await;
        assert!(result.is_success());
        assert_eq!(result.output["status"], json!("passed"));
        assert_eq!(result.output["response"]["status"], json!(200));
        assert_eq!(result.duration_ms, 12);
    }

    #[tokio::test]
    async fn test_command_maps_failed_outcome() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let dispatcher: Arc<dyn UnifiedActionDispatcher> =
            Arc::new(StubDispatcher::failing("exit code 2"));
        let mut ctx = ctx(&logger);
        ctx.dispatcher = Some(&dispatcher);

        let action = Action::Command { config: Map::new() };
        let result = action.execute(&ctx).await;
        assert!(!result.is_success());
        assert_eq!(result.error.as_deref(), Some("exit code 2"));
        assert_eq!(result.output["status"], json!("failed"));
    }

    #[tokio::test]
    async fn test_test_case_reenters_dispatch_with_case_config() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let dispatcher = Arc::new(StubDispatcher::passing());
        let dispatcher_dyn: Arc<dyn UnifiedActionDispatcher> = dispatcher.clone();
        let mut case_config = Map::new();
        case_config.insert("command".to_string(), json!("echo hello"));
        let repo: Arc<dyn TestCaseRepository> = Arc::new(StubTestCases(TestCase {
            id: "TC-9".to_string(),
            name: "Echo".to_string(),
            kind: TestCaseKind::Command,
            config: case_config,
        }));

        let mut ctx = ctx(&logger);
        ctx.dispatcher = Some(&dispatcher_dyn);
        ctx.test_cases = Some(&repo);

        let action = Action::TestCase { test_id: "TC-9".to_string() };
        let result = action.execute(&ctx).await;
        assert!(result.is_success());

        let requests = dispatcher.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].kind, TestCaseKind::Command);
        assert_eq!(requests[0].config["command"], json!("echo hello"));
    }

    #[tokio::test]
    async fn test_test_case_missing_id_fails_at_build() {
        let step = StepDefinition {
            id: "tc".to_string(),
            step_type: StepType::TestCase,
            ..Default::default()
        };
        let err = Action::for_step(&step, Map::new()).unwrap_err();
        assert!(err.contains("testId"));
    }

    #[tokio::test]
    async fn test_unknown_test_case_fails() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let repo: Arc<dyn TestCaseRepository> = Arc::new(StubTestCases(TestCase {
            id: "TC-1".to_string(),
            name: "X".to_string(),
            kind: TestCaseKind::Http,
            config: Map::new(),
        }));
        let mut ctx = ctx(&logger);
        ctx.test_cases = Some(&repo);

        let action = Action::TestCase { test_id: "TC-404".to_string() };
        let result = action.execute(&ctx).await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("TC-404"));
    }
}
