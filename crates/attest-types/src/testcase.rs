//! Test-case library types and the unified dispatcher contract.
//!
//! A stored test case is a named, parameterised single-step workflow: its
//! `config` is the same free-form JSON an `http` or `command` step carries.
//! The `test-case` action loads one by id and re-enters the same dispatch
//! path the plain step kinds use.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A persisted test case from the test-case library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    /// External test id (e.g. "TC-1042").
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TestCaseKind,
    /// Transport configuration, same shape as the matching step config.
    #[serde(default)]
    pub config: Map<String, Value>,
}

/// The transports a stored test case can exercise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestCaseKind {
    Http,
    Command,
}

/// A request handed to the `UnifiedActionDispatcher` port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRequest {
    /// Step or test-case id, for logging and correlation.
    pub id: String,
    pub name: String,
    pub kind: TestCaseKind,
    /// Interpolated transport configuration.
    pub config: Value,
}

/// What the dispatcher observed for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchOutcome {
    /// Whether the transport-level check passed.
    pub passed: bool,
    /// Transport response payload (HTTP status/body, command stdout, …).
    pub response: Value,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
