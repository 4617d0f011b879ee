//! Live transport dispatcher: real HTTP requests and shell commands.
//!
//! Implements the `UnifiedActionDispatcher` port consumed by `http`,
//! `command`, and `test-case` steps. Total by contract: every transport
//! failure comes back as an outcome with `passed = false`, never a panic.

use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::time::{Duration, Instant};

use attest_core::repository::dispatch::UnifiedActionDispatcher;
use attest_types::testcase::{DispatchOutcome, DispatchRequest, TestCaseKind};
use serde_json::{json, Value};
use tokio::process::Command;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;

/// Dispatcher backed by a shared `reqwest::Client` and `tokio::process`.
pub struct LiveActionDispatcher {
    http: reqwest::Client,
}

impl LiveActionDispatcher {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent("attest-workflow/0.1")
            .build()
            .unwrap_or_default();
        Self { http }
    }

    async fn dispatch_http(&self, config: &Value) -> DispatchOutcome {
        let start = Instant::now();
        let url = match config.get("url").and_then(Value::as_str) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => return failed_outcome("url is required", start),
        };
        let method_str = config
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("GET");
        let method: reqwest::Method = match method_str.parse() {
            Ok(method) => method,
            Err(_) => return failed_outcome(&format!("invalid HTTP method: {method_str}"), start),
        };

        let mut request = self.http.request(method, &url);
        if let Some(headers) = config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(value) = value.as_str() {
                    request = request.header(key.as_str(), value);
                }
            }
        }
        if let Some(body) = config.get("body") {
            request = match body {
                Value::String(s) => request.body(s.clone()),
                other => request.json(other),
            };
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                return failed_outcome(&format!("HTTP request to '{url}' failed: {e}"), start);
            }
        };

        let status = response.status().as_u16();
        let headers: serde_json::Map<String, Value> = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    json!(v.to_str().unwrap_or("<binary>")),
                )
            })
            .collect();
        let body = response.text().await.unwrap_or_default();
        let parsed_body = serde_json::from_str::<Value>(&body).unwrap_or(json!(body));

        // An explicit expectedStatus overrides the default 2xx check.
        let passed = match config.get("expectedStatus").and_then(Value::as_u64) {
            Some(expected) => u64::from(status) == expected,
            None => (200..300).contains(&status),
        };

        DispatchOutcome {
            passed,
            response: json!({ "status": status, "body": parsed_body, "headers": headers }),
            duration_ms: start.elapsed().as_millis() as u64,
            error: (!passed).then(|| format!("unexpected HTTP status {status}")),
        }
    }

    async fn dispatch_command(&self, config: &Value) -> DispatchOutcome {
        let start = Instant::now();
        let command_line = match config.get("command").and_then(Value::as_str) {
            Some(cmd) if !cmd.is_empty() => cmd.to_string(),
            _ => return failed_outcome("command is required", start),
        };
        let args: Vec<String> = config
            .get("args")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        let timeout_secs = config
            .get("timeout")
            .and_then(Value::as_u64)
            .filter(|t| *t > 0)
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT_SECS);
        let expected_exit = config
            .get("expectedExitCode")
            .and_then(Value::as_i64)
            .unwrap_or(0);

        let mut command = if args.is_empty() {
            let mut shell = Command::new("sh");
            shell.arg("-c").arg(&command_line);
            shell
        } else {
            let mut direct = Command::new(&command_line);
            direct.args(&args);
            direct
        };
        command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                return failed_outcome(&format!("failed to start command: {e}"), start);
            }
        };

        let output = match tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            child.wait_with_output(),
        )
        .await
        {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return failed_outcome(&format!("command failed: {e}"), start),
            Err(_elapsed) => {
                return failed_outcome(
                    &format!("command timeout after {timeout_secs} seconds"),
                    start,
                );
            }
        };

        let exit_code = output.status.code().unwrap_or(-1) as i64;
        let passed = exit_code == expected_exit;

        DispatchOutcome {
            passed,
            response: json!({
                "exitCode": exit_code,
                "stdout": String::from_utf8_lossy(&output.stdout),
                "stderr": String::from_utf8_lossy(&output.stderr),
            }),
            duration_ms: start.elapsed().as_millis() as u64,
            error: (!passed).then(|| format!("command exited with code {exit_code}")),
        }
    }
}

impl Default for LiveActionDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl UnifiedActionDispatcher for LiveActionDispatcher {
    fn dispatch(
        &self,
        request: DispatchRequest,
    ) -> Pin<Box<dyn Future<Output = DispatchOutcome> + Send + '_>> {
        Box::pin(async move {
            tracing::debug!(
                id = request.id.as_str(),
                kind = ?request.kind,
                "dispatching unified action"
            );
            match request.kind {
                TestCaseKind::Http => self.dispatch_http(&request.config).await,
                TestCaseKind::Command => self.dispatch_command(&request.config).await,
            }
        })
    }
}

fn failed_outcome(error: &str, start: Instant) -> DispatchOutcome {
    DispatchOutcome {
        passed: false,
        response: json!({}),
        duration_ms: start.elapsed().as_millis() as u64,
        error: Some(error.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn request(kind: TestCaseKind, config: Value) -> DispatchRequest {
        DispatchRequest {
            id: "step-1".to_string(),
            name: "Step One".to_string(),
            kind,
            config,
        }
    }

    #[tokio::test]
    async fn test_command_success_and_output_capture() {
        let dispatcher = LiveActionDispatcher::new();
        let outcome = dispatcher
            .dispatch(request(
                TestCaseKind::Command,
                json!({ "command": "echo dispatch-ok" }),
            ))
            .await;

        assert!(outcome.passed, "error: {:?}", outcome.error);
        assert_eq!(outcome.response["exitCode"], json!(0));
        assert!(outcome.response["stdout"]
            .as_str()
            .unwrap()
            .contains("dispatch-ok"));
    }

    #[tokio::test]
    async fn test_command_nonzero_exit_fails_unless_expected() {
        let dispatcher = LiveActionDispatcher::new();

        let failing = dispatcher
            .dispatch(request(TestCaseKind::Command, json!({ "command": "exit 4" })))
            .await;
        assert!(!failing.passed);
        assert_eq!(failing.response["exitCode"], json!(4));

        let expected = dispatcher
            .dispatch(request(
                TestCaseKind::Command,
                json!({ "command": "exit 4", "expectedExitCode": 4 }),
            ))
            .await;
        assert!(expected.passed);
    }

    #[tokio::test]
    async fn test_command_timeout() {
        let dispatcher = LiveActionDispatcher::new();
        let outcome = dispatcher
            .dispatch(request(
                TestCaseKind::Command,
                json!({ "command": "sleep 30", "timeout": 1 }),
            ))
            .await;
        assert!(!outcome.passed);
        assert!(outcome.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_http_missing_url_fails_cleanly() {
        let dispatcher = LiveActionDispatcher::new();
        let outcome = dispatcher
            .dispatch(request(TestCaseKind::Http, json!({ "method": "GET" })))
            .await;
        assert!(!outcome.passed);
        assert!(outcome.error.unwrap().contains("url is required"));
    }

    #[tokio::test]
    async fn test_http_unreachable_host_fails_cleanly() {
        let dispatcher = LiveActionDispatcher::new();
        let outcome = dispatcher
            .dispatch(request(
                TestCaseKind::Http,
                json!({ "method": "GET", "url": "http://127.0.0.1:1/nothing" }),
            ))
            .await;
        assert!(!outcome.passed);
        assert!(outcome.error.is_some());
    }
}
