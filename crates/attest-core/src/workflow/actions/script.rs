//! The `script` action: run a python, javascript, or shell snippet in a
//! child process.
//!
//! The body is written to a temporary file (deleted on every exit path) or an
//! existing `file` path is used directly. For python and javascript the merged
//! variable/output context is injected as a JSON literal at the top of the
//! script. Stdout that parses as JSON is exposed under `output`. A timeout
//! (default 30 s) kills the child.
//!
//! A non-zero exit code is reported in the output (`success: false`,
//! `exitCode`) without failing the action; only spawn errors and timeouts do.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::process::Command;

use super::{ActionContext, ActionResult};

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub(super) async fn execute(ctx: &ActionContext<'_>, config: &Map<String, Value>) -> ActionResult {
    let language = match config.get("language").and_then(Value::as_str) {
        Some(l) if !l.is_empty() => l.to_lowercase(),
        _ => return ActionResult::failed("language is required"),
    };
    let script = config.get("script").and_then(Value::as_str).unwrap_or("");
    let file = config.get("file").and_then(Value::as_str).unwrap_or("");
    if script.is_empty() && file.is_empty() {
        return ActionResult::failed("either script or file must be provided");
    }
    if !file.is_empty() && !std::path::Path::new(file).exists() {
        return ActionResult::failed(format!("script file not found: {file}"));
    }

    let timeout_secs = config
        .get("timeout")
        .and_then(Value::as_u64)
        .filter(|t| *t > 0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);

    let args: Vec<String> = config
        .get("args")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .map(crate::workflow::expression::format_value)
                .collect()
        })
        .unwrap_or_default();

    let env: HashMap<String, String> = config
        .get("env")
        .and_then(Value::as_object)
        .map(|map| {
            map.iter()
                .map(|(k, v)| (k.clone(), crate::workflow::expression::format_value(v)))
                .collect()
        })
        .unwrap_or_default();

    let interpreter = match language.as_str() {
        "python" | "python3" => "python3",
        "javascript" | "js" | "node" => "node",
        "shell" | "bash" | "sh" => "bash",
        other => return ActionResult::failed(format!("unsupported language: {other}")),
    };

    // Keep the temp file handle alive until the child exits; dropping it
    // removes the file on every path out of this function.
    let mut temp_file = None;
    let script_path = if !file.is_empty() {
        file.to_string()
    } else {
        let body = inject_context(&language, script, ctx);
        let suffix = match interpreter {
            "python3" => ".py",
            "node" => ".js",
            _ => ".sh",
        };
        let tmp = match tempfile::Builder::new()
            .prefix("attest-script-")
            .suffix(suffix)
            .tempfile()
        {
            Ok(tmp) => tmp,
            Err(e) => return ActionResult::failed(format!("failed to create script file: {e}")),
        };
        if let Err(e) = std::fs::write(tmp.path(), body) {
            return ActionResult::failed(format!("failed to write script file: {e}"));
        }
        let path = tmp.path().to_string_lossy().to_string();
        temp_file = Some(tmp);
        path
    };

    let mut command = Command::new(interpreter);
    command
        .arg(&script_path)
        .args(&args)
        .envs(&env)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => return ActionResult::failed(format!("failed to start script: {e}")),
    };

    let waited = tokio::time::timeout(
        Duration::from_secs(timeout_secs),
        child.wait_with_output(),
    )
    .await;
    drop(temp_file);

    let output = match waited {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return ActionResult::failed(format!("script execution failed: {e}")),
        // Dropping the timed-out future kills the child (kill_on_drop).
        Err(_elapsed) => {
            return ActionResult::failed(format!(
                "script execution timeout after {timeout_secs} seconds"
            ));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let success = output.status.success();

    let mut result = Map::new();
    result.insert("stdout".to_string(), json!(stdout));
    result.insert("stderr".to_string(), json!(stderr));
    result.insert("success".to_string(), json!(success));
    result.insert(
        "exitCode".to_string(),
        json!(output.status.code().unwrap_or(-1)),
    );
    if !success {
        result.insert(
            "error".to_string(),
            json!(format!("script exited with {}", output.status)),
        );
    }

    let trimmed = stdout.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        if let Ok(parsed) = serde_json::from_str::<Value>(trimmed) {
            result.insert("output".to_string(), parsed);
        }
    }

    ActionResult::success(result)
}

/// Prepend the merged variable/output context for languages that can read it.
/// Step outputs win over variables on key collision.
fn inject_context(language: &str, script: &str, ctx: &ActionContext<'_>) -> String {
    let needs_context = matches!(
        language,
        "python" | "python3" | "javascript" | "js" | "node"
    );
    if !needs_context {
        return script.to_string();
    }

    let mut merged = Map::new();
    for (k, v) in &ctx.variables {
        merged.insert(k.clone(), v.clone());
    }
    for (k, v) in &ctx.step_outputs {
        merged.insert(k.clone(), v.clone());
    }
    let context_json = serde_json::to_string(&Value::Object(merged)).unwrap_or_default();

    match language {
        "python" | "python3" => {
            format!("import json\ncontext = json.loads('''{context_json}''')\n{script}")
        }
        _ => format!("const context = {context_json};\n{script}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::tracking::test_support::NullLogger;
    use crate::workflow::tracking::StepLogger;
    use std::sync::Arc;

    fn test_ctx<'a>(logger: &'a Arc<dyn StepLogger>) -> ActionContext<'a> {
        let mut variables = HashMap::new();
        variables.insert("greeting".to_string(), json!("hello"));
        let mut outputs = HashMap::new();
        outputs.insert("login".to_string(), json!({ "status": 200 }));
        ActionContext {
            step_id: "script-step",
            step_name: "Script Step",
            variables,
            step_outputs: outputs,
            dispatcher: None,
            test_cases: None,
            logger,
            allow_mock_dispatch: true,
        }
    }

    fn config(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn test_shell_script_captures_stdout() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let result = execute(
            &ctx,
            &config(&[
                ("language", json!("shell")),
                ("script", json!("echo workflow-ok")),
            ]),
        )
        .await;
        assert!(result.is_success(), "failed: {:?}", result.error);
        assert_eq!(result.output["exitCode"], json!(0));
        assert!(result.output["stdout"]
            .as_str()
            .unwrap()
            .contains("workflow-ok"));
    }

    #[tokio::test]
    async fn test_json_stdout_is_exposed_as_output() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let result = execute(
            &ctx,
            &config(&[
                ("language", json!("bash")),
                ("script", json!(r#"echo '{"count": 3}'"#)),
            ]),
        )
        .await;
        assert!(result.is_success());
        assert_eq!(result.output["output"]["count"], json!(3));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reported_without_failing_action() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let result = execute(
            &ctx,
            &config(&[("language", json!("sh")), ("script", json!("exit 3"))]),
        )
        .await;
        assert!(result.is_success());
        assert_eq!(result.output["success"], json!(false));
        assert_eq!(result.output["exitCode"], json!(3));
    }

    #[tokio::test]
    async fn test_timeout_kills_child_and_fails() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let result = execute(
            &ctx,
            &config(&[
                ("language", json!("shell")),
                ("script", json!("sleep 30")),
                ("timeout", json!(1)),
            ]),
        )
        .await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_missing_language_fails() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let result = execute(&ctx, &config(&[("script", json!("echo hi"))])).await;
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_missing_file_fails() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let result = execute(
            &ctx,
            &config(&[
                ("language", json!("shell")),
                ("file", json!("/nonexistent/script.sh")),
            ]),
        )
        .await;
        assert!(!result.is_success());
        assert!(result.error.unwrap().contains("not found"));
    }

    #[test]
    fn test_context_injection_python_and_js() {
        let logger: Arc<dyn StepLogger> = Arc::new(NullLogger);
        let ctx = test_ctx(&logger);

        let py = inject_context("python", "print(context['greeting'])", &ctx);
        assert!(py.starts_with("import json"));
        assert!(py.contains("json.loads"));
        assert!(py.contains("\"greeting\":\"hello\""));

        let js = inject_context("node", "console.log(context.login.status)", &ctx);
        assert!(js.starts_with("const context = "));
        assert!(js.contains("\"login\""));

        let sh = inject_context("shell", "echo hi", &ctx);
        assert_eq!(sh, "echo hi");
    }
}
