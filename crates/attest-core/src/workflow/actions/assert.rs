//! The `assert` action: evaluate a list of assertions against the context.
//!
//! `actual`/`expected` strings carrying `{{…}}` are resolved leniently (an
//! unresolvable reference keeps its literal form). An optional `path` narrows
//! the actual value before comparison. The action fails iff any assertion
//! fails; the output carries per-assertion results and aggregate counters.

use regex::Regex;
use serde_json::{json, Map, Value};

use crate::workflow::expression::{format_value, navigate_path, to_number, Evaluator};

use super::{ActionContext, ActionResult};

pub(super) async fn execute(ctx: &ActionContext<'_>, config: &Map<String, Value>) -> ActionResult {
    let Some(assertions) = config.get("assertions").and_then(Value::as_array) else {
        return ActionResult::failed("assertions configuration is missing or invalid");
    };
    if assertions.is_empty() {
        return ActionResult::failed("at least one assertion is required");
    }

    let evaluator = Evaluator::new(ctx.variables.clone(), ctx.step_outputs.clone());

    let mut details = Vec::with_capacity(assertions.len());
    let mut failures: Vec<String> = Vec::new();

    for (index, entry) in assertions.iter().enumerate() {
        let Some(assertion) = entry.as_object() else {
            failures.push(format!("Assertion {}: not an object", index + 1));
            continue;
        };

        let kind = assertion
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_lowercase();
        let message = assertion.get("message").and_then(Value::as_str);

        match check_assertion(assertion, &kind, &evaluator) {
            Ok(()) => {
                details.push(json!({ "index": index + 1, "type": kind, "passed": true }));
            }
            Err(reason) => {
                let label = match message {
                    Some(m) => format!("Assertion {} ({}) failed: {}", index + 1, m, reason),
                    None => format!("Assertion {} failed: {}", index + 1, reason),
                };
                details.push(json!({
                    "index": index + 1,
                    "type": kind,
                    "passed": false,
                    "error": reason,
                }));
                failures.push(label);
            }
        }
    }

    let mut output = Map::new();
    output.insert("totalAssertions".to_string(), json!(assertions.len()));
    output.insert(
        "passedAssertions".to_string(),
        json!(assertions.len() - failures.len()),
    );
    output.insert("failedAssertions".to_string(), json!(failures.len()));
    output.insert("success".to_string(), json!(failures.is_empty()));
    output.insert("assertions".to_string(), Value::Array(details));

    if failures.is_empty() {
        ActionResult::success(output)
    } else {
        let error = format!(
            "{} assertion(s) failed: {}",
            failures.len(),
            failures.join("; ")
        );
        output.insert("failures".to_string(), json!(failures));
        ActionResult::failed_with_output(error, output)
    }
}

fn check_assertion(
    assertion: &Map<String, Value>,
    kind: &str,
    evaluator: &Evaluator,
) -> Result<(), String> {
    let mut actual = resolve(assertion.get("actual"), evaluator);
    let expected = resolve(assertion.get("expected"), evaluator);

    // A path narrows the actual value before comparison.
    if let Some(path) = assertion.get("path").and_then(Value::as_str).filter(|p| !p.is_empty()) {
        let segments: Vec<&str> = path.split('.').collect();
        actual = navigate_path(&actual, &segments)
            .map_err(|_| format!("path '{path}' not found in data"))?;
    }

    match kind {
        "equals" | "equal" | "eq" => assert_equals(&actual, &expected),
        "notequals" | "notequal" | "ne" => match assert_equals(&actual, &expected) {
            Ok(()) => Err(format!(
                "expected {} not to equal {}",
                format_value(&actual),
                format_value(&expected)
            )),
            Err(_) => Ok(()),
        },
        "contains" => assert_contains(&actual, &expected),
        "notcontains" => match assert_contains(&actual, &expected) {
            Ok(()) => Err(format!(
                "expected {} not to contain {}",
                format_value(&actual),
                format_value(&expected)
            )),
            Err(_) => Ok(()),
        },
        "regex" | "regexp" | "matches" => assert_regex(&actual, &expected),
        "exists" => {
            if actual.is_null() {
                Err("expected value to exist but got null".to_string())
            } else {
                Ok(())
            }
        }
        "notexists" | "null" => {
            if actual.is_null() {
                Ok(())
            } else {
                Err(format!(
                    "expected value to be null but got {}",
                    format_value(&actual)
                ))
            }
        }
        "greaterthan" | "gt" => assert_numeric(&actual, &expected, kind, |a, b| a > b),
        "lessthan" | "lt" => assert_numeric(&actual, &expected, kind, |a, b| a < b),
        "greaterthanorequal" | "gte" => assert_numeric(&actual, &expected, kind, |a, b| a >= b),
        "lessthanorequal" | "lte" => assert_numeric(&actual, &expected, kind, |a, b| a <= b),
        "arraylength" | "length" => assert_array_length(&actual, &expected),
        "typeof" | "type" => assert_type(&actual, &expected),
        other => Err(format!("unsupported assertion type: {other}")),
    }
}

/// Resolve a `{{…}}`-bearing string against the context; unresolvable
/// references keep their literal form. Non-strings pass through.
fn resolve(value: Option<&Value>, evaluator: &Evaluator) -> Value {
    match value {
        Some(Value::String(s)) => evaluator
            .evaluate(s)
            .unwrap_or_else(|_| Value::String(s.clone())),
        Some(other) => other.clone(),
        None => Value::Null,
    }
}

fn assert_equals(actual: &Value, expected: &Value) -> Result<(), String> {
    if format_value(actual) == format_value(expected) {
        Ok(())
    } else {
        Err(format!(
            "expected {} but got {}",
            format_value(expected),
            format_value(actual)
        ))
    }
}

fn assert_contains(actual: &Value, expected: &Value) -> Result<(), String> {
    if format_value(actual).contains(&format_value(expected)) {
        Ok(())
    } else {
        Err(format!(
            "expected {} to contain {}",
            format_value(actual),
            format_value(expected)
        ))
    }
}

fn assert_regex(actual: &Value, expected: &Value) -> Result<(), String> {
    let pattern = format_value(expected);
    let regex =
        Regex::new(&pattern).map_err(|e| format!("invalid regex pattern {pattern}: {e}"))?;
    let subject = format_value(actual);
    if regex.is_match(&subject) {
        Ok(())
    } else {
        Err(format!("expected {subject} to match pattern {pattern}"))
    }
}

fn assert_numeric(
    actual: &Value,
    expected: &Value,
    kind: &str,
    check: fn(f64, f64) -> bool,
) -> Result<(), String> {
    let a = to_number(actual).map_err(|e| format!("actual value is not a number: {e}"))?;
    let b = to_number(expected).map_err(|e| format!("expected value is not a number: {e}"))?;
    if check(a, b) {
        Ok(())
    } else {
        Err(format!("expected {a} to satisfy {kind} {b}"))
    }
}

fn assert_array_length(actual: &Value, expected: &Value) -> Result<(), String> {
    let Value::Array(items) = actual else {
        return Err(format!("expected an array but got {}", type_name(actual)));
    };
    let expected_len =
        to_number(expected).map_err(|e| format!("expected length is not a number: {e}"))? as usize;
    if items.len() == expected_len {
        Ok(())
    } else {
        Err(format!(
            "expected array length {expected_len} but got {}",
            items.len()
        ))
    }
}

fn assert_type(actual: &Value, expected: &Value) -> Result<(), String> {
    let expected_type = format_value(expected).to_lowercase();
    let actual_type = type_name(actual);
    if actual_type.contains(expected_type.as_str()) {
        Ok(())
    } else {
        Err(format!("expected type {expected_type} but got {actual_type}"))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
