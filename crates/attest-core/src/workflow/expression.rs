//! Expression evaluator for `{{…}}` substitutions, conditions, and paths.
//!
//! The evaluator is built from point-in-time snapshots of the run's variable
//! and step-output maps and is rebuilt whenever those may have changed (after
//! a layer, inside each loop iteration). Lookup order is step output first,
//! then variable, including for the root of a dotted path.
//!
//! String substitution is deliberately lenient: a fragment that fails to
//! evaluate is left verbatim so unresolved templates stay visible in logs.
//! Typed evaluation (`evaluate`, `evaluate_bool`, `evaluate_to_array`)
//! surfaces failures as errors.

use std::collections::HashMap;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Number, Value};
use uuid::Uuid;

/// Matches one `{{ expr }}` fragment; the inner expression cannot contain `}`.
static FRAGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{([^}]+)\}\}").expect("fragment regex"));

/// Operator groups from lowest to highest priority. Within a group the listed
/// order decides which operator wins when several are present (`===` before
/// `==`, `>=` before `>`).
const OPERATOR_GROUPS: &[&[&str]] = &[
    &["||"],
    &["&&"],
    &["===", "!==", "==", "!="],
    &[">=", "<=", ">", "<"],
];

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors surfaced by typed expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("empty expression")]
    Empty,

    #[error("variable not found: {0}")]
    VariableNotFound(String),

    #[error("node output not found: {0}")]
    NodeOutputNotFound(String),

    #[error("invalid node output reference: {0}")]
    InvalidNodeReference(String),

    #[error("no previous output available")]
    NoPreviousOutput,

    #[error("loop variable not found: {0}")]
    LoopVariableNotFound(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    #[error("field not found: {0}")]
    FieldNotFound(String),

    #[error("not an array: {0}")]
    NotAnArray(String),

    #[error("array index out of bounds: {0}")]
    IndexOutOfBounds(String),

    #[error("invalid array index: {0}")]
    InvalidIndex(String),

    #[error("cannot convert {0} to number")]
    NotANumber(String),

    #[error("cannot coerce {0} to boolean")]
    NotABoolean(String),
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluates the expression sub-language against variable and output snapshots.
#[derive(Debug, Clone, Default)]
pub struct Evaluator {
    variables: HashMap<String, Value>,
    step_outputs: HashMap<String, Value>,
    /// Output of the running step's most recent dependency, for `$prev`.
    prev_output: Option<Value>,
}

impl Evaluator {
    /// Create an evaluator over snapshots of the variable and output maps.
    pub fn new(
        variables: HashMap<String, Value>,
        step_outputs: HashMap<String, Value>,
    ) -> Self {
        Self {
            variables,
            step_outputs,
            prev_output: None,
        }
    }

    /// Attach the previous-step output backing `$prev` references.
    pub fn with_prev(mut self, prev: Option<Value>) -> Self {
        self.prev_output = prev;
        self
    }

    /// Replace every `{{…}}` fragment with its value formatted as a string.
    ///
    /// Fragments that fail to evaluate are left untouched.
    pub fn evaluate_string(&self, input: &str) -> String {
        let mut out = String::with_capacity(input.len());
        let mut last = 0;
        for caps in FRAGMENT_RE.captures_iter(input) {
            let whole = caps.get(0).expect("capture 0");
            out.push_str(&input[last..whole.start()]);
            let inner = caps.get(1).expect("capture 1").as_str().trim();
            match self.eval_expression(inner) {
                Ok(value) => out.push_str(&format_value(&value)),
                Err(_) => out.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        out.push_str(&input[last..]);
        out
    }

    /// Evaluate a string, preserving the underlying type when it is exactly
    /// one `{{…}}` fragment. Strings with embedded fragments fall back to
    /// lenient substitution; fragment-free strings are returned unchanged.
    pub fn evaluate(&self, input: &str) -> Result<Value, ExpressionError> {
        let trimmed = input.trim();
        if let Some(caps) = FRAGMENT_RE.captures(trimmed) {
            let whole = caps.get(0).expect("capture 0");
            if whole.start() == 0 && whole.end() == trimmed.len() {
                let inner = caps.get(1).expect("capture 1").as_str().trim();
                return self.eval_expression(inner);
            }
            return Ok(Value::String(self.evaluate_string(trimmed)));
        }
        Ok(Value::String(trimmed.to_string()))
    }

    /// Evaluate and coerce to a boolean.
    ///
    /// Booleans pass through; numbers are truthy when non-zero; strings are
    /// truthy when non-empty and neither `"false"` nor `"0"`; anything else
    /// is an error.
    pub fn evaluate_bool(&self, input: &str) -> Result<bool, ExpressionError> {
        let value = self.evaluate(input)?;
        coerce_bool(&value).ok_or_else(|| ExpressionError::NotABoolean(format_value(&value)))
    }

    /// Evaluate an expression that must yield an array. JSON strings are
    /// parsed; other scalar results are errors.
    pub fn evaluate_to_array(&self, input: &str) -> Result<Vec<Value>, ExpressionError> {
        match self.evaluate(input)? {
            Value::Array(items) => Ok(items),
            Value::String(s) => serde_json::from_str::<Vec<Value>>(&s)
                .map_err(|_| ExpressionError::NotAnArray(s)),
            other => Err(ExpressionError::NotAnArray(format_value(&other))),
        }
    }

    // -----------------------------------------------------------------------
    // Expression dispatch
    // -----------------------------------------------------------------------

    /// Evaluate the inside of one fragment (braces already stripped).
    fn eval_expression(&self, expr: &str) -> Result<Value, ExpressionError> {
        let expr = expr.trim();
        if expr.is_empty() {
            return Err(ExpressionError::Empty);
        }

        // Operators bind loosest, so split on them before primary parsing.
        if let Some((op, index)) = find_lowest_operator(expr) {
            return self.eval_binary(expr, op, index);
        }

        self.eval_primary(expr)
    }

    fn eval_primary(&self, expr: &str) -> Result<Value, ExpressionError> {
        if let Some(literal) = parse_literal(expr) {
            return Ok(literal);
        }
        if expr == "$prev" || expr.starts_with("$prev.") {
            return self.eval_prev(expr);
        }
        if expr.starts_with("$loop") {
            return self.eval_loop_variable(expr);
        }
        if expr.starts_with('$') {
            return self.eval_builtin(expr);
        }
        if expr.starts_with("nodes.") {
            return self.eval_node_output(expr);
        }
        self.eval_variable_reference(expr)
    }

    // -----------------------------------------------------------------------
    // Primaries
    // -----------------------------------------------------------------------

    /// `$prev` / `$prev.path` -- the running step's most recent dependency
    /// output (falls back to a `$prev` entry in the variable map).
    fn eval_prev(&self, expr: &str) -> Result<Value, ExpressionError> {
        let prev = self
            .prev_output
            .as_ref()
            .or_else(|| self.variables.get("$prev"))
            .ok_or(ExpressionError::NoPreviousOutput)?;

        if expr == "$prev" {
            return Ok(prev.clone());
        }
        let segments: Vec<&str> = expr.split('.').skip(1).collect();
        navigate_path(prev, &segments)
    }

    /// `$loopIndex`, `$loopItem.field`, … -- loop-scoped bindings set by the
    /// loop driver in the variable map.
    fn eval_loop_variable(&self, expr: &str) -> Result<Value, ExpressionError> {
        let segments: Vec<&str> = expr.split('.').collect();
        let root = self
            .variables
            .get(segments[0])
            .ok_or_else(|| ExpressionError::LoopVariableNotFound(segments[0].to_string()))?;
        if segments.len() == 1 {
            return Ok(root.clone());
        }
        navigate_path(root, &segments[1..])
    }

    /// Built-in `$name(args)` functions.
    fn eval_builtin(&self, expr: &str) -> Result<Value, ExpressionError> {
        let (name, args) = match expr.find('(') {
            Some(open) if expr.ends_with(')') => {
                (&expr[..open], expr[open + 1..expr.len() - 1].trim())
            }
            _ => (expr, ""),
        };

        match name {
            "$now" => Ok(Value::String(Utc::now().to_rfc3339())),
            "$uuid" => Ok(Value::String(Uuid::new_v4().to_string())),
            "$timestamp" => Ok(Value::Number(Number::from(Utc::now().timestamp()))),
            "$isEmpty" => {
                if args.is_empty() {
                    return Ok(Value::Bool(true));
                }
                let value = self.eval_expression(args)?;
                Ok(Value::Bool(is_empty_value(&value)))
            }
            "$isNotEmpty" => {
                if args.is_empty() {
                    return Ok(Value::Bool(false));
                }
                let value = self.eval_expression(args)?;
                Ok(Value::Bool(!is_empty_value(&value)))
            }
            _ => Err(ExpressionError::UnknownFunction(name.to_string())),
        }
    }

    /// `nodes.<stepId>.path` -- an explicit namespaced output reference.
    fn eval_node_output(&self, expr: &str) -> Result<Value, ExpressionError> {
        let segments: Vec<&str> = expr.split('.').collect();
        if segments.len() < 3 {
            return Err(ExpressionError::InvalidNodeReference(expr.to_string()));
        }
        let output = self
            .step_outputs
            .get(segments[1])
            .ok_or_else(|| ExpressionError::NodeOutputNotFound(segments[1].to_string()))?;
        navigate_path(output, &segments[2..])
    }

    /// A bare identifier path: `name`, `step.field.sub[0]`, `items[2]`.
    fn eval_variable_reference(&self, path: &str) -> Result<Value, ExpressionError> {
        let segments: Vec<&str> = path.split('.').collect();
        let root_name = field_part(segments[0]);
        let base = self.lookup(root_name)?;

        // Wrap the root so the first segment's index suffix (if any) is
        // handled by the same navigation code as every other segment.
        let mut wrapper = serde_json::Map::new();
        wrapper.insert(root_name.to_string(), base.clone());
        navigate_path(&Value::Object(wrapper), &segments)
    }

    /// Name resolution: step output by id first, then variable.
    fn lookup(&self, name: &str) -> Result<&Value, ExpressionError> {
        self.step_outputs
            .get(name)
            .or_else(|| self.variables.get(name))
            .ok_or_else(|| ExpressionError::VariableNotFound(name.to_string()))
    }

    // -----------------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------------

    fn eval_binary(
        &self,
        expr: &str,
        op: &str,
        index: usize,
    ) -> Result<Value, ExpressionError> {
        let left_str = expr[..index].trim();
        let right_str = expr[index + op.len()..].trim();

        match op {
            "&&" | "||" => {
                let left = coerce_operand_bool(&self.eval_operand(left_str)?)?;
                // Short-circuit before touching the right operand.
                if op == "&&" && !left {
                    return Ok(Value::Bool(false));
                }
                if op == "||" && left {
                    return Ok(Value::Bool(true));
                }
                let right = coerce_operand_bool(&self.eval_operand(right_str)?)?;
                Ok(Value::Bool(right))
            }
            "===" | "==" | "!==" | "!=" => {
                let left = self.eval_operand(left_str)?;
                let right = self.eval_operand(right_str)?;
                let equal = format_value(&left) == format_value(&right);
                Ok(Value::Bool(if op.starts_with('!') { !equal } else { equal }))
            }
            ">" | "<" | ">=" | "<=" => {
                let left = to_number(&self.eval_operand(left_str)?)?;
                let right = to_number(&self.eval_operand(right_str)?)?;
                let result = match op {
                    ">" => left > right,
                    "<" => left < right,
                    ">=" => left >= right,
                    _ => left <= right,
                };
                Ok(Value::Bool(result))
            }
            _ => Err(ExpressionError::UnknownFunction(op.to_string())),
        }
    }

    /// An operand is a literal or a nested expression (which may itself split
    /// on a higher-priority operator).
    fn eval_operand(&self, operand: &str) -> Result<Value, ExpressionError> {
        let operand = operand.trim();
        if let Some(literal) = parse_literal(operand) {
            return Ok(literal);
        }
        self.eval_expression(operand)
    }
}

// ---------------------------------------------------------------------------
// Operator scanning
// ---------------------------------------------------------------------------

/// Find the operator to split on: lowest-priority group first, group-internal
/// order second, first unquoted occurrence within the expression.
fn find_lowest_operator(expr: &str) -> Option<(&'static str, usize)> {
    for group in OPERATOR_GROUPS {
        for op in *group {
            if let Some(index) = find_operator_index(expr, op) {
                return Some((op, index));
            }
        }
    }
    None
}

/// Index of the first occurrence of `op` outside single/double quotes.
/// Backslash-escaped quotes do not toggle the quote state.
fn find_operator_index(expr: &str, op: &str) -> Option<usize> {
    let bytes = expr.as_bytes();
    let op_bytes = op.as_bytes();
    let mut in_single = false;
    let mut in_double = false;

    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        let escaped = i > 0 && bytes[i - 1] == b'\\';

        if c == b'\'' && !escaped && !in_double {
            in_single = !in_single;
            i += 1;
            continue;
        }
        if c == b'"' && !escaped && !in_single {
            in_double = !in_double;
            i += 1;
            continue;
        }

        if !in_single && !in_double && bytes[i..].starts_with(op_bytes) {
            return Some(i);
        }
        i += 1;
    }
    None
}

// ---------------------------------------------------------------------------
// Literals
// ---------------------------------------------------------------------------

fn parse_literal(s: &str) -> Option<Value> {
    if s.len() >= 2 {
        if (s.starts_with('\'') && s.ends_with('\''))
            || (s.starts_with('"') && s.ends_with('"'))
        {
            return Some(Value::String(s[1..s.len() - 1].to_string()));
        }
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(Value::Number(Number::from(i)));
    }
    if let Ok(f) = s.parse::<f64>() {
        return Number::from_f64(f).map(Value::Number);
    }
    match s {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "null" => Some(Value::Null),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Path navigation
// ---------------------------------------------------------------------------

/// Descend maps by key and arrays by index through dotted segments.
/// Segments may carry an index suffix (`rows[0]`) or be a bare index (`[0]`).
pub fn navigate_path(value: &Value, segments: &[&str]) -> Result<Value, ExpressionError> {
    let mut current = value.clone();

    for segment in segments {
        if let Some(open) = segment.find('[') {
            if !segment.ends_with(']') {
                return Err(ExpressionError::InvalidIndex((*segment).to_string()));
            }
            let field = &segment[..open];
            let index_str = &segment[open + 1..segment.len() - 1];

            if !field.is_empty() {
                current = descend_field(&current, field)?;
            }

            let index: usize = index_str
                .parse()
                .map_err(|_| ExpressionError::InvalidIndex(index_str.to_string()))?;
            current = descend_index(&current, index)?;
        } else {
            current = descend_field(&current, segment)?;
        }
    }

    Ok(current)
}

fn descend_field(value: &Value, field: &str) -> Result<Value, ExpressionError> {
    match value {
        Value::Object(map) => map
            .get(field)
            .cloned()
            .ok_or_else(|| ExpressionError::FieldNotFound(field.to_string())),
        _ => Err(ExpressionError::FieldNotFound(field.to_string())),
    }
}

fn descend_index(value: &Value, index: usize) -> Result<Value, ExpressionError> {
    match value {
        Value::Array(items) => items
            .get(index)
            .cloned()
            .ok_or_else(|| ExpressionError::IndexOutOfBounds(index.to_string())),
        other => Err(ExpressionError::NotAnArray(format_value(other))),
    }
}

fn field_part(segment: &str) -> &str {
    match segment.find('[') {
        Some(open) => &segment[..open],
        None => segment,
    }
}

// ---------------------------------------------------------------------------
// Coercions
// ---------------------------------------------------------------------------

/// Type-loose string rendering used for substitution and equality: strings
/// raw, integral numbers without a fraction, containers as compact JSON.
pub fn format_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().unwrap_or(0.0).to_string()
            }
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Boolean coercion per the evaluator contract. `None` means the type does
/// not coerce.
pub fn coerce_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => Some(n.as_f64().map(|f| f != 0.0).unwrap_or(false)),
        Value::String(s) => Some(!s.is_empty() && s != "false" && s != "0"),
        _ => None,
    }
}

fn coerce_operand_bool(value: &Value) -> Result<bool, ExpressionError> {
    coerce_bool(value).ok_or_else(|| ExpressionError::NotABoolean(format_value(value)))
}

/// Numeric coercion for relational operators and numeric assertions.
pub fn to_number(value: &Value) -> Result<f64, ExpressionError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ExpressionError::NotANumber(format_value(value))),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| ExpressionError::NotANumber(s.clone())),
        other => Err(ExpressionError::NotANumber(format_value(other))),
    }
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluator() -> Evaluator {
        let mut variables = HashMap::new();
        variables.insert("userType".to_string(), json!("admin"));
        variables.insert("retries".to_string(), json!(3));
        variables.insert("threshold".to_string(), json!(10.5));
        variables.insert("enabled".to_string(), json!(true));
        variables.insert("emptyList".to_string(), json!([]));
        variables.insert(
            "user".to_string(),
            json!({ "profile": { "email": "alice@test.dev" }, "tags": ["qa", "admin"] }),
        );
        variables.insert("productIds".to_string(), json!(["P001", "P002", "P003"]));

        let mut outputs = HashMap::new();
        outputs.insert(
            "login".to_string(),
            json!({ "status": 200, "response": { "token": "tk-1", "roles": ["admin"] } }),
        );
        outputs.insert(
            "query".to_string(),
            json!({ "rows": [{ "id": 1, "name": "first" }, { "id": 2, "name": "second" }], "rowCount": 2 }),
        );

        Evaluator::new(variables, outputs)
    }

    // -----------------------------------------------------------------------
    // String substitution
    // -----------------------------------------------------------------------

    #[test]
    fn test_evaluate_string_substitutes_fragments() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_string("user={{userType}} retries={{retries}}"),
            "user=admin retries=3"
        );
    }

    #[test]
    fn test_evaluate_string_without_fragments_is_identity() {
        let eval = evaluator();
        assert_eq!(eval.evaluate_string("plain text"), "plain text");
    }

    #[test]
    fn test_evaluate_string_leaves_failed_fragments_verbatim() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_string("x={{missing}} y={{retries}}"),
            "x={{missing}} y=3"
        );
    }

    #[test]
    fn test_evaluate_string_renders_float_without_trailing_zero() {
        let eval = evaluator();
        assert_eq!(eval.evaluate_string("{{threshold}}"), "10.5");
    }

    // -----------------------------------------------------------------------
    // Typed evaluation
    // -----------------------------------------------------------------------

    #[test]
    fn test_evaluate_single_fragment_preserves_type() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("{{retries}}").unwrap(), json!(3));
        assert_eq!(eval.evaluate("{{enabled}}").unwrap(), json!(true));
        assert_eq!(
            eval.evaluate("{{productIds}}").unwrap(),
            json!(["P001", "P002", "P003"])
        );
    }

    #[test]
    fn test_evaluate_mixed_string_stringifies() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate("count: {{retries}}").unwrap(),
            json!("count: 3")
        );
    }

    #[test]
    fn test_evaluate_plain_string_passes_through() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("hello").unwrap(), json!("hello"));
    }

    #[test]
    fn test_evaluate_single_failing_fragment_errors() {
        let eval = evaluator();
        assert!(eval.evaluate("{{missing}}").is_err());
    }

    // -----------------------------------------------------------------------
    // Path navigation
    // -----------------------------------------------------------------------

    #[test]
    fn test_nested_path_through_variable() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate("{{user.profile.email}}").unwrap(),
            json!("alice@test.dev")
        );
    }

    #[test]
    fn test_array_index_in_path() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("{{user.tags[1]}}").unwrap(), json!("admin"));
        assert_eq!(
            eval.evaluate("{{query.rows[0].name}}").unwrap(),
            json!("first")
        );
    }

    #[test]
    fn test_index_on_root_segment() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("{{productIds[2]}}").unwrap(), json!("P003"));
    }

    #[test]
    fn test_out_of_range_index_fails() {
        let eval = evaluator();
        assert!(eval.evaluate("{{productIds[9]}}").is_err());
    }

    #[test]
    fn test_missing_key_fails() {
        let eval = evaluator();
        assert!(eval.evaluate("{{user.profile.phone}}").is_err());
    }

    #[test]
    fn test_step_output_wins_over_variable() {
        let mut variables = HashMap::new();
        variables.insert("login".to_string(), json!("variable value"));
        let mut outputs = HashMap::new();
        outputs.insert("login".to_string(), json!("output value"));
        let eval = Evaluator::new(variables, outputs);
        assert_eq!(eval.evaluate("{{login}}").unwrap(), json!("output value"));
    }

    // -----------------------------------------------------------------------
    // Namespaced and previous-step references
    // -----------------------------------------------------------------------

    #[test]
    fn test_nodes_reference() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate("{{nodes.login.response.token}}").unwrap(),
            json!("tk-1")
        );
    }

    #[test]
    fn test_nodes_reference_unknown_step_fails() {
        let eval = evaluator();
        assert!(eval.evaluate("{{nodes.nope.status}}").is_err());
    }

    #[test]
    fn test_prev_reference() {
        let eval = evaluator().with_prev(Some(json!({ "status": 201 })));
        assert_eq!(eval.evaluate("{{$prev.status}}").unwrap(), json!(201));
        assert_eq!(
            eval.evaluate("{{$prev}}").unwrap(),
            json!({ "status": 201 })
        );
    }

    #[test]
    fn test_prev_without_predecessor_fails() {
        let eval = evaluator();
        assert!(eval.evaluate("{{$prev.status}}").is_err());
    }

    // -----------------------------------------------------------------------
    // Loop variables
    // -----------------------------------------------------------------------

    #[test]
    fn test_loop_variables_resolve_from_bindings() {
        let mut variables = HashMap::new();
        variables.insert("$loopIndex".to_string(), json!(2));
        variables.insert("$loopItem".to_string(), json!({ "sku": "P003" }));
        let eval = Evaluator::new(variables, HashMap::new());
        assert_eq!(eval.evaluate("{{$loopIndex}}").unwrap(), json!(2));
        assert_eq!(eval.evaluate("{{$loopItem.sku}}").unwrap(), json!("P003"));
    }

    #[test]
    fn test_loop_variable_outside_loop_fails() {
        let eval = evaluator();
        assert!(eval.evaluate("{{$loopIndex}}").is_err());
    }

    // -----------------------------------------------------------------------
    // Built-in functions
    // -----------------------------------------------------------------------

    #[test]
    fn test_builtin_uuid_and_now() {
        let eval = evaluator();
        let id = eval.evaluate("{{$uuid()}}").unwrap();
        assert!(Uuid::parse_str(id.as_str().unwrap()).is_ok());

        let now = eval.evaluate("{{$now()}}").unwrap();
        assert!(now.as_str().unwrap().contains('T'));

        let ts = eval.evaluate("{{$timestamp()}}").unwrap();
        assert!(ts.as_i64().unwrap() > 1_500_000_000);
    }

    #[test]
    fn test_builtin_is_empty() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("{{$isEmpty(emptyList)}}").unwrap(), json!(true));
        assert_eq!(
            eval.evaluate("{{$isEmpty(productIds)}}").unwrap(),
            json!(false)
        );
        assert_eq!(
            eval.evaluate("{{$isNotEmpty(userType)}}").unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_unknown_function_fails() {
        let eval = evaluator();
        assert!(eval.evaluate("{{$nope()}}").is_err());
    }

    // -----------------------------------------------------------------------
    // Operators
    // -----------------------------------------------------------------------

    #[test]
    fn test_equality_is_type_loose() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("{{retries == '3'}}").unwrap(), json!(true));
        assert_eq!(
            eval.evaluate("{{userType === 'admin'}}").unwrap(),
            json!(true)
        );
        assert_eq!(
            eval.evaluate("{{userType !== 'guest'}}").unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_operators_without_surrounding_spaces() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("{{userType==='admin'}}").unwrap(), json!(true));
        assert_eq!(eval.evaluate("{{retries>2}}").unwrap(), json!(true));
    }

    #[test]
    fn test_relational_operators_are_numeric() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("{{retries > 2}}").unwrap(), json!(true));
        assert_eq!(eval.evaluate("{{retries >= 3}}").unwrap(), json!(true));
        assert_eq!(eval.evaluate("{{threshold < 10}}").unwrap(), json!(false));
        assert!(eval.evaluate("{{userType > 2}}").is_err());
    }

    #[test]
    fn test_boolean_operators_short_circuit() {
        let eval = evaluator();
        // The right side references a missing variable and must not be
        // evaluated when the left side already decides the result.
        assert_eq!(
            eval.evaluate("{{userType === 'guest' && missing}}").unwrap(),
            json!(false)
        );
        assert_eq!(
            eval.evaluate("{{userType === 'admin' || missing}}").unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_chained_boolean_operators() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate("{{userType === 'admin' && retries > 2 && enabled}}")
                .unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_operators_inside_quotes_do_not_split() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate("{{userType === 'a && b'}}").unwrap(),
            json!(false)
        );
        assert_eq!(
            eval.evaluate("{{'x > y' === 'x > y'}}").unwrap(),
            json!(true)
        );
    }

    // -----------------------------------------------------------------------
    // Boolean coercion
    // -----------------------------------------------------------------------

    #[test]
    fn test_evaluate_bool_coercions() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("{{enabled}}").unwrap());
        assert!(eval.evaluate_bool("{{retries}}").unwrap());
        assert!(eval.evaluate_bool("{{userType}}").unwrap());
        assert!(eval.evaluate_bool("true").unwrap());
        assert!(!eval.evaluate_bool("false").unwrap());
        assert!(!eval.evaluate_bool("0").unwrap());
    }

    #[test]
    fn test_evaluate_bool_rejects_containers() {
        let eval = evaluator();
        assert!(eval.evaluate_bool("{{productIds}}").is_err());
    }

    // -----------------------------------------------------------------------
    // Array coercion
    // -----------------------------------------------------------------------

    #[test]
    fn test_evaluate_to_array_from_value_and_json_string() {
        let eval = evaluator();
        assert_eq!(
            eval.evaluate_to_array("{{productIds}}").unwrap(),
            vec![json!("P001"), json!("P002"), json!("P003")]
        );
        assert_eq!(
            eval.evaluate_to_array(r#"["a", "b"]"#).unwrap(),
            vec![json!("a"), json!("b")]
        );
    }

    #[test]
    fn test_evaluate_to_array_rejects_scalars() {
        let eval = evaluator();
        assert!(eval.evaluate_to_array("{{retries}}").is_err());
        assert!(eval.evaluate_to_array("not json").is_err());
    }

    // -----------------------------------------------------------------------
    // Literals
    // -----------------------------------------------------------------------

    #[test]
    fn test_literals_stand_alone() {
        let eval = evaluator();
        assert_eq!(eval.evaluate("{{'hello'}}").unwrap(), json!("hello"));
        assert_eq!(eval.evaluate("{{42}}").unwrap(), json!(42));
        assert_eq!(eval.evaluate("{{4.5}}").unwrap(), json!(4.5));
        assert_eq!(eval.evaluate("{{null}}").unwrap(), Value::Null);
    }
}
