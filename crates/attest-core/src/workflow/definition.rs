//! Definition parsing and validation.
//!
//! Accepts a workflow as a typed struct, a decoded JSON value, or a JSON
//! string, and validates it before any scheduling: dependency targets must
//! exist and the dependency relation must be acyclic. Validation also warns
//! when two steps in the same layer map outputs onto the same variable --
//! the winner of such a race is undefined by design, so the author is told.

use std::collections::HashMap;

use attest_types::workflow::WorkflowDefinition;
use serde_json::Value;

use super::dag::{build_execution_layers, validate_dag};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Workflow-level errors: parsing, validation, expression failures.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("failed to parse workflow definition: {0}")]
    ParseError(String),

    #[error("step '{step}' depends on non-existent step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("workflow contains a cyclic dependency involving step '{0}'")]
    CycleDetected(String),

    #[error("expression error: {0}")]
    ExpressionError(String),

    #[error("execution error: {0}")]
    ExecutionError(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// The formats a workflow definition arrives in.
pub enum DefinitionSource {
    /// Already-typed definition (tests, SDK callers).
    Typed(WorkflowDefinition),
    /// Decoded JSON (stored definition column).
    Json(Value),
    /// Raw JSON text (API payload).
    Text(String),
}

impl From<WorkflowDefinition> for DefinitionSource {
    fn from(def: WorkflowDefinition) -> Self {
        DefinitionSource::Typed(def)
    }
}

impl From<Value> for DefinitionSource {
    fn from(value: Value) -> Self {
        DefinitionSource::Json(value)
    }
}

impl From<&str> for DefinitionSource {
    fn from(text: &str) -> Self {
        DefinitionSource::Text(text.to_string())
    }
}

/// Decode a definition from any supported source and normalise it: the name
/// defaults to the workflow id, and each step's `id` field is filled from its
/// map key when omitted.
pub fn parse_definition(
    workflow_id: &str,
    source: DefinitionSource,
) -> Result<WorkflowDefinition, WorkflowError> {
    let mut def = match source {
        DefinitionSource::Typed(def) => def,
        DefinitionSource::Json(value) => serde_json::from_value(value)
            .map_err(|e| WorkflowError::ParseError(e.to_string()))?,
        DefinitionSource::Text(text) => serde_json::from_str(&text)
            .map_err(|e| WorkflowError::ParseError(e.to_string()))?,
    };

    if def.name.is_empty() {
        def.name = workflow_id.to_string();
    }
    for (id, step) in def.steps.iter_mut() {
        if step.id.is_empty() {
            step.id = id.clone();
        }
        if step.name.is_empty() {
            step.name = id.clone();
        }
    }

    Ok(def)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed definition. Fails on unknown dependencies and cycles;
/// warns on same-layer steps mapping to the same output variable.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    validate_dag(&def.steps)?;
    warn_on_conflicting_output_variables(def);
    Ok(())
}

/// Two steps in the same layer writing the same mapped variable race with an
/// undefined winner. Surface it to the author instead of failing the run.
fn warn_on_conflicting_output_variables(def: &WorkflowDefinition) {
    let Ok(layers) = build_execution_layers(&def.steps) else {
        return;
    };

    for layer in layers {
        let mut writers: HashMap<&str, &str> = HashMap::new();
        for step_id in &layer {
            let Some(step) = def.steps.get(step_id) else {
                continue;
            };
            let Some(mapping) = &step.output else {
                continue;
            };
            for variable in mapping.values() {
                if let Some(other) = writers.insert(variable.as_str(), step_id.as_str()) {
                    tracing::warn!(
                        workflow = def.name.as_str(),
                        variable = variable.as_str(),
                        first = other,
                        second = step_id.as_str(),
                        "steps in the same layer both map onto this variable; the winner is undefined"
                    );
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_from_json_string() {
        let def = parse_definition(
            "wf-1",
            DefinitionSource::from(
                r#"{ "steps": { "a": { "type": "http", "config": {} } } }"#,
            ),
        )
        .unwrap();
        assert_eq!(def.name, "wf-1", "empty name defaults to the workflow id");
        assert_eq!(def.steps["a"].id, "a", "step id filled from the map key");
        assert_eq!(def.steps["a"].name, "a");
    }

    #[test]
    fn test_parse_from_json_value() {
        let def = parse_definition(
            "wf-2",
            DefinitionSource::from(json!({
                "name": "named",
                "version": "2",
                "steps": { "a": { "id": "a", "name": "A", "type": "command" } }
            })),
        )
        .unwrap();
        assert_eq!(def.name, "named");
        assert_eq!(def.version, "2");
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        let err = parse_definition("wf", DefinitionSource::from("not json")).unwrap_err();
        assert!(matches!(err, WorkflowError::ParseError(_)));
    }

    #[test]
    fn test_validate_rejects_unknown_dependency() {
        let def = parse_definition(
            "wf",
            DefinitionSource::from(json!({
                "steps": {
                    "a": { "type": "http", "dependsOn": ["ghost"] }
                }
            })),
        )
        .unwrap();
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency { .. }));
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let def = parse_definition(
            "wf",
            DefinitionSource::from(json!({
                "steps": {
                    "a": { "type": "http", "dependsOn": ["b"] },
                    "b": { "type": "http", "dependsOn": ["a"] }
                }
            })),
        )
        .unwrap();
        let err = validate_definition(&def).unwrap_err();
        assert!(matches!(err, WorkflowError::CycleDetected(_)));
    }

    #[test]
    fn test_validate_accepts_diamond() {
        let def = parse_definition(
            "wf",
            DefinitionSource::from(json!({
                "steps": {
                    "a": { "type": "http" },
                    "b": { "type": "http", "dependsOn": ["a"] },
                    "c": { "type": "http", "dependsOn": ["a"] },
                    "d": { "type": "http", "dependsOn": ["b", "c"] }
                }
            })),
        )
        .unwrap();
        assert!(validate_definition(&def).is_ok());
    }
}
