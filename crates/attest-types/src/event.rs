//! Workflow lifecycle events published to observers.
//!
//! Events are serde-tagged JSON keyed by `runId`, matching what the web UI's
//! live run view consumes over its socket. Step-level events use snake_case
//! names; loop and branch events keep their legacy upper-case names.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::workflow::{RunStatus, StepStatus};

/// An event emitted during workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all_fields = "camelCase")]
pub enum WorkflowEvent {
    #[serde(rename = "run_started")]
    RunStarted {
        run_id: Uuid,
        workflow_id: String,
    },
    #[serde(rename = "step_start")]
    StepStart {
        run_id: Uuid,
        step_id: String,
        step_name: String,
    },
    #[serde(rename = "step_complete")]
    StepComplete {
        run_id: Uuid,
        step_id: String,
        step_name: String,
        status: StepStatus,
        duration: u64,
    },
    /// A `when` gate decision, emitted whether the step runs or skips.
    #[serde(rename = "BRANCH_DECISION")]
    BranchDecision {
        run_id: Uuid,
        step_id: String,
        step_name: String,
        condition: String,
        decision: bool,
    },
    #[serde(rename = "LOOP_START")]
    LoopStart {
        run_id: Uuid,
        step_id: String,
        step_name: String,
        /// Collection size for forEach loops; absent for while loops.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total: Option<usize>,
        parallel: bool,
    },
    #[serde(rename = "ITERATION_START")]
    IterationStart {
        run_id: Uuid,
        step_id: String,
        iteration: usize,
    },
    #[serde(rename = "ITERATION_COMPLETE")]
    IterationComplete {
        run_id: Uuid,
        step_id: String,
        iteration: usize,
        status: StepStatus,
    },
    #[serde(rename = "LOOP_COMPLETE")]
    LoopComplete {
        run_id: Uuid,
        step_id: String,
        step_name: String,
        iterations: usize,
    },
    #[serde(rename = "run_completed")]
    RunCompleted {
        run_id: Uuid,
        status: RunStatus,
        duration: u64,
    },
    #[serde(rename = "run_failed")]
    RunFailed {
        run_id: Uuid,
        error: String,
    },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::RunStarted { run_id, .. }
            | WorkflowEvent::StepStart { run_id, .. }
            | WorkflowEvent::StepComplete { run_id, .. }
            | WorkflowEvent::BranchDecision { run_id, .. }
            | WorkflowEvent::LoopStart { run_id, .. }
            | WorkflowEvent::IterationStart { run_id, .. }
            | WorkflowEvent::IterationComplete { run_id, .. }
            | WorkflowEvent::LoopComplete { run_id, .. }
            | WorkflowEvent::RunCompleted { run_id, .. }
            | WorkflowEvent::RunFailed { run_id, .. } => *run_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_events_use_snake_case_tags() {
        let event = WorkflowEvent::StepComplete {
            run_id: Uuid::now_v7(),
            step_id: "login".to_string(),
            step_name: "Login".to_string(),
            status: StepStatus::Success,
            duration: 42,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"step_complete\""));
        assert!(json.contains("\"stepId\":\"login\""));
        assert!(json.contains("\"duration\":42"));
    }

    #[test]
    fn test_loop_events_keep_upper_case_tags() {
        let event = WorkflowEvent::LoopStart {
            run_id: Uuid::now_v7(),
            step_id: "fanout".to_string(),
            step_name: "Fan Out".to_string(),
            total: Some(3),
            parallel: true,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event\":\"LOOP_START\""));
        assert!(json.contains("\"total\":3"));
    }

    #[test]
    fn test_run_id_accessor() {
        let run_id = Uuid::now_v7();
        let event = WorkflowEvent::RunFailed {
            run_id,
            error: "step 'login' failed".to_string(),
        };
        assert_eq!(event.run_id(), run_id);
    }

    #[test]
    fn test_event_json_roundtrip() {
        let event = WorkflowEvent::BranchDecision {
            run_id: Uuid::now_v7(),
            step_id: "gate".to_string(),
            step_name: "Gate".to_string(),
            condition: "{{userType === 'admin'}}".to_string(),
            decision: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        let parsed: WorkflowEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(
            parsed,
            WorkflowEvent::BranchDecision { decision: false, .. }
        ));
    }
}
