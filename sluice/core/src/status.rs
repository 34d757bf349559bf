//! Point-in-time status snapshots of executions

use sluice_protocol::{
    status::{ExecutionStatus, StepRuntimeStatus, StepState},
    ExecutionKind,
};

use crate::execution::{Execution, PipelineExecution};

/// A step copy is reported when it is running or has left the idle state.
///
/// Copies that never did anything are omitted so large graphs with many
/// optional branches stay readable.
pub fn is_reportable(step: &StepRuntimeStatus) -> bool {
    step.running || step.state != StepState::Empty
}

pub fn pipeline_status(run_id: &str, execution: &dyn PipelineExecution) -> ExecutionStatus {
    let state = execution.state();

    ExecutionStatus {
        run_id: run_id.to_string(),
        name: execution.name().to_string(),
        kind: ExecutionKind::Pipeline,
        state,
        status_description: state.description().to_string(),
        steps: execution
            .step_statuses()
            .into_iter()
            .filter(is_reportable)
            .collect(),
        error: execution.error(),
        result: execution.result(),
        log: None,
    }
}

pub fn job_status(run_id: &str, execution: &dyn Execution) -> ExecutionStatus {
    let state = execution.state();

    ExecutionStatus {
        run_id: run_id.to_string(),
        name: execution.name().to_string(),
        kind: ExecutionKind::Job,
        state,
        status_description: state.description().to_string(),
        steps: vec![],
        error: execution.error(),
        result: execution.result(),
        log: None,
    }
}
