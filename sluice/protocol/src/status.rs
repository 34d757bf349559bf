//! Lifecycle states and status snapshots

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{configuration::ExecutionResult, ExecutionKind};

/// Lifecycle of an execution object.
///
/// The machine only moves forward: once an execution reaches a terminal
/// state it can never become `Initialized` again. Re-running a finished
/// execution means building a new object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    /// Created, nothing prepared yet
    Waiting,
    /// Preparing step threads
    Preparing,
    /// Prepared and ready to run
    Initialized,
    Running,
    Paused,
    /// Stop was requested, steps are winding down
    Halting,
    Finished,
    FinishedWithErrors,
    Stopped,
    /// Failed before or during the run
    Errored,
}

impl LifecycleState {
    /// Absorbing states
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleState::Finished
                | LifecycleState::FinishedWithErrors
                | LifecycleState::Stopped
                | LifecycleState::Errored
        )
    }

    /// True while step threads are alive
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            LifecycleState::Running | LifecycleState::Paused | LifecycleState::Halting
        )
    }

    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        match (self, next) {
            (Waiting, Preparing | Running | Stopped | Errored) => true,
            (Preparing, Initialized | Stopped | Errored) => true,
            (Initialized, Running | Stopped | Errored) => true,
            (Running, Paused | Halting | Finished | FinishedWithErrors | Stopped | Errored) => true,
            (Paused, Running | Halting | Stopped | Errored) => true,
            (Halting, Stopped | Finished | FinishedWithErrors | Errored) => true,
            _ => false,
        }
    }

    /// Human readable description as shown by status pages
    pub fn description(&self) -> &'static str {
        match self {
            LifecycleState::Waiting => "Waiting",
            LifecycleState::Preparing => "Preparing executing",
            LifecycleState::Initialized => "Initialized",
            LifecycleState::Running => "Running",
            LifecycleState::Paused => "Paused",
            LifecycleState::Halting => "Halting",
            LifecycleState::Finished => "Finished",
            LifecycleState::FinishedWithErrors => "Finished (with errors)",
            LifecycleState::Stopped => "Stopped",
            LifecycleState::Errored => "Errored",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// State of a single step copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Idle, never did anything
    #[default]
    Empty,
    Initializing,
    Running,
    Paused,
    Halting,
    Stopped,
    Finished,
    Errored,
}

/// Runtime status of one step copy, recomputed on every status request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
pub struct StepRuntimeStatus {
    pub step_name: String,
    pub copy: u32,
    pub running: bool,
    pub state: StepState,
    #[new(default)]
    #[serde(default)]
    pub rows_read: u64,
    #[new(default)]
    #[serde(default)]
    pub rows_written: u64,
    #[new(default)]
    #[serde(default)]
    pub errors: u64,
}

/// A slice of an execution log starting at an absolute line number
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogChunk {
    /// Absolute number of the first line in `lines`
    pub first_line: u64,
    /// Absolute number one past the last line in `lines`, use as the next `from`
    pub last_line: u64,
    pub lines: Vec<String>,
}

impl LogChunk {
    pub fn text(&self) -> String {
        let mut text = self.lines.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        text
    }
}

/// Point in time snapshot of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub run_id: String,
    pub name: String,
    pub kind: ExecutionKind,
    pub state: LifecycleState,
    pub status_description: String,
    /// Step copies that are running or not idle, pipelines only
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepRuntimeStatus>,
    /// Error reported by the engine for the last verb or the run itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log: Option<LogChunk>,
}

impl ExecutionStatus {
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// Attach an error message, keeping an existing one in front
    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        let message = message.into();
        self.error = Some(match self.error.take() {
            Some(existing) => format!("{existing}; {message}"),
            None => message,
        });
        self
    }

    pub fn with_log(mut self, log: LogChunk) -> Self {
        self.log = Some(log);
        self
    }
}
