//! Execution configuration submitted together with a definition

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::{JobDefinition, PipelineDefinition};

/// Verbosity of an execution log
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Nothing,
    Error,
    Minimal,
    #[default]
    Basic,
    Detailed,
    Debug,
    Rowlevel,
}

impl LogLevel {
    /// Whether a line logged at `level` is kept under this setting
    pub fn includes(&self, level: LogLevel) -> bool {
        level != LogLevel::Nothing && level <= *self
    }
}

/// Reference to a metadata repository holding shared definitions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
pub struct RepositoryReference {
    pub name: String,
    #[new(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Result of a finished run, chained into follow-up jobs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default)]
    pub errors: u64,
    #[serde(default)]
    pub rows_read: u64,
    #[serde(default)]
    pub rows_written: u64,
    #[serde(default)]
    pub exit_status: i32,
}

/// Everything needed to (re)build an execution object besides its definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfiguration {
    pub variables: BTreeMap<String, String>,
    pub parameters: BTreeMap<String, String>,
    pub arguments: Vec<String>,
    pub log_level: LogLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repository: Option<RepositoryReference>,
    pub safe_mode: bool,
    pub gathering_metrics: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_date: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_result: Option<ExecutionResult>,
}

/// Submit payload for pipelines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_new::new)]
pub struct PipelineConfiguration {
    pub definition: PipelineDefinition,
    #[serde(default)]
    pub configuration: ExecutionConfiguration,
}

/// Submit payload for jobs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_new::new)]
pub struct JobConfiguration {
    pub definition: JobDefinition,
    #[serde(default)]
    pub configuration: ExecutionConfiguration,
}
