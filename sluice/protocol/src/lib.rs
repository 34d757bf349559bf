//! Communication protocol for sluice
//!
//! This crate defines the documents exchanged between a coordinator and the
//! control plane of a sluice node. It includes types for:
//!
//! - Submitting pipelines and jobs (definitions plus execution configuration)
//! - Lifecycle status snapshots and per step-copy runtime status
//! - Generic ok/error results for verbs without a richer response
//! - Cluster plumbing: port allocation, peer detection, row samples and sequences
//!
//! All documents are plain serde types serialized as JSON on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod cluster;
pub mod configuration;
pub mod definition;
pub mod status;

/// Prelude module with commonly used types
pub mod prelude;

/// The two families of executions a node can host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    /// Row-oriented dataflow graph of steps
    Pipeline,
    /// Control-flow graph of entries
    Job,
}

impl ExecutionKind {
    /// Path segment used for this kind below `/control`
    pub fn path_segment(&self) -> &'static str {
        match self {
            ExecutionKind::Pipeline => "pipeline",
            ExecutionKind::Job => "job",
        }
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path_segment())
    }
}

/// Identity of one submitted execution.
///
/// `run_id` is unique for the lifetime of the cluster; `name` is the user
/// facing pipeline or job name and may be shared by many concurrent runs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_new::new)]
pub struct RunEntry {
    /// Pipeline or job name
    pub name: String,
    /// Run identifier minted at submit time
    pub run_id: String,
}

impl fmt::Display for RunEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.run_id)
    }
}

/// Outcome of a verb that has no richer response document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WebResultKind {
    Ok,
    Error,
}

/// Generic ok/error result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebResult {
    pub result: WebResultKind,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl WebResult {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            result: WebResultKind::Ok,
            message: message.into(),
            id: None,
        }
    }

    pub fn ok_with_id(message: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            result: WebResultKind::Ok,
            message: message.into(),
            id: Some(id.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            result: WebResultKind::Error,
            message: message.into(),
            id: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == WebResultKind::Ok
    }
}
