//! Cluster level documents: port allocation, peers, row samples, sequences

use std::{collections::BTreeMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::status::LifecycleState;

/// Query parameters of a cluster port allocation.
///
/// The source/target tuples identify the two step copies that will stream
/// rows to each other over the allocated port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortAllocationRequest {
    pub run_id: String,
    pub range_start: u16,
    /// Address of the node that will listen on the port
    pub hostname: String,
    pub pipeline_name: String,
    pub source_node: String,
    pub source_step: String,
    pub source_copy: u32,
    pub target_node: String,
    pub target_step: String,
    pub target_copy: u32,
}

/// Allocated port
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
}

/// Public description of a node, without credentials
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, derive_new::new)]
pub struct PeerNode {
    pub name: String,
    pub hostname: String,
    pub port: String,
    #[new(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_app_path: Option<String>,
    #[new(default)]
    #[serde(default)]
    pub master: bool,
}

impl fmt::Display for PeerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.hostname, self.port)
    }
}

/// A peer slave as known by a master
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlaveDetection {
    pub node: PeerNode,
    pub active: bool,
    pub last_active_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_inactive_at: Option<DateTime<Utc>>,
}

/// Number of executions in one lifecycle state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCount {
    pub state: LifecycleState,
    pub count: usize,
}

/// Node level status
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub name: String,
    pub master: bool,
    pub version: String,
    pub uptime_secs: u64,
    pub pipelines: Vec<StateCount>,
    pub jobs: Vec<StateCount>,
}

/// Properties a node shares with the pipelines it runs, by name
pub type NodeProperties = BTreeMap<String, String>;

/// Which side of a step a row sample is taken from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SniffKind {
    Input,
    #[default]
    Output,
}

impl fmt::Display for SniffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SniffKind::Input => f.write_str("input"),
            SniffKind::Output => f.write_str("output"),
        }
    }
}

fn default_sniff_lines() -> usize {
    10
}

/// Query parameters of a row sample request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SniffRequest {
    pub step: String,
    #[serde(default)]
    pub copy: u32,
    #[serde(default = "default_sniff_lines")]
    pub lines: usize,
    #[serde(default)]
    pub kind: SniffKind,
}

/// Most recent rows seen by a running step copy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowSample {
    pub step_name: String,
    pub copy: u32,
    pub kind: SniffKind,
    pub rows: Vec<serde_json::Value>,
}

/// Start of a reserved block of sequence values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceValue {
    pub name: String,
    pub value: i64,
    pub increment: i64,
}
