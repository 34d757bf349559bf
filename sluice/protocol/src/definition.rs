//! Serialized graph definitions
//!
//! A definition only names the graph elements and the knobs the hosting
//! engine understands. What a step does with its rows is the engine's
//! business.

use serde::{Deserialize, Serialize};

fn default_copies() -> u32 {
    1
}

/// One step of a pipeline, run as `copies` parallel step copies
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
pub struct StepDefinition {
    pub name: String,
    #[new(value = "1")]
    #[serde(default = "default_copies")]
    pub copies: u32,
    /// Rows each copy produces
    #[new(default)]
    #[serde(default)]
    pub rows: u64,
    /// Pause between two rows
    #[new(default)]
    #[serde(default)]
    pub row_delay_ms: u64,
    /// Make each copy fail once it has written this many rows
    #[new(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_after: Option<u64>,
}

/// Definition of a row-oriented pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
pub struct PipelineDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
}

/// One entry of a job, executed sequentially
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
pub struct EntryDefinition {
    pub name: String,
    #[new(default)]
    #[serde(default)]
    pub duration_ms: u64,
    #[new(default)]
    #[serde(default)]
    pub fail: bool,
}

/// Definition of a control-flow job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, derive_new::new)]
pub struct JobDefinition {
    pub name: String,
    pub entries: Vec<EntryDefinition>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_copies_default_to_one() {
        let step: StepDefinition = serde_json::from_str(r#"{"name":"read"}"#).unwrap();

        assert_eq!(step.copies, 1);
        assert_eq!(step.rows, 0);
        assert_eq!(step, StepDefinition::new("read".into()));
    }
}
