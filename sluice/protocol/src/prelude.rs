//! Prelude module that exports commonly used types.
//!
//! This module provides a convenient way to import all the wire types
//! with a single `use sluice_protocol::prelude::*;` statement.

pub use crate::cluster::{
    NodeProperties, PeerNode, PortAllocation, PortAllocationRequest, RowSample, SequenceValue,
    ServerStatus, SlaveDetection, SniffKind, SniffRequest, StateCount,
};
pub use crate::configuration::{
    ExecutionConfiguration, ExecutionResult, JobConfiguration, LogLevel, PipelineConfiguration,
    RepositoryReference,
};
pub use crate::definition::{EntryDefinition, JobDefinition, PipelineDefinition, StepDefinition};
pub use crate::status::{
    ExecutionStatus, LifecycleState, LogChunk, StepRuntimeStatus, StepState,
};
pub use crate::{ExecutionKind, RunEntry, WebResult, WebResultKind};
