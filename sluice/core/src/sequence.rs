//! Named sequences handed out in blocks to pipelines running anywhere in
//! the cluster.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    #[error("sequence '{0}' is not defined on this node")]
    Unknown(String),

    #[error("increment must be positive, got {0}")]
    InvalidIncrement(i64),

    #[error("sequence '{0}' overflowed")]
    Overflow(String),
}

#[derive(Debug)]
pub struct SequenceStore {
    values: Mutex<HashMap<String, i64>>,
    /// Start value for sequences created on first use; `None` rejects unknown names
    auto_start: Option<i64>,
}

impl SequenceStore {
    pub fn new(auto_start: Option<i64>) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            auto_start,
        }
    }

    /// Define or reset a sequence
    pub fn define(&self, name: impl Into<String>, start: i64) {
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), start);
    }

    /// Reserve `increment` values and return the first one of the block
    pub fn next_value(&self, name: &str, increment: i64) -> Result<i64, SequenceError> {
        if increment <= 0 {
            return Err(SequenceError::InvalidIncrement(increment));
        }

        let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
        let current = match values.get_mut(name) {
            Some(current) => current,
            None => {
                let start = self
                    .auto_start
                    .ok_or_else(|| SequenceError::Unknown(name.to_string()))?;
                values.entry(name.to_string()).or_insert(start)
            }
        };

        let value = *current;
        *current = value
            .checked_add(increment)
            .ok_or_else(|| SequenceError::Overflow(name.to_string()))?;

        debug!(sequence = %name, value, increment, "Reserved sequence block");
        Ok(value)
    }
}
