use std::sync::{Arc, PoisonError, RwLock};

use sluice_protocol::{configuration::LogLevel, status::LifecycleState};
use tokio::sync::watch;
use tracing::debug;

use crate::{execution::EngineError, log_store::LogStore};

/// Lifecycle state of one execution object, observable through watch receivers
pub(crate) struct Lifecycle {
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        Self {
            state: watch::Sender::new(LifecycleState::Waiting),
        }
    }

    pub(crate) fn current(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    /// Move to `next`, returning the state that was left
    pub(crate) fn transition(&self, next: LifecycleState) -> Result<LifecycleState, EngineError> {
        let mut left = None;
        self.state.send_if_modified(|state| {
            if state.can_transition_to(next) {
                left = Some(*state);
                *state = next;
                true
            } else {
                false
            }
        });

        match left {
            Some(from) => {
                debug!(%from, to = %next, "Lifecycle transition");
                Ok(from)
            }
            None => Err(EngineError::IllegalTransition {
                from: self.current(),
                to: next,
            }),
        }
    }
}

/// Execution log channel filtered by the configured log level
pub(crate) struct RunLog {
    store: Arc<LogStore>,
    channel: String,
    level: RwLock<LogLevel>,
}

impl RunLog {
    pub(crate) fn new(store: Arc<LogStore>, channel: String, level: LogLevel) -> Self {
        Self {
            store,
            channel,
            level: RwLock::new(level),
        }
    }

    pub(crate) fn channel(&self) -> &str {
        &self.channel
    }

    pub(crate) fn set_level(&self, level: LogLevel) {
        *self.level.write().unwrap_or_else(PoisonError::into_inner) = level;
    }

    pub(crate) fn write(&self, level: LogLevel, message: impl AsRef<str>) {
        let kept = self
            .level
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .includes(level);
        if kept {
            self.store.append(&self.channel, level, message);
        }
    }
}
