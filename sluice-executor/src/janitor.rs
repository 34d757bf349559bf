//! Periodic housekeeping of a node.
//!
//! Executions that stayed in a terminal state for longer than the object
//! retention are removed, together with their log and cluster ports. The
//! time an execution became terminal is the first sweep that saw it so.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use sluice_core::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{
    control::{self, Family, Jobs, Pipelines},
    ApiContextRef,
};

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<String>,
    pub trimmed_lines: usize,
    pub expired_peers: usize,
}

pub struct Janitor {
    context: ApiContextRef,
    /// Keyed by kind and run id, holding the generation seen terminal and since when
    terminal_since: HashMap<(ExecutionKind, String), (u64, DateTime<Utc>)>,
}

impl Janitor {
    pub fn new(context: ApiContextRef) -> Self {
        Self {
            context,
            terminal_since: HashMap::new(),
        }
    }

    pub async fn sweep(&mut self, now: DateTime<Utc>) -> SweepReport {
        let mut removed = self.sweep_family::<Pipelines>(now).await;
        removed.extend(self.sweep_family::<Jobs>(now).await);

        let report = SweepReport {
            removed,
            trimmed_lines: self.context.log_store.trim_expired(now),
            expired_peers: self
                .context
                .peers
                .expire(now, self.context.config.peer_timeout),
        };

        if report != SweepReport::default() {
            info!(
                removed = report.removed.len(),
                trimmed_lines = report.trimmed_lines,
                expired_peers = report.expired_peers,
                "Janitor sweep finished"
            );
        }
        report
    }

    async fn sweep_family<F: Family>(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let retention = self.context.config.object_retention;
        let registry = F::registry(&self.context);

        let mut expired = vec![];
        let mut seen = HashSet::new();
        for entry in registry.list() {
            let Ok(handle) = registry.get(&entry.run_id) else {
                continue;
            };
            if !handle.object.state().is_terminal() {
                continue;
            }

            let key = (F::KIND, entry.run_id.clone());
            let since = match self.terminal_since.get(&key) {
                Some((generation, since)) if *generation == handle.generation => *since,
                _ => {
                    self.terminal_since.insert(key.clone(), (handle.generation, now));
                    now
                }
            };
            seen.insert(key);

            if now - since >= retention {
                expired.push((entry.run_id, handle.generation));
            }
        }
        self.terminal_since
            .retain(|key, _| key.0 != F::KIND || seen.contains(key));

        // A run may be restarted between the scan and its removal
        let mut removed = vec![];
        for (run_id, generation) in expired {
            if control::remove_expired::<F>(&self.context, &run_id, generation)
                .await
                .is_some()
            {
                debug!(kind = %F::KIND, run_id = %run_id, "Removed expired execution");
                self.terminal_since.remove(&(F::KIND, run_id.clone()));
                removed.push(run_id);
            }
        }
        removed
    }

    /// Sweep every `interval` until shutdown
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.context.config.janitor_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(interval = ?self.context.config.janitor_interval, "Starting janitor");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Janitor stopped");
                    return;
                }
                _ = interval.tick() => {
                    self.sweep(Utc::now()).await;
                }
            }
        }
    }
}
