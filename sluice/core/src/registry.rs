//! Concurrency-safe store of execution objects keyed by run id.
//!
//! Every entry holds the current execution object together with the
//! configuration it was built from, so the object can be rebuilt from
//! scratch. The outer map lock is only held for the map operation itself;
//! swapping the object of one entry locks that entry alone, so callers
//! working on different run ids never wait on each other.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use sluice_protocol::RunEntry;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("run id '{0}' is already registered")]
    DuplicateRunId(String),

    #[error("run id '{0}' not found")]
    NotFound(String),
}

/// Snapshot of one registry entry as seen by a lookup
pub struct ExecutionHandle<O: ?Sized, C> {
    pub entry: RunEntry,
    pub object: Arc<O>,
    pub config: Arc<C>,
    /// Incremented every time the object is replaced
    pub generation: u64,
}

impl<O: ?Sized, C> Clone for ExecutionHandle<O, C> {
    fn clone(&self) -> Self {
        Self {
            entry: self.entry.clone(),
            object: Arc::clone(&self.object),
            config: Arc::clone(&self.config),
            generation: self.generation,
        }
    }
}

struct Current<O: ?Sized, C> {
    object: Arc<O>,
    config: Arc<C>,
    generation: u64,
}

struct Slot<O: ?Sized, C> {
    entry: RunEntry,
    position: u64,
    current: RwLock<Current<O, C>>,
    restart: Arc<Mutex<()>>,
}

impl<O: ?Sized, C> Slot<O, C> {
    fn handle(&self) -> ExecutionHandle<O, C> {
        let current = self.current.read().unwrap_or_else(PoisonError::into_inner);
        ExecutionHandle {
            entry: self.entry.clone(),
            object: Arc::clone(&current.object),
            config: Arc::clone(&current.config),
            generation: current.generation,
        }
    }
}

/// Store of execution objects keyed by run id
pub struct Registry<O: ?Sized, C> {
    slots: RwLock<HashMap<String, Arc<Slot<O, C>>>>,
    next_position: AtomicU64,
}

impl<O: ?Sized, C> Default for Registry<O, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<O: ?Sized, C> Registry<O, C> {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(HashMap::new()),
            next_position: AtomicU64::new(0),
        }
    }

    /// Insert a new entry. Fails when the run id is already present.
    pub fn add(
        &self,
        name: impl Into<String>,
        run_id: impl Into<String>,
        object: Arc<O>,
        config: C,
    ) -> Result<RunEntry, RegistryError> {
        let entry = RunEntry::new(name.into(), run_id.into());

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if slots.contains_key(&entry.run_id) {
            return Err(RegistryError::DuplicateRunId(entry.run_id));
        }

        let slot = Slot {
            entry: entry.clone(),
            position: self.next_position.fetch_add(1, Ordering::Relaxed),
            current: RwLock::new(Current {
                object,
                config: Arc::new(config),
                generation: 0,
            }),
            restart: Arc::new(Mutex::new(())),
        };
        slots.insert(entry.run_id.clone(), Arc::new(slot));

        debug!(run_id = %entry.run_id, name = %entry.name, "Registered execution");
        Ok(entry)
    }

    pub fn get(&self, run_id: &str) -> Result<ExecutionHandle<O, C>, RegistryError> {
        self.slot(run_id).map(|slot| slot.handle())
    }

    pub fn contains(&self, run_id: &str) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(run_id)
    }

    /// All entries in insertion order
    pub fn list(&self) -> Vec<RunEntry> {
        let mut slots: Vec<(u64, RunEntry)> = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|slot| (slot.position, slot.entry.clone()))
            .collect();

        slots.sort_by_key(|(position, _)| *position);
        slots.into_iter().map(|(_, entry)| entry).collect()
    }

    /// Entries with the given name in insertion order
    pub fn find_by_name(&self, name: &str) -> Vec<RunEntry> {
        self.list()
            .into_iter()
            .filter(|entry| entry.name == name)
            .collect()
    }

    pub fn config(&self, entry: &RunEntry) -> Result<Arc<C>, RegistryError> {
        self.slot(&entry.run_id).map(|slot| {
            Arc::clone(
                &slot
                    .current
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .config,
            )
        })
    }

    /// Swap object and configuration under the same entry.
    ///
    /// Returns the new generation. Holders of the run id observe the new
    /// object on their next lookup.
    pub fn replace(
        &self,
        entry: &RunEntry,
        object: Arc<O>,
        config: Arc<C>,
    ) -> Result<u64, RegistryError> {
        let slot = self.slot(&entry.run_id)?;
        let mut current = slot.current.write().unwrap_or_else(PoisonError::into_inner);

        current.object = object;
        current.config = config;
        current.generation += 1;

        debug!(run_id = %entry.run_id, generation = current.generation, "Replaced execution");
        Ok(current.generation)
    }

    /// Remove an entry, returning what it held. Removing an absent entry is a no-op.
    pub fn remove(&self, entry: &RunEntry) -> Option<ExecutionHandle<O, C>> {
        let removed = self
            .slots
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&entry.run_id);

        removed.map(|slot| {
            debug!(run_id = %entry.run_id, "Removed execution");
            slot.handle()
        })
    }

    /// Acquire the critical section guarding object replacement for one run id
    pub async fn lock_run(&self, run_id: &str) -> Result<OwnedMutexGuard<()>, RegistryError> {
        let restart = Arc::clone(&self.slot(run_id)?.restart);
        Ok(restart.lock_owned().await)
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, run_id: &str) -> Result<Arc<Slot<O, C>>, RegistryError> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(run_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(run_id.to_string()))
    }
}
