//! Instance Persistence
//!
//! Saving and loading process instances with optimistic versioning, plus
//! definition deployment. [`MemoryPersistence`] keeps everything in memory;
//! snapshots can additionally be written to disk as JSON.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info};
use thiserror::Error;

use crate::execution::{InstanceId, ProcessInstance, TokenId};
use crate::graph::{JoinLockMode, ProcessDefinition};

#[derive(Debug, Error)]
pub enum PersistenceError {
    /// Someone saved the instance since it was loaded.
    #[error("process instance {instance} is stale: loaded version {expected}, stored version {found}")]
    Stale {
        instance: InstanceId,
        expected: u64,
        found: u64,
    },

    #[error("process instance {0} not found")]
    NotFound(InstanceId),

    #[error("process instance {instance} can't be persisted: {reason}")]
    Unpersistable { instance: InstanceId, reason: String },

    #[error("failed to write snapshot '{path}': {reason}")]
    Snapshot { path: String, reason: String },
}

impl PersistenceError {
    pub fn is_stale_version(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

pub trait PersistenceService: Send + Sync {
    /// Hands out a fresh instance id.
    fn assign_id(&self) -> InstanceId;

    /// Stores the instance and bumps its version.
    fn save(&self, instance: &mut ProcessInstance) -> Result<(), PersistenceError>;

    fn load(&self, id: InstanceId) -> Result<ProcessInstance, PersistenceError>;

    fn delete(&self, id: InstanceId) -> Result<(), PersistenceError>;

    /// Publishes a definition as the next version of its name.
    fn deploy(&self, definition: ProcessDefinition) -> Arc<ProcessDefinition>;

    /// Latest deployed version of a definition.
    fn find_definition(&self, name: &str) -> Option<Arc<ProcessDefinition>>;

    /// Row lock a join takes on the parent token before counting arrivals.
    fn lock_token(
        &self,
        instance: &ProcessInstance,
        token: TokenId,
        mode: JoinLockMode,
    ) -> Result<(), PersistenceError>;
}

#[derive(Default)]
struct Store {
    instances: HashMap<InstanceId, ProcessInstance>,
    definitions: BTreeMap<String, Vec<Arc<ProcessDefinition>>>,
}

/// In-memory persistence with optimistic version checks.
#[derive(Default)]
pub struct MemoryPersistence {
    store: Mutex<Store>,
    next_id: AtomicU64,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.store().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self) -> std::sync::MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stored_version(&self, id: InstanceId) -> Option<u64> {
        self.store().instances.get(&id).map(ProcessInstance::version)
    }
}

impl PersistenceService for MemoryPersistence {
    fn assign_id(&self) -> InstanceId {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn save(&self, instance: &mut ProcessInstance) -> Result<(), PersistenceError> {
        let mut store = self.store();
        if let Some(stored) = store.instances.get(&instance.id()) {
            if stored.version() != instance.version() {
                return Err(PersistenceError::Stale {
                    instance: instance.id(),
                    expected: instance.version(),
                    found: stored.version(),
                });
            }
        }

        instance.set_version(instance.version() + 1);
        let mut copy = instance.clone();
        copy.take_cascade();
        store.instances.insert(instance.id(), copy);
        debug!("Saved process instance {} (version {})", instance.id(), instance.version());
        Ok(())
    }

    fn load(&self, id: InstanceId) -> Result<ProcessInstance, PersistenceError> {
        self.store()
            .instances
            .get(&id)
            .cloned()
            .ok_or(PersistenceError::NotFound(id))
    }

    fn delete(&self, id: InstanceId) -> Result<(), PersistenceError> {
        self.store()
            .instances
            .remove(&id)
            .map(|_| ())
            .ok_or(PersistenceError::NotFound(id))
    }

    fn deploy(&self, mut definition: ProcessDefinition) -> Arc<ProcessDefinition> {
        let mut store = self.store();
        let versions = store
            .definitions
            .entry(definition.name().to_string())
            .or_default();
        definition.set_version(versions.len() as u32 + 1);
        info!("Deployed '{}' version {}", definition.name(), definition.version());

        let definition = Arc::new(definition);
        versions.push(Arc::clone(&definition));
        definition
    }

    fn find_definition(&self, name: &str) -> Option<Arc<ProcessDefinition>> {
        self.store().definitions.get(name)?.last().cloned()
    }

    fn lock_token(
        &self,
        instance: &ProcessInstance,
        token: TokenId,
        mode: JoinLockMode,
    ) -> Result<(), PersistenceError> {
        match mode {
            JoinLockMode::None | JoinLockMode::Read => Ok(()),
            JoinLockMode::Upgrade | JoinLockMode::Pessimistic => {
                debug!(
                    "{} lock on token {} of instance {}",
                    mode,
                    token,
                    instance.id()
                );
                match self.stored_version(instance.id()) {
                    Some(found) if found != instance.version() => Err(PersistenceError::Stale {
                        instance: instance.id(),
                        expected: instance.version(),
                        found,
                    }),
                    _ => Ok(()),
                }
            }
        }
    }
}

/// Writes an instance snapshot as pretty-printed JSON.
///
/// Fails when a variable has no persistable form.
pub fn write_snapshot(instance: &ProcessInstance, path: &Path) -> Result<(), PersistenceError> {
    let snapshot_error = |reason: String| PersistenceError::Snapshot {
        path: path.display().to_string(),
        reason,
    };

    let json = serde_json::to_string_pretty(&instance.snapshot()).map_err(|e| snapshot_error(e.to_string()))?;
    fs::write(path, json).map_err(|e| snapshot_error(e.to_string()))?;

    info!("Saved instance snapshot to {}", path.display());
    Ok(())
}
