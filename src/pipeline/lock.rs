//! Entity-scoped run locks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The run currently holding an entity.
#[derive(Debug, Clone)]
pub struct ActiveRun {
    /// Set once the run has been registered in the store.
    pub run_id: Option<Uuid>,
    pub cancel: CancellationToken,
}

/// At most one active run per entity.
///
/// Acquisition never waits: a held entity is reported to the caller, who
/// turns it into a conflict.
#[derive(Debug, Clone, Default)]
pub struct EntityLocks {
    inner: Arc<Mutex<HashMap<String, ActiveRun>>>,
}

impl EntityLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, ActiveRun>> {
        // A panic while holding the map cannot leave it half-updated.
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Take the lock for an entity.
    ///
    /// Returns the holder's state as the error if the entity is already locked.
    pub fn try_acquire(&self, entity: &str) -> Result<EntityGuard, ActiveRun> {
        let mut map = self.map();
        if let Some(active) = map.get(entity) {
            return Err(active.clone());
        }
        let cancel = CancellationToken::new();
        map.insert(
            entity.to_string(),
            ActiveRun {
                run_id: None,
                cancel: cancel.clone(),
            },
        );
        drop(map);

        tracing::debug!(entity, "Entity lock acquired");
        Ok(EntityGuard {
            locks: self.clone(),
            entity: entity.to_string(),
            cancel,
        })
    }

    #[must_use]
    pub fn is_locked(&self, entity: &str) -> bool {
        self.map().contains_key(entity)
    }

    #[must_use]
    pub fn active_run(&self, entity: &str) -> Option<ActiveRun> {
        self.map().get(entity).cloned()
    }

    /// Entities with an active run.
    #[must_use]
    pub fn locked_entities(&self) -> Vec<String> {
        self.map().keys().cloned().collect()
    }

    /// Request cancellation of a run. Returns false if no active run has this id.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        let map = self.map();
        match map.values().find(|a| a.run_id == Some(run_id)) {
            Some(active) => {
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    fn bind(&self, entity: &str, run_id: Uuid) {
        if let Some(active) = self.map().get_mut(entity) {
            active.run_id = Some(run_id);
        }
    }

    fn release(&self, entity: &str) {
        self.map().remove(entity);
        tracing::debug!(entity, "Entity lock released");
    }
}

/// Holds an entity's lock; releases it on drop.
#[derive(Debug)]
pub struct EntityGuard {
    locks: EntityLocks,
    entity: String,
    cancel: CancellationToken,
}

impl EntityGuard {
    #[must_use]
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// Record the run id holding the lock so it can be cancelled by id.
    pub fn bind(&self, run_id: Uuid) {
        self.locks.bind(&self.entity, run_id);
    }

    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

impl Drop for EntityGuard {
    fn drop(&mut self) {
        self.locks.release(&self.entity);
    }
}
