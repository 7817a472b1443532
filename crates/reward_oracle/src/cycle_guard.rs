use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use reward_oracle_store::EntityKey;

/// Tracks entities with a cycle in flight inside this process.
///
/// Only one process may reconcile a given entity against a given store; this guard
/// does not coordinate across processes.
#[derive(Debug, Clone, Default)]
pub struct EntityCycleGuard {
    in_flight: Arc<Mutex<BTreeSet<EntityKey>>>,
}

impl EntityCycleGuard {
    /// Returns `None` when `entity` already has a cycle in flight.
    pub fn try_acquire(&self, entity: &EntityKey) -> Option<EntityCyclePermit> {
        if !self.lock().insert(entity.clone()) {
            return None;
        }
        Some(EntityCyclePermit {
            guard: self.clone(),
            entity: entity.clone(),
        })
    }

    pub fn is_in_flight(&self, entity: &EntityKey) -> bool {
        self.lock().contains(entity)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeSet<EntityKey>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug)]
pub struct EntityCyclePermit {
    guard: EntityCycleGuard,
    entity: EntityKey,
}

impl Drop for EntityCyclePermit {
    fn drop(&mut self) {
        self.guard.lock().remove(&self.entity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_for_same_entity_is_refused() {
        let guard = EntityCycleGuard::default();
        let key = EntityKey::new("UC-a").expect("entity");
        let permit = guard.try_acquire(&key).expect("first permit");
        assert!(guard.try_acquire(&key).is_none());
        assert!(guard.is_in_flight(&key));
        drop(permit);
        assert!(!guard.is_in_flight(&key));
        assert!(guard.try_acquire(&key).is_some());
    }

    #[test]
    fn distinct_entities_do_not_block_each_other() {
        let guard = EntityCycleGuard::default();
        let a = EntityKey::new("UC-a").expect("entity");
        let b = EntityKey::new("UC-b").expect("entity");
        let _permit_a = guard.try_acquire(&a).expect("permit a");
        assert!(guard.try_acquire(&b).is_some());
    }
}
