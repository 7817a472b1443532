use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{BaselineStore, EntityKey, MetricSnapshot, MintRecord, PendingMintRecord, StoreError};

#[derive(Debug, Default)]
struct MemoryState {
    baselines: BTreeMap<EntityKey, MetricSnapshot>,
    audit: BTreeMap<EntityKey, Vec<MintRecord>>,
    pending: BTreeMap<EntityKey, PendingMintRecord>,
}

/// In-process backend. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct MemoryBaselineStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryBaselineStore {
    pub fn with_baseline(entity: &EntityKey, snapshot: MetricSnapshot) -> Self {
        let store = Self::default();
        store
            .lock()
            .baselines
            .insert(entity.clone(), snapshot);
        store
    }

    pub fn baseline(&self, entity: &EntityKey) -> Option<MetricSnapshot> {
        self.lock().baselines.get(entity).copied()
    }

    pub fn audit_records(&self, entity: &EntityKey) -> Vec<MintRecord> {
        self.lock().audit.get(entity).cloned().unwrap_or_default()
    }

    pub fn pending(&self, entity: &EntityKey) -> Option<PendingMintRecord> {
        self.lock().pending.get(entity).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl BaselineStore for MemoryBaselineStore {
    fn load_snapshot(&self, entity: &EntityKey) -> Result<Option<MetricSnapshot>, StoreError> {
        Ok(self.baseline(entity))
    }

    fn save(&self, entity: &EntityKey, snapshot: &MetricSnapshot) -> Result<(), StoreError> {
        self.lock().baselines.insert(entity.clone(), *snapshot);
        Ok(())
    }

    fn append_audit(&self, entity: &EntityKey, record: &MintRecord) -> Result<(), StoreError> {
        self.lock()
            .audit
            .entry(entity.clone())
            .or_default()
            .push(record.clone());
        Ok(())
    }

    fn load_pending(&self, entity: &EntityKey) -> Result<Option<PendingMintRecord>, StoreError> {
        Ok(self.pending(entity))
    }

    fn save_pending(
        &self,
        entity: &EntityKey,
        pending: &PendingMintRecord,
    ) -> Result<(), StoreError> {
        self.lock().pending.insert(entity.clone(), pending.clone());
        Ok(())
    }

    fn clear_pending(&self, entity: &EntityKey) -> Result<(), StoreError> {
        self.lock().pending.remove(entity);
        Ok(())
    }
}
