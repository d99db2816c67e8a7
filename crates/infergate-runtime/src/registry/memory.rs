//! In-process registry. Used by tests and the `memory` backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use infergate_kernel::{RecordUpdate, RegistryError, UnitId, WorkUnitRecord, WorkUnitStatus};

use super::repository::Registry;

#[derive(Default)]
struct MemoryState {
    next_seq: u64,
    records: HashMap<UnitId, (u64, WorkUnitRecord)>,
    by_handle: HashMap<String, UnitId>,
}

/// Registry backed by a mutex-guarded map; clones share the same records.
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, RegistryError> {
        self.state
            .lock()
            .map_err(|_| RegistryError::Driver("in-memory registry lock poisoned".to_string()))
    }

    /// Snapshot of every record, in insertion order.
    pub fn records(&self) -> Result<Vec<WorkUnitRecord>, RegistryError> {
        let state = self.lock()?;
        let mut rows: Vec<_> = state.records.values().cloned().collect();
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, record)| record).collect())
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn insert(&self, record: WorkUnitRecord) -> Result<(), RegistryError> {
        record.validate()?;
        let mut state = self.lock()?;
        if state.records.contains_key(&record.id) {
            return Err(RegistryError::DuplicateId(record.id));
        }
        if let Some(handle) = &record.external_job_handle {
            if state.by_handle.contains_key(handle) {
                return Err(RegistryError::DuplicateHandle(handle.clone()));
            }
            state.by_handle.insert(handle.clone(), record.id.clone());
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(record.id.clone(), (seq, record));
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<WorkUnitRecord>, RegistryError> {
        let state = self.lock()?;
        Ok(state.records.get(id).map(|(_, record)| record.clone()))
    }

    async fn find_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<WorkUnitRecord>, RegistryError> {
        let state = self.lock()?;
        Ok(state
            .by_handle
            .get(handle)
            .and_then(|id| state.records.get(id))
            .map(|(_, record)| record.clone()))
    }

    async fn query_by_status(
        &self,
        status: WorkUnitStatus,
        limit: usize,
    ) -> Result<Vec<WorkUnitRecord>, RegistryError> {
        let state = self.lock()?;
        let mut matching: Vec<&(u64, WorkUnitRecord)> = state
            .records
            .values()
            .filter(|(_, record)| record.status == status)
            .collect();
        matching.sort_by_key(|(seq, record)| (record.created_at, *seq));
        Ok(matching
            .into_iter()
            .take(limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn update_fields(&self, id: &str, update: RecordUpdate) -> Result<bool, RegistryError> {
        let mut state = self.lock()?;
        let current = match state.records.get(id) {
            Some((_, record)) => record.clone(),
            None => return Err(RegistryError::RecordNotFound(id.to_string())),
        };
        if !update.guard_matches(&current) {
            return Ok(false);
        }
        let next = update.applied_to(&current)?;

        if let Some(handle) = &next.external_job_handle {
            match state.by_handle.get(handle) {
                Some(owner) if owner != id => {
                    return Err(RegistryError::DuplicateHandle(handle.clone()));
                }
                _ => {}
            }
        }
        if current.external_job_handle != next.external_job_handle {
            if let Some(old) = &current.external_job_handle {
                state.by_handle.remove(old);
            }
            if let Some(handle) = &next.external_job_handle {
                state.by_handle.insert(handle.clone(), id.to_string());
            }
        }
        if let Some(entry) = state.records.get_mut(id) {
            entry.1 = next;
        }
        Ok(true)
    }

    async fn status_counts(&self) -> Result<BTreeMap<WorkUnitStatus, u64>, RegistryError> {
        let state = self.lock()?;
        let mut counts = BTreeMap::new();
        for (_, record) in state.records.values() {
            *counts.entry(record.status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use infergate_kernel::{WorkUnitRecord, WorkUnitStatus};

    use super::InMemoryRegistry;
    use crate::registry::contract::{self, t};
    use crate::registry::Registry;

    #[tokio::test]
    async fn memory_registry_insert_and_lookup_contract() {
        contract::assert_insert_and_lookup(&InMemoryRegistry::new()).await;
    }

    #[tokio::test]
    async fn memory_registry_pending_order_contract() {
        contract::assert_pending_order(&InMemoryRegistry::new()).await;
    }

    #[tokio::test]
    async fn memory_registry_partial_update_contract() {
        contract::assert_partial_update(&InMemoryRegistry::new()).await;
    }

    #[tokio::test]
    async fn memory_registry_guarded_update_contract() {
        contract::assert_guarded_update(&InMemoryRegistry::new()).await;
    }

    #[tokio::test]
    async fn memory_registry_unique_handle_contract() {
        contract::assert_unique_handle(&InMemoryRegistry::new()).await;
    }

    #[tokio::test]
    async fn memory_registry_status_counts_contract() {
        contract::assert_status_counts(&InMemoryRegistry::new()).await;
    }

    #[tokio::test]
    async fn clones_share_records() {
        let registry = InMemoryRegistry::new();
        let other = registry.clone();
        registry
            .insert(WorkUnitRecord::pending("u-1", "s3://in", t(0)))
            .await
            .unwrap();
        let records = other.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, WorkUnitStatus::Pending);
    }
}
