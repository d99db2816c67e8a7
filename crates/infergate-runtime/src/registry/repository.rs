//! Storage façade for work-unit records.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use infergate_kernel::{RecordUpdate, RegistryError, WorkUnitRecord, WorkUnitStatus};

/// Registry contract used by the admission controller and the status reconciler.
///
/// Besides the primary key, records are reachable by status (ordered oldest first,
/// ties broken by insertion order) and by external job handle, which is unique once
/// assigned.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Store a new record. Fails with `DuplicateId` if the id exists.
    async fn insert(&self, record: WorkUnitRecord) -> Result<(), RegistryError>;

    async fn get_by_id(&self, id: &str) -> Result<Option<WorkUnitRecord>, RegistryError>;

    /// Unique lookup by external job handle.
    async fn find_by_handle(&self, handle: &str)
        -> Result<Option<WorkUnitRecord>, RegistryError>;

    /// Up to `limit` records in `status`, oldest `created_at` first.
    async fn query_by_status(
        &self,
        status: WorkUnitStatus,
        limit: usize,
    ) -> Result<Vec<WorkUnitRecord>, RegistryError>;

    /// Atomic partial update of one record.
    ///
    /// Returns `Ok(false)` without writing when the update's status guard does not match,
    /// `RecordNotFound` when the id is unknown.
    async fn update_fields(&self, id: &str, update: RecordUpdate) -> Result<bool, RegistryError>;

    /// Number of records per status (statuses without records are omitted).
    async fn status_counts(&self) -> Result<BTreeMap<WorkUnitStatus, u64>, RegistryError>;
}

#[async_trait]
impl<T: Registry + ?Sized> Registry for Arc<T> {
    async fn insert(&self, record: WorkUnitRecord) -> Result<(), RegistryError> {
        (**self).insert(record).await
    }

    async fn get_by_id(&self, id: &str) -> Result<Option<WorkUnitRecord>, RegistryError> {
        (**self).get_by_id(id).await
    }

    async fn find_by_handle(
        &self,
        handle: &str,
    ) -> Result<Option<WorkUnitRecord>, RegistryError> {
        (**self).find_by_handle(handle).await
    }

    async fn query_by_status(
        &self,
        status: WorkUnitStatus,
        limit: usize,
    ) -> Result<Vec<WorkUnitRecord>, RegistryError> {
        (**self).query_by_status(status, limit).await
    }

    async fn update_fields(&self, id: &str, update: RecordUpdate) -> Result<bool, RegistryError> {
        (**self).update_fields(id, update).await
    }

    async fn status_counts(&self) -> Result<BTreeMap<WorkUnitStatus, u64>, RegistryError> {
        (**self).status_counts().await
    }
}
