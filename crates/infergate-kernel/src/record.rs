//! Registry entity and its partial-update type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::RegistryError;
use crate::identity::{JobHandle, UnitId};
use crate::status::WorkUnitStatus;

/// One unit of batch inference work tracked by the registry.
///
/// Invariants (checked by [WorkUnitRecord::validate]):
/// - `status == Pending` exactly when `external_job_handle` is absent;
/// - `output_location` is set exactly when the status is a terminal success.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitRecord {
    pub id: UnitId,
    pub status: WorkUnitStatus,
    /// URI of the input payload; immutable.
    pub data_location: String,
    pub external_job_handle: Option<JobHandle>,
    /// Generated external job name, set together with the handle.
    pub job_name: Option<String>,
    pub output_location: Option<String>,
    /// Failed submission attempts while `Pending`.
    pub submit_attempts: u32,
    pub last_error: Option<String>,
    /// When the external service observed the current status, if it said so.
    pub status_observed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkUnitRecord {
    /// New record as produced by upstream ingestion.
    pub fn pending(
        id: impl Into<UnitId>,
        data_location: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            status: WorkUnitStatus::Pending,
            data_location: data_location.into(),
            external_job_handle: None,
            job_name: None,
            output_location: None,
            submit_attempts: 0,
            last_error: None,
            status_observed_at: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn validate(&self) -> Result<(), RegistryError> {
        let has_handle = self
            .external_job_handle
            .as_deref()
            .is_some_and(|h| !h.is_empty());
        if (self.status == WorkUnitStatus::Pending) == has_handle {
            return Err(RegistryError::InvalidRecord(format!(
                "record {} has status {} but handle {:?}",
                self.id, self.status, self.external_job_handle
            )));
        }
        let has_output = self
            .output_location
            .as_deref()
            .is_some_and(|o| !o.is_empty());
        if self.status.is_success() != has_output {
            return Err(RegistryError::InvalidRecord(format!(
                "record {} has status {} but output location {:?}",
                self.id, self.status, self.output_location
            )));
        }
        Ok(())
    }
}

/// Partial update of a [WorkUnitRecord]. Unset fields are left untouched.
///
/// With [RecordUpdate::when_status] the write becomes conditional: registries apply it
/// atomically only if the stored status still matches, and report `false` otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordUpdate {
    pub updated_at: DateTime<Utc>,
    pub status: Option<WorkUnitStatus>,
    pub external_job_handle: Option<JobHandle>,
    pub job_name: Option<String>,
    pub output_location: Option<String>,
    pub submit_attempts: Option<u32>,
    pub last_error: Option<String>,
    pub status_observed_at: Option<DateTime<Utc>>,
    pub expected_status: Option<WorkUnitStatus>,
}

impl RecordUpdate {
    pub fn at(updated_at: DateTime<Utc>) -> Self {
        Self {
            updated_at,
            status: None,
            external_job_handle: None,
            job_name: None,
            output_location: None,
            submit_attempts: None,
            last_error: None,
            status_observed_at: None,
            expected_status: None,
        }
    }

    pub fn status(mut self, status: WorkUnitStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn external_job_handle(mut self, handle: impl Into<JobHandle>) -> Self {
        self.external_job_handle = Some(handle.into());
        self
    }

    pub fn job_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn output_location(mut self, location: impl Into<String>) -> Self {
        self.output_location = Some(location.into());
        self
    }

    pub fn submit_attempts(mut self, attempts: u32) -> Self {
        self.submit_attempts = Some(attempts);
        self
    }

    pub fn last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    pub fn status_observed_at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.status_observed_at = Some(observed_at);
        self
    }

    /// Apply only while the stored status equals `expected`.
    pub fn when_status(mut self, expected: WorkUnitStatus) -> Self {
        self.expected_status = Some(expected);
        self
    }

    pub fn guard_matches(&self, record: &WorkUnitRecord) -> bool {
        self.expected_status
            .map_or(true, |expected| record.status == expected)
    }

    /// Returns the record with this update applied, validated against the record invariants.
    pub fn applied_to(&self, record: &WorkUnitRecord) -> Result<WorkUnitRecord, RegistryError> {
        let mut next = record.clone();
        next.updated_at = self.updated_at;
        if let Some(status) = self.status {
            next.status = status;
        }
        if let Some(handle) = &self.external_job_handle {
            next.external_job_handle = Some(handle.clone());
        }
        if let Some(name) = &self.job_name {
            next.job_name = Some(name.clone());
        }
        if let Some(location) = &self.output_location {
            next.output_location = Some(location.clone());
        }
        if let Some(attempts) = self.submit_attempts {
            next.submit_attempts = attempts;
        }
        if let Some(error) = &self.last_error {
            next.last_error = Some(error.clone());
        }
        if let Some(observed_at) = self.status_observed_at {
            next.status_observed_at = Some(observed_at);
        }
        next.validate()?;
        Ok(next)
    }
}
