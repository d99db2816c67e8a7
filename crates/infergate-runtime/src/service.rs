//! Contracts for the external inference service.
//!
//! The batch side talks to a managed job service ([BatchJobService]); the on-demand side
//! calls a rate-limited invocation endpoint ([Invoker]). Both surface
//! [ServiceError::Transient] distinctly from permanent failures.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use infergate_kernel::{JobHandle, ServiceError, UnitId, WorkUnitStatus};

/// Request to create one batch job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobSubmission {
    pub name: String,
    pub input_uri: String,
    pub output_uri: String,
    pub execution_role: String,
}

/// What the service currently reports for a job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JobDescription {
    pub status: WorkUnitStatus,
    /// Output location, when the service reports one.
    pub output_location_hint: Option<String>,
}

#[async_trait]
pub trait BatchJobService: Send + Sync {
    /// Number of jobs in a non-terminal status whose name contains `name_filter`.
    async fn count_active_jobs(&self, name_filter: &str) -> Result<usize, ServiceError>;

    async fn submit_job(&self, submission: &JobSubmission) -> Result<JobHandle, ServiceError>;

    async fn describe_job(&self, handle: &str) -> Result<JobDescription, ServiceError>;
}

#[async_trait]
impl<T: BatchJobService + ?Sized> BatchJobService for Arc<T> {
    async fn count_active_jobs(&self, name_filter: &str) -> Result<usize, ServiceError> {
        (**self).count_active_jobs(name_filter).await
    }

    async fn submit_job(&self, submission: &JobSubmission) -> Result<JobHandle, ServiceError> {
        (**self).submit_job(submission).await
    }

    async fn describe_job(&self, handle: &str) -> Result<JobDescription, ServiceError> {
        (**self).describe_job(handle).await
    }
}

/// One unit of on-demand work. Not persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: UnitId,
    pub payload: Value,
}

impl WorkUnit {
    pub fn new(id: impl Into<UnitId>, payload: Value) -> Self {
        Self {
            id: id.into(),
            payload,
        }
    }
}

/// Synchronous-per-item invocation endpoint.
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, unit: &WorkUnit) -> Result<Value, ServiceError>;
}

#[async_trait]
impl<T: Invoker + ?Sized> Invoker for Arc<T> {
    async fn invoke(&self, unit: &WorkUnit) -> Result<Value, ServiceError> {
        (**self).invoke(unit).await
    }
}
