//! Admission control for batch jobs.
//!
//! Each tick measures how many jobs the external service is really running, and submits
//! at most the remaining capacity of pending records, oldest first. Nothing is retried
//! in-process: a record whose submission failed stays `Pending` and is picked up again by
//! a later tick.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use infergate_kernel::{RecordUpdate, RegistryError, ServiceError, WorkUnitRecord, WorkUnitStatus};

use crate::registry::Registry;
use crate::service::{BatchJobService, JobSubmission};

/// Tuning knobs for the admission controller.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdmissionConfig {
    pub max_concurrent_jobs: usize,
    /// Prefix of generated job names; also the filter used to count active jobs.
    pub job_name_prefix: String,
    pub output_root_uri: String,
    pub execution_role: String,
    /// Failed submissions after which a pending record is reported as likely poison.
    pub poison_threshold: u32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs: 20,
            job_name_prefix: "embedding-batch-job".to_string(),
            output_root_uri: String::new(),
            execution_role: String::new(),
            poison_threshold: 5,
        }
    }
}

/// What one tick did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TickReport {
    pub active_jobs: usize,
    pub capacity: usize,
    /// Jobs submitted and recorded as `Submitted`.
    pub started: usize,
    pub submit_failures: usize,
    /// Submissions whose record had already left `Pending` (another tick won the race).
    pub conflicts: usize,
    /// Records the registry refused to update (e.g. a rejected handle).
    pub record_failures: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("counting active jobs failed: {0}")]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

pub struct AdmissionController<R, S> {
    registry: R,
    service: S,
    config: AdmissionConfig,
}

impl<R: Registry, S: BatchJobService> AdmissionController<R, S> {
    pub fn new(registry: R, service: S, config: AdmissionConfig) -> Self {
        Self {
            registry,
            service,
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    fn job_name(&self) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", self.config.job_name_prefix, &suffix[..12])
    }

    pub async fn tick(&self) -> Result<TickReport, ControllerError> {
        self.tick_at(Utc::now()).await
    }

    /// One admission pass, stamping registry writes with `now`.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport, ControllerError> {
        let active_jobs = self
            .service
            .count_active_jobs(&self.config.job_name_prefix)
            .await?;
        let capacity = self.config.max_concurrent_jobs.saturating_sub(active_jobs);
        let mut report = TickReport {
            active_jobs,
            capacity,
            ..TickReport::default()
        };
        if capacity == 0 {
            info!(
                active_jobs,
                max_concurrent_jobs = self.config.max_concurrent_jobs,
                "at capacity; no jobs submitted"
            );
            return Ok(report);
        }

        let pending = self
            .registry
            .query_by_status(WorkUnitStatus::Pending, capacity)
            .await?;
        if pending.is_empty() {
            debug!(capacity, "no pending work units");
            return Ok(report);
        }

        for record in pending {
            self.admit(record, now, &mut report).await?;
        }
        info!(
            active_jobs = report.active_jobs,
            capacity = report.capacity,
            started = report.started,
            submit_failures = report.submit_failures,
            conflicts = report.conflicts,
            record_failures = report.record_failures,
            "admission tick finished"
        );
        Ok(report)
    }

    async fn admit(
        &self,
        record: WorkUnitRecord,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<(), ControllerError> {
        let submission = JobSubmission {
            name: self.job_name(),
            input_uri: record.data_location.clone(),
            output_uri: self.config.output_root_uri.clone(),
            execution_role: self.config.execution_role.clone(),
        };

        match self.service.submit_job(&submission).await {
            Ok(handle) => {
                let update = RecordUpdate::at(now)
                    .status(WorkUnitStatus::Submitted)
                    .external_job_handle(handle.clone())
                    .job_name(submission.name.clone())
                    .when_status(WorkUnitStatus::Pending);
                match self.registry.update_fields(&record.id, update).await {
                    Ok(true) => {
                        report.started += 1;
                        info!(unit_id = %record.id, job_name = %submission.name, %handle, "job submitted");
                    }
                    Ok(false) => {
                        report.conflicts += 1;
                        warn!(
                            unit_id = %record.id,
                            %handle,
                            "record left Pending before submission was recorded; job may be a duplicate"
                        );
                    }
                    Err(err) if !err.is_driver() => {
                        report.record_failures += 1;
                        warn!(
                            unit_id = %record.id,
                            %handle,
                            job_name = %submission.name,
                            error = %err,
                            "submitted job could not be recorded; record stays Pending"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Err(err) => {
                report.submit_failures += 1;
                let attempts = record.submit_attempts.saturating_add(1);
                warn!(
                    unit_id = %record.id,
                    attempts,
                    transient = err.is_transient(),
                    error = %err,
                    "job submission failed; record stays Pending"
                );
                if attempts >= self.config.poison_threshold {
                    warn!(
                        unit_id = %record.id,
                        attempts,
                        data_location = %record.data_location,
                        "pending record keeps failing submission; needs manual remediation"
                    );
                }
                let update = RecordUpdate::at(now)
                    .submit_attempts(attempts)
                    .last_error(err.to_string())
                    .when_status(WorkUnitStatus::Pending);
                match self.registry.update_fields(&record.id, update).await {
                    Ok(_) => {}
                    Err(err) if !err.is_driver() => {
                        report.record_failures += 1;
                        warn!(unit_id = %record.id, error = %err, "recording failed submission failed");
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(())
    }
}
