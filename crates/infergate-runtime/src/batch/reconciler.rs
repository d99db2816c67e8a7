//! Applies external status observations to registry records.
//!
//! Notifications arrive at least once and possibly out of order, so an observation is
//! applied only if it moves the record forward: terminal records never change, lower
//! lifecycle ranks are ignored, and an observation older than the stored one is dropped.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use infergate_kernel::identity::job_id_from_handle;
use infergate_kernel::{RecordUpdate, RegistryError, UnitId, WorkUnitRecord, WorkUnitStatus};

use crate::registry::Registry;
use crate::service::BatchJobService;

use super::events::StatusEvent;

const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied {
        unit_id: UnitId,
        from: WorkUnitStatus,
        to: WorkUnitStatus,
    },
    /// The record already has this status; nothing written.
    Duplicate { unit_id: UnitId },
    /// No record owns the handle.
    Untracked,
    /// The observation would move the record backwards; ignored.
    Stale {
        unit_id: UnitId,
        current: WorkUnitStatus,
        incoming: WorkUnitStatus,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("record {0} kept changing while applying a status update")]
    Contended(UnitId),
}

/// Counters for one [StatusReconciler::sync_in_flight] pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub examined: usize,
    pub applied: usize,
    pub unchanged: usize,
    pub stale: usize,
    pub service_errors: usize,
    /// Records that could not be updated (contention or a rejected write).
    pub record_errors: usize,
}

pub struct StatusReconciler<R> {
    registry: R,
    output_root_uri: String,
}

/// Output location of a finished job: `<root>/<job-id>/`.
pub fn output_location_for(output_root_uri: &str, handle: &str) -> String {
    format!(
        "{}/{}/",
        output_root_uri.trim_end_matches('/'),
        job_id_from_handle(handle)
    )
}

impl<R: Registry> StatusReconciler<R> {
    pub fn new(registry: R, output_root_uri: impl Into<String>) -> Self {
        Self {
            registry,
            output_root_uri: output_root_uri.into(),
        }
    }

    pub async fn on_status_event(
        &self,
        event: &StatusEvent,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.apply(event, None, Utc::now()).await
    }

    /// Like [Self::on_status_event], stamping the write with `now`.
    pub async fn on_status_event_at(
        &self,
        event: &StatusEvent,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        self.apply(event, None, now).await
    }

    async fn apply(
        &self,
        event: &StatusEvent,
        output_hint: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        for _ in 0..MAX_WRITE_ATTEMPTS {
            let Some(record) = self.registry.find_by_handle(&event.handle).await? else {
                warn!(handle = %event.handle, status = %event.status, "status event for untracked job");
                return Ok(ReconcileOutcome::Untracked);
            };
            if let Some(outcome) = check_applicable(&record, event) {
                return Ok(outcome);
            }

            let mut update = RecordUpdate::at(now)
                .status(event.status)
                .when_status(record.status);
            if let Some(observed_at) = event.observed_at {
                update = update.status_observed_at(observed_at);
            }
            if event.status.is_success() {
                let location = output_hint
                    .filter(|hint| !hint.is_empty())
                    .map(str::to_string)
                    .unwrap_or_else(|| output_location_for(&self.output_root_uri, &event.handle));
                update = update.output_location(location);
            }

            if self.registry.update_fields(&record.id, update).await? {
                info!(
                    unit_id = %record.id,
                    handle = %event.handle,
                    from = %record.status,
                    to = %event.status,
                    "status applied"
                );
                return Ok(ReconcileOutcome::Applied {
                    unit_id: record.id,
                    from: record.status,
                    to: event.status,
                });
            }
            debug!(unit_id = %record.id, "record changed concurrently; re-reading");
        }
        let unit_id = self
            .registry
            .find_by_handle(&event.handle)
            .await?
            .map(|record| record.id)
            .unwrap_or_else(|| event.handle.clone());
        Err(ReconcileError::Contended(unit_id))
    }

    /// Poll the service for every in-flight record (at most `limit` per status) and apply
    /// what it reports. Per-job service and registry errors are logged and counted; only
    /// a storage driver failure ends the pass.
    pub async fn sync_in_flight<S: BatchJobService>(
        &self,
        service: &S,
        limit: usize,
    ) -> Result<SyncReport, ReconcileError> {
        let mut in_flight = Vec::new();
        for status in WorkUnitStatus::IN_FLIGHT {
            in_flight.extend(self.registry.query_by_status(status, limit).await?);
        }

        let mut report = SyncReport::default();
        for record in in_flight {
            let Some(handle) = record.external_job_handle.clone() else {
                continue;
            };
            report.examined += 1;
            let description = match service.describe_job(&handle).await {
                Ok(description) => description,
                Err(err) => {
                    report.service_errors += 1;
                    warn!(unit_id = %record.id, %handle, error = %err, "describe job failed");
                    continue;
                }
            };
            let event = StatusEvent::new(handle, description.status);
            match self
                .apply(&event, description.output_location_hint.as_deref(), Utc::now())
                .await
            {
                Ok(ReconcileOutcome::Applied { .. }) => report.applied += 1,
                Ok(ReconcileOutcome::Duplicate { .. }) => report.unchanged += 1,
                Ok(ReconcileOutcome::Stale { .. }) => report.stale += 1,
                Ok(ReconcileOutcome::Untracked) => {}
                Err(ReconcileError::Registry(err)) if err.is_driver() => {
                    return Err(ReconcileError::Registry(err));
                }
                Err(err) => {
                    report.record_errors += 1;
                    warn!(unit_id = %record.id, handle = %event.handle, error = %err, "applying polled status failed");
                }
            }
        }
        info!(
            examined = report.examined,
            applied = report.applied,
            stale = report.stale,
            service_errors = report.service_errors,
            record_errors = report.record_errors,
            "in-flight sync finished"
        );
        Ok(report)
    }
}

fn check_applicable(record: &WorkUnitRecord, event: &StatusEvent) -> Option<ReconcileOutcome> {
    let stale = || {
        warn!(
            unit_id = %record.id,
            handle = %event.handle,
            current = %record.status,
            incoming = %event.status,
            "ignoring stale status event"
        );
        Some(ReconcileOutcome::Stale {
            unit_id: record.id.clone(),
            current: record.status,
            incoming: event.status,
        })
    };

    if let (Some(stored), Some(incoming)) = (record.status_observed_at, event.observed_at) {
        if incoming < stored {
            return stale();
        }
    }
    if record.status == event.status {
        debug!(unit_id = %record.id, status = %event.status, "duplicate status event");
        return Some(ReconcileOutcome::Duplicate {
            unit_id: record.id.clone(),
        });
    }
    if !record.status.can_transition_to(event.status) {
        return stale();
    }
    None
}
