//! Fixed-interval driver for admission ticks.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::registry::Registry;
use crate::service::BatchJobService;

use super::controller::AdmissionController;

/// Totals over the lifetime of one [run_schedule] call.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub ticks: usize,
    pub failed_ticks: usize,
    pub started: usize,
}

/// Run `tick()` every `interval` until `shutdown` resolves. The first tick fires
/// immediately.
///
/// A failed tick is logged and left for the next one; there is no other retry. A tick
/// that overruns the interval delays the next one instead of bunching ticks up.
pub async fn run_schedule<R, S, F>(
    controller: &AdmissionController<R, S>,
    interval: Duration,
    shutdown: F,
) -> ScheduleSummary
where
    R: Registry,
    S: BatchJobService,
    F: Future<Output = ()>,
{
    info!(interval_secs = interval.as_secs(), "admission schedule starting");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    let mut summary = ScheduleSummary::default();
    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!(ticks = summary.ticks, started = summary.started, "admission schedule stopping");
                break;
            }

            _ = ticker.tick() => {
                summary.ticks += 1;
                match controller.tick().await {
                    Ok(report) => summary.started += report.started,
                    Err(err) => {
                        summary.failed_ticks += 1;
                        error!(error = %err, "admission tick failed; retrying on next tick");
                    }
                }
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use chrono::Utc;

    use infergate_kernel::{JobHandle, ServiceError, WorkUnitRecord};

    use super::*;
    use crate::batch::controller::AdmissionConfig;
    use crate::registry::InMemoryRegistry;
    use crate::service::{JobDescription, JobSubmission};

    #[derive(Clone, Default)]
    struct CountingService {
        counts: Arc<Mutex<usize>>,
        fail_counts: bool,
    }

    #[async_trait]
    impl BatchJobService for CountingService {
        async fn count_active_jobs(&self, _name_filter: &str) -> Result<usize, ServiceError> {
            *self.counts.lock().unwrap() += 1;
            if self.fail_counts {
                return Err(ServiceError::Transient("unavailable".into()));
            }
            Ok(0)
        }

        async fn submit_job(&self, submission: &JobSubmission) -> Result<JobHandle, ServiceError> {
            Ok(format!("arn:job/{}", submission.name))
        }

        async fn describe_job(&self, _handle: &str) -> Result<JobDescription, ServiceError> {
            Err(ServiceError::Permanent("not used".into()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_on_interval_until_shutdown() {
        let registry = InMemoryRegistry::new();
        registry
            .insert(WorkUnitRecord::pending("u-1", "s3://in/1", Utc::now()))
            .await
            .unwrap();
        let service = CountingService::default();
        let controller =
            AdmissionController::new(registry, service.clone(), AdmissionConfig::default());

        let summary = run_schedule(
            &controller,
            Duration::from_secs(60),
            tokio::time::sleep(Duration::from_secs(150)),
        )
        .await;

        // Ticks at 0s, 60s and 120s.
        assert_eq!(summary.ticks, 3);
        assert_eq!(summary.started, 1);
        assert_eq!(*service.counts.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_ticks_do_not_stop_the_loop() {
        let service = CountingService {
            fail_counts: true,
            ..CountingService::default()
        };
        let controller =
            AdmissionController::new(InMemoryRegistry::new(), service, AdmissionConfig::default());

        let summary = run_schedule(
            &controller,
            Duration::from_secs(10),
            tokio::time::sleep(Duration::from_secs(35)),
        )
        .await;
        assert_eq!(summary.ticks, 4);
        assert_eq!(summary.failed_ticks, 4);
    }
}
