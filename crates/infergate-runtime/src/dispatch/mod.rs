//! On-demand dispatch: drives work units through the rate limiter to an [Invoker].
//!
//! Failures are isolated per unit: a denied permit, a service error or a crashed task
//! becomes a [DispatchOutcome::Failure] for that unit and never affects its siblings.
//! Results come back in completion order, not input order.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info, warn};

use infergate_kernel::{ServiceError, UnitId};

use crate::limiter::{RateLimitError, RateLimiter};
use crate::service::{Invoker, WorkUnit};

pub mod chunked;
pub mod fan_out;

pub use chunked::ChunkedDispatcher;
pub use fan_out::FanOutDispatcher;

/// Limiter key used when the caller does not name one.
pub const DEFAULT_CALLER_KEY: &str = "default";

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum FailureReason {
    #[error("rate limit exceeded (next slot in {wait:?})")]
    RateExceeded { wait: Duration },
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error("invocation task aborted: {0}")]
    TaskAborted(String),
}

#[derive(Clone, Debug, PartialEq)]
pub enum DispatchOutcome {
    Success(Value),
    Failure(FailureReason),
}

#[derive(Clone, Debug, PartialEq)]
pub struct DispatchResult {
    pub unit_id: UnitId,
    pub outcome: DispatchOutcome,
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, DispatchOutcome::Success(_))
    }
}

/// Every unit's result plus run statistics.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DispatchReport {
    pub results: Vec<DispatchResult>,
    pub elapsed: Duration,
}

impl DispatchReport {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.results.len() - self.succeeded()
    }

    /// Completed units per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.results.len() as f64 / secs
        } else {
            0.0
        }
    }
}

/// Rejected input. Per-unit failures are never reported this way.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("work unit id appears more than once: {0}")]
    DuplicateUnit(UnitId),
    #[error("work unit with empty id")]
    EmptyUnitId,
}

#[async_trait]
pub trait Dispatch: Send + Sync {
    /// Returns once every unit has reached an outcome. Empty input yields an empty report.
    async fn dispatch(&self, units: Vec<WorkUnit>) -> Result<DispatchReport, DispatchError>;
}

pub(crate) fn validate_units(units: &[WorkUnit]) -> Result<(), DispatchError> {
    let mut seen = HashSet::with_capacity(units.len());
    for unit in units {
        if unit.id.is_empty() {
            return Err(DispatchError::EmptyUnitId);
        }
        if !seen.insert(unit.id.as_str()) {
            return Err(DispatchError::DuplicateUnit(unit.id.clone()));
        }
    }
    Ok(())
}

/// Acquire a permit, then invoke. Never fails; the outcome carries the error.
pub(crate) async fn run_unit<I: Invoker + ?Sized>(
    limiter: &RateLimiter,
    key: &str,
    invoker: &I,
    unit: WorkUnit,
) -> DispatchResult {
    let outcome = match limiter.try_acquire(key).await {
        Err(RateLimitError::RateExceeded { wait, .. }) => {
            DispatchOutcome::Failure(FailureReason::RateExceeded { wait })
        }
        Ok(_) => match invoker.invoke(&unit).await {
            Ok(payload) => DispatchOutcome::Success(payload),
            Err(err) => {
                debug!(unit_id = %unit.id, error = %err, "invocation failed");
                DispatchOutcome::Failure(FailureReason::Service(err))
            }
        },
    };
    DispatchResult {
        unit_id: unit.id,
        outcome,
    }
}

pub(crate) fn log_summary(strategy: &str, report: &DispatchReport) {
    let failed = report.failed();
    if failed > 0 {
        warn!(
            strategy,
            total = report.results.len(),
            succeeded = report.succeeded(),
            failed,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "dispatch finished with failures"
        );
    } else {
        info!(
            strategy,
            total = report.results.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "dispatch finished"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};

    use infergate_kernel::ServiceError;

    use crate::service::{Invoker, WorkUnit};

    /// Echoes the unit id. Ids containing `bad` fail, `panic` panics.
    #[derive(Default)]
    pub(crate) struct EchoInvoker {
        pub(crate) latency: Duration,
        pub(crate) in_flight: AtomicUsize,
        pub(crate) max_in_flight: AtomicUsize,
    }

    impl EchoInvoker {
        pub(crate) fn with_latency(latency: Duration) -> Arc<Self> {
            Arc::new(Self {
                latency,
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl Invoker for EchoInvoker {
        async fn invoke(&self, unit: &WorkUnit) -> Result<Value, ServiceError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if unit.id.contains("panic") {
                panic!("invoker crashed on {}", unit.id);
            }
            if unit.id.contains("bad") {
                return Err(ServiceError::Permanent(format!("rejected {}", unit.id)));
            }
            Ok(json!({ "echo": unit.id }))
        }
    }

    pub(crate) fn units(ids: &[&str]) -> Vec<WorkUnit> {
        ids.iter()
            .map(|id| WorkUnit::new(*id, json!({ "inputText": id })))
            .collect()
    }

    pub(crate) fn numbered(count: usize) -> Vec<WorkUnit> {
        (0..count)
            .map(|i| WorkUnit::new(format!("unit-{i}"), json!({ "inputText": i })))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::units;
    use super::*;

    #[test]
    fn validate_rejects_duplicates_and_empty_ids() {
        assert_eq!(
            validate_units(&units(&["a", "b", "a"])),
            Err(DispatchError::DuplicateUnit("a".into()))
        );
        assert_eq!(
            validate_units(&units(&["a", ""])),
            Err(DispatchError::EmptyUnitId)
        );
        assert!(validate_units(&[]).is_ok());
    }

    #[test]
    fn report_counts_and_throughput() {
        let report = DispatchReport {
            results: vec![
                DispatchResult {
                    unit_id: "a".into(),
                    outcome: DispatchOutcome::Success(Value::Null),
                },
                DispatchResult {
                    unit_id: "b".into(),
                    outcome: DispatchOutcome::Failure(FailureReason::TaskAborted("x".into())),
                },
            ],
            elapsed: Duration::from_secs(4),
        };
        assert_eq!(report.succeeded(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.throughput(), 0.5);
        assert_eq!(DispatchReport::default().throughput(), 0.0);
    }
}
