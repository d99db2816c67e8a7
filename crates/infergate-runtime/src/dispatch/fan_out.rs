//! One task per unit; concurrency is bounded only by the limiter's timing.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;

use crate::limiter::RateLimiter;
use crate::service::{Invoker, WorkUnit};

use super::{
    log_summary, run_unit, validate_units, Dispatch, DispatchError, DispatchOutcome,
    DispatchReport, DispatchResult, FailureReason, DEFAULT_CALLER_KEY,
};

pub struct FanOutDispatcher<I: ?Sized> {
    invoker: Arc<I>,
    limiter: RateLimiter,
    key: String,
}

impl<I: Invoker + ?Sized + 'static> FanOutDispatcher<I> {
    pub fn new(invoker: Arc<I>, limiter: RateLimiter) -> Self {
        Self {
            invoker,
            limiter,
            key: DEFAULT_CALLER_KEY.to_string(),
        }
    }

    /// Limiter key for this dispatcher's acquisitions (relevant with per-key buckets).
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

#[async_trait]
impl<I: Invoker + ?Sized + 'static> Dispatch for FanOutDispatcher<I> {
    async fn dispatch(&self, units: Vec<WorkUnit>) -> Result<DispatchReport, DispatchError> {
        validate_units(&units)?;
        let started = Instant::now();

        let mut ids = Vec::with_capacity(units.len());
        let mut tasks = Vec::with_capacity(units.len());
        for unit in units {
            ids.push(unit.id.clone());
            let invoker = Arc::clone(&self.invoker);
            let limiter = self.limiter.clone();
            let key = self.key.clone();
            tasks.push(tokio::spawn(async move {
                run_unit(&limiter, &key, invoker.as_ref(), unit).await
            }));
        }

        let results = join_all(tasks)
            .await
            .into_iter()
            .zip(ids)
            .map(|(joined, unit_id)| {
                joined.unwrap_or_else(|err| DispatchResult {
                    unit_id,
                    outcome: DispatchOutcome::Failure(FailureReason::TaskAborted(err.to_string())),
                })
            })
            .collect();

        let report = DispatchReport {
            results,
            elapsed: started.elapsed(),
        };
        log_summary("fan-out", &report);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::dispatch::testing::{numbered, units, EchoInvoker};
    use crate::limiter::RateLimitConfig;

    fn limiter(rate: u32, period_secs: u64, max_delay_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::new(
            rate,
            Duration::from_secs(period_secs),
            Duration::from_secs(max_delay_secs),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_yields_empty_report() {
        let dispatcher = FanOutDispatcher::new(EchoInvoker::with_latency(Duration::ZERO), limiter(10, 60, 0));
        let report = dispatcher.dispatch(Vec::new()).await.unwrap();
        assert!(report.results.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn every_unit_gets_exactly_one_result() {
        let dispatcher = FanOutDispatcher::new(
            EchoInvoker::with_latency(Duration::from_millis(5)),
            limiter(1000, 60, 0),
        );
        let report = dispatcher
            .dispatch(units(&["a", "bad-1", "c", "panic-1", "e"]))
            .await
            .unwrap();

        assert_eq!(report.results.len(), 5);
        let ids: HashSet<_> = report.results.iter().map(|r| r.unit_id.as_str()).collect();
        assert_eq!(ids, HashSet::from(["a", "bad-1", "c", "panic-1", "e"]));
        assert_eq!(report.succeeded(), 3);

        for result in &report.results {
            match result.unit_id.as_str() {
                "bad-1" => assert!(matches!(
                    result.outcome,
                    DispatchOutcome::Failure(FailureReason::Service(_))
                )),
                "panic-1" => assert!(matches!(
                    result.outcome,
                    DispatchOutcome::Failure(FailureReason::TaskAborted(_))
                )),
                id => assert_eq!(
                    result.outcome,
                    DispatchOutcome::Success(serde_json::json!({ "echo": id }))
                ),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hundred_units_against_fifty_per_minute_without_delay() {
        let dispatcher = FanOutDispatcher::new(
            EchoInvoker::with_latency(Duration::ZERO),
            limiter(50, 60, 0),
        );
        let report = dispatcher.dispatch(numbered(100)).await.unwrap();

        assert_eq!(report.results.len(), 100);
        assert_eq!(report.succeeded(), 50);
        assert!(report.results.iter().filter(|r| !r.is_success()).all(|r| matches!(
            r.outcome,
            DispatchOutcome::Failure(FailureReason::RateExceeded { .. })
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_units_finish_once_their_slot_arrives() {
        let dispatcher = FanOutDispatcher::new(
            EchoInvoker::with_latency(Duration::ZERO),
            limiter(2, 10, 60),
        );
        let report = dispatcher.dispatch(numbered(6)).await.unwrap();
        assert_eq!(report.succeeded(), 6);
        // Slots at 0, 0, 10, 10, 20, 20.
        assert_eq!(report.elapsed, Duration::from_secs(20));
    }

    #[tokio::test]
    async fn malformed_input_is_rejected_before_any_call() {
        let invoker = EchoInvoker::with_latency(Duration::ZERO);
        let dispatcher = FanOutDispatcher::new(Arc::clone(&invoker), limiter(10, 60, 0));
        let err = dispatcher.dispatch(units(&["a", "a"])).await.unwrap_err();
        assert_eq!(err, DispatchError::DuplicateUnit("a".into()));
        assert_eq!(
            invoker
                .max_in_flight
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }
}
