//! Bounded dispatch: the input is cut into chunks, each driven through a fixed number of
//! concurrent worker slots before the next chunk starts.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::time::Instant;
use tracing::debug;

use crate::limiter::RateLimiter;
use crate::service::{Invoker, WorkUnit};

use super::{
    log_summary, run_unit, validate_units, Dispatch, DispatchError, DispatchOutcome,
    DispatchReport, DispatchResult, FailureReason, DEFAULT_CALLER_KEY,
};

pub struct ChunkedDispatcher<I: ?Sized> {
    invoker: Arc<I>,
    limiter: RateLimiter,
    key: String,
    chunk_size: usize,
    workers: usize,
}

impl<I: Invoker + ?Sized + 'static> ChunkedDispatcher<I> {
    /// `chunk_size` and `workers` are clamped to at least one.
    pub fn new(invoker: Arc<I>, limiter: RateLimiter, chunk_size: usize, workers: usize) -> Self {
        Self {
            invoker,
            limiter,
            key: DEFAULT_CALLER_KEY.to_string(),
            chunk_size: chunk_size.max(1),
            workers: workers.max(1),
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    async fn run_chunk(&self, chunk: Vec<WorkUnit>) -> Vec<DispatchResult> {
        stream::iter(chunk)
            .map(|unit| {
                let unit_id = unit.id.clone();
                let invoker = Arc::clone(&self.invoker);
                let limiter = self.limiter.clone();
                let key = self.key.clone();
                let task = tokio::spawn(async move {
                    run_unit(&limiter, &key, invoker.as_ref(), unit).await
                });
                async move {
                    task.await.unwrap_or_else(|err| DispatchResult {
                        unit_id,
                        outcome: DispatchOutcome::Failure(FailureReason::TaskAborted(
                            err.to_string(),
                        )),
                    })
                }
            })
            .buffer_unordered(self.workers)
            .collect()
            .await
    }
}

#[async_trait]
impl<I: Invoker + ?Sized + 'static> Dispatch for ChunkedDispatcher<I> {
    async fn dispatch(&self, units: Vec<WorkUnit>) -> Result<DispatchReport, DispatchError> {
        validate_units(&units)?;
        let started = Instant::now();
        let total = units.len();

        let mut results = Vec::with_capacity(total);
        let mut remaining = units.into_iter().peekable();
        let mut chunk_index = 0;
        while remaining.peek().is_some() {
            let chunk: Vec<WorkUnit> = remaining.by_ref().take(self.chunk_size).collect();
            debug!(chunk_index, size = chunk.len(), total, "dispatching chunk");
            results.extend(self.run_chunk(chunk).await);
            chunk_index += 1;
        }

        let report = DispatchReport {
            results,
            elapsed: started.elapsed(),
        };
        log_summary("chunked", &report);
        Ok(report)
    }
}
