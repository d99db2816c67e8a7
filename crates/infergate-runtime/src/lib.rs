//! Infergate runtime: admission-controlled batch inference and rate-limited on-demand
//! dispatch against an external, capacity-constrained inference service.
//!
//! - [registry]: durable work-unit records (in-memory, SQLite, Postgres).
//! - [batch]: the admission controller, status reconciler and tick schedule.
//! - [limiter] and [dispatch]: the on-demand path.
//! - [service]: contracts for the external service; [bedrock] implements them
//!   (feature `bedrock`).
//!
//! Components are constructed explicitly and passed in; nothing here is process-global.
//! Submission and notification retries come from re-invocation (the next tick, the next
//! delivery), never from an in-process retry loop.

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod batch;
#[cfg(feature = "bedrock")]
pub mod bedrock;
pub mod config;
pub mod dispatch;
pub mod limiter;
pub mod registry;
pub mod service;

pub use infergate_kernel as kernel;

pub use batch::{
    run_schedule, AdmissionConfig, AdmissionController, ReconcileOutcome, StatusEvent,
    StatusReconciler, TickReport,
};
pub use config::{ConfigError, InfergateConfig};
pub use dispatch::{
    ChunkedDispatcher, Dispatch, DispatchError, DispatchOutcome, DispatchReport, DispatchResult,
    FailureReason, FanOutDispatcher,
};
pub use limiter::{BucketScope, RateLimitConfig, RateLimitError, RateLimiter};
pub use registry::{InMemoryRegistry, Registry};
pub use service::{BatchJobService, Invoker, JobDescription, JobSubmission, WorkUnit};
