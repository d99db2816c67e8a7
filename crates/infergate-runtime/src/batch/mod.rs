//! Batch side: admission-controlled submission and status reconciliation.

pub mod controller;
pub mod events;
pub mod reconciler;
pub mod schedule;

pub use controller::{AdmissionConfig, AdmissionController, ControllerError, TickReport};
pub use events::{EventParseError, StatusEvent};
pub use reconciler::{
    output_location_for, ReconcileError, ReconcileOutcome, StatusReconciler, SyncReport,
};
pub use schedule::{run_schedule, ScheduleSummary};
