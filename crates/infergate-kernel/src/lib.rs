//! Infergate kernel: the work-unit model shared by the batch scheduler and the dispatcher.
//!
//! The registry record ([WorkUnitRecord]) is the only cross-invocation state of the
//! batch side. Its [WorkUnitStatus] follows the external service's job lifecycle;
//! [RecordUpdate] is the partial, optionally conditional write applied to a record.

pub mod error;
pub mod identity;
pub mod record;
pub mod status;

pub use error::{RegistryError, ServiceError};
pub use identity::{JobHandle, UnitId};
pub use record::{RecordUpdate, WorkUnitRecord};
pub use status::{UnknownStatus, WorkUnitStatus};
