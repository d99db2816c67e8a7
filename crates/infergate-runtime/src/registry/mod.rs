//! Registry: durable store of work-unit records.
//!
//! Backends: [InMemoryRegistry] (always available), [SqliteRegistry] (feature
//! `sqlite-persistence`) and [PostgresRegistry] (feature `registry-postgres`).

#[cfg(any(feature = "sqlite-persistence", feature = "registry-postgres"))]
use chrono::{DateTime, TimeZone, Utc};
#[cfg(any(feature = "sqlite-persistence", feature = "registry-postgres"))]
use infergate_kernel::RegistryError;

pub mod memory;
pub mod repository;
#[cfg(feature = "sqlite-persistence")]
pub mod sqlite_registry;
#[cfg(feature = "registry-postgres")]
pub mod postgres_registry;

pub use memory::InMemoryRegistry;
pub use repository::Registry;
#[cfg(feature = "sqlite-persistence")]
pub use sqlite_registry::SqliteRegistry;
#[cfg(feature = "registry-postgres")]
pub use postgres_registry::PostgresRegistry;

#[cfg(any(feature = "sqlite-persistence", feature = "registry-postgres"))]
pub(crate) fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[cfg(any(feature = "sqlite-persistence", feature = "registry-postgres"))]
pub(crate) fn ms_to_dt(ms: i64) -> Result<DateTime<Utc>, RegistryError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| RegistryError::Driver(format!("timestamp out of range: {ms} ms")))
}
