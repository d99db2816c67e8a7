//! Error taxonomy shared by registry backends and external-service clients.

/// Registry-level error type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No record matches the given id or handle.
    #[error("record not found: {0}")]
    RecordNotFound(String),
    #[error("record already exists: {0}")]
    DuplicateId(String),
    /// The external job handle is already owned by another record.
    #[error("external job handle already assigned: {0}")]
    DuplicateHandle(String),
    /// The write would break a record invariant (e.g. an output location on a failed job).
    #[error("invalid record: {0}")]
    InvalidRecord(String),
    /// Storage driver failure (connection, query, lock poisoning, decoding).
    #[error("Registry driver error: {0}")]
    Driver(String),
}

impl RegistryError {
    /// Whether the failure concerns the store as a whole rather than one record.
    pub fn is_driver(&self) -> bool {
        matches!(self, RegistryError::Driver(_))
    }
}

/// Error surfaced by the external inference service.
///
/// Callers never retry in-process: a transient failure simply leaves state unchanged
/// until the next scheduled invocation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ServiceError {
    /// Timeouts, throttling, temporary unavailability.
    #[error("transient service error: {0}")]
    Transient(String),
    /// Rejected requests (malformed input, missing permissions, unknown job).
    #[error("service error: {0}")]
    Permanent(String),
}

impl ServiceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ServiceError::Transient(_))
    }
}
