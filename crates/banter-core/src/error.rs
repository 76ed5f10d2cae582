//! Error taxonomy for the coordination engine.
//!
//! Every failure is caught at the component boundary and turned into an
//! error event delivered only to the requesting connection; it never crashes
//! the connection or leaks to other participants.

use thiserror::Error;

use crate::store::StoreError;

/// Engine errors.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Connection rejected before any registry entry exists.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// A message or room referenced by id does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Attempted access to a conversation the requester is not party to.
    #[error("Not a participant of this conversation")]
    ScopeViolation,

    /// A durable operation failed. Transient, eligible for client retry.
    #[error("Store failure: {0}")]
    Store(StoreError),

    /// Malformed request.
    #[error("Invalid request: {0}")]
    Validation(&'static str),
}

impl CoreError {
    /// Numeric error code carried on the wire.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            CoreError::Auth(_) => 4001,
            CoreError::ScopeViolation => 4003,
            CoreError::NotFound(_) => 4004,
            CoreError::Validation(_) => 4400,
            CoreError::Store(_) => 5000,
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::MessageNotFound(id) => CoreError::NotFound(format!("message {id}")),
            other => CoreError::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_maps_to_not_found() {
        let err: CoreError = StoreError::MessageNotFound(9).into();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert_eq!(err.code(), 4004);
    }

    #[test]
    fn test_store_failure_is_retryable_code() {
        let err: CoreError = StoreError::Unavailable("connection reset".into()).into();
        assert_eq!(err.code(), 5000);
    }
}
