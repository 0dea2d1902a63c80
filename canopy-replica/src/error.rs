//! Errors surfaced by the replication driver and its facade.

use std::time::Duration;

use canopy_core::PathError;
use thiserror::Error;

use crate::store::{ResumeMarker, StoreError};
use crate::surgeon::SurgeonError;

/// Errors returned to callers of a replicating driver.
///
/// Failures inside the change-feed loop never surface here; they trigger
/// recovery and are only logged.
#[derive(Debug, Clone, Error)]
pub enum DriverError {
    #[error("not connected to the store")]
    Disconnected,
    #[error("reconnection failed: {0}")]
    Reconnection(String),
    #[error("timed out after {timeout:?} waiting for revision {revision}")]
    FlushTimeout { revision: u64, timeout: Duration },
    #[error("store has no root document")]
    UninitializedStore,
    #[error("unrecognized storage format {0:?}")]
    UnrecognizedFormat(String),
    #[error("malformed fragment: {0}")]
    MalformedFragment(#[from] SurgeonError),
    #[error("malformed document {id}: {reason}")]
    MalformedDocument { id: String, reason: String },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("change feed could not be initialized: {0}")]
    ReceiverInitialization(String),
    #[error("the root node cannot be deleted")]
    RootDeletion,
    #[error("collection layout changed at {0}")]
    LayoutChanged(ResumeMarker),
    #[error("downstream driver failed: {0}")]
    Downstream(String),
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error("driver is closed")]
    Closed,
    #[error("store commit did not complete: {0}")]
    CommitAbandoned(String),
}

impl DriverError {
    pub(crate) fn malformed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        DriverError::MalformedDocument {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn downstream(err: impl std::error::Error) -> Self {
        DriverError::Downstream(err.to_string())
    }

    /// Whether the error means the store could not be reached at all.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DriverError::Disconnected
                | DriverError::Store(StoreError::Unavailable(_))
                | DriverError::Store(StoreError::Closed)
                | DriverError::ReceiverInitialization(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = DriverError::FlushTimeout {
            revision: 100,
            timeout: Duration::from_millis(200),
        };
        assert!(err.to_string().contains("revision 100"));

        let err: DriverError = SurgeonError::DuplicateRoot.into();
        assert!(err.to_string().starts_with("malformed fragment"));
    }

    #[test]
    fn test_connectivity() {
        assert!(DriverError::Disconnected.is_connectivity());
        assert!(DriverError::Store(StoreError::Unavailable("down".into())).is_connectivity());
        assert!(!DriverError::UninitializedStore.is_connectivity());
    }
}
