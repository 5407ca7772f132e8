//! Error types for the sync engine

use thiserror::Error;

/// Engine-level errors surfaced to callers.
///
/// Remote failures during background sync never reach the original caller of
/// a repository read or write; they are absorbed into record sync status and
/// retried by the orchestrator. Local storage failures are fatal to the
/// specific operation and propagate synchronously.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Local storage error: {0}")]
    LocalStorage(String),

    /// Expected operating mode, not a failure. Maps to the `Offline` state
    /// and is never counted against sync health.
    #[error("Network unavailable")]
    NetworkUnavailable,

    #[error("Remote store rejected the operation: {0}")]
    RemoteRejected(String),

    /// Malformed record timestamps (`updated_at` before `created_at`).
    /// Should not occur given the total ordering on `updated_at`.
    #[error("Conflict resolution error: {0}")]
    ConflictResolution(String),

    /// Aggregate result of a partially failed sync sweep. Records that
    /// synced before the failures stay synced; sync is not transactional
    /// across records.
    #[error("Sync incomplete: {failed} of {attempted} records failed")]
    SyncIncomplete { failed: usize, attempted: usize },

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The orchestrator was used after `stop()`.
    #[error("Sync orchestrator is stopped")]
    Stopped,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Remote store failures, classified at the adapter boundary.
#[derive(Error, Debug)]
pub enum RemoteError {
    /// Transport-level failure; treated as being offline.
    #[error("Remote store unreachable: {0}")]
    Unreachable(String),

    /// Backend validation/auth/server error; counted as a sync failure and
    /// drives backoff.
    #[error("Remote store rejected request: {0}")]
    Rejected(String),
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Unreachable(_) => SyncError::NetworkUnavailable,
            RemoteError::Rejected(msg) => SyncError::RemoteRejected(msg),
        }
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(err: sqlx::Error) -> Self {
        SyncError::LocalStorage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_classification_maps_into_sync_error() {
        let offline: SyncError = RemoteError::Unreachable("connect refused".into()).into();
        assert!(matches!(offline, SyncError::NetworkUnavailable));

        let rejected: SyncError = RemoteError::Rejected("422".into()).into();
        assert!(matches!(rejected, SyncError::RemoteRejected(_)));
    }

    #[test]
    fn sync_incomplete_summarizes_counts() {
        let err = SyncError::SyncIncomplete {
            failed: 2,
            attempted: 5,
        };
        assert_eq!(err.to_string(), "Sync incomplete: 2 of 5 records failed");
    }
}
