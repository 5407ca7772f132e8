//! Offline-first synchronization engine for CareLog
//!
//! Provides:
//! - Local SQLite store as the source of truth for reads and writes
//! - Remote store adapter with transport/rejection error classification
//! - Record repositories with last-write-wins conflict resolution
//! - Connectivity monitoring with debounced stability checks
//! - A sync orchestrator with backoff retries, rate limiting, and health
//!   metrics
//!
//! Every user-facing operation works against the local store first; the
//! remote is reconciled opportunistically whenever connectivity allows.

pub mod connectivity;
pub mod error;
pub mod local_store;
pub mod model;
pub mod orchestrator;
pub mod remote_store;
pub mod repository;

pub use connectivity::{ChannelConnectivityMonitor, ConnectivityMonitor, DEFAULT_STABLE_WINDOW};
pub use error::{RemoteError, SyncError, SyncResult};
pub use local_store::{LocalStore, LocalStoreConfig, SqliteLocalStore};
pub use model::{
    DailyLogEntry, FlowIntensity, OwnerId, RecordId, RecordPayload, SyncStatus, SyncableRecord,
    UnitSystem, UserPreferences,
};
pub use orchestrator::{
    OrchestratorConfig, SyncMetrics, SyncOrchestrator, SyncState, SyncStatusSnapshot,
};
pub use remote_store::{HttpRemoteStore, MemoryRemoteStore, RemoteStore, RemoteStoreConfig};
pub use repository::{
    resolve_conflict, ConflictWinner, RecordRepository, SyncOutcome, SyncParticipant,
};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    // End-to-end wiring: save offline, come online, orchestrator reconciles.
    #[tokio::test]
    async fn engine_reconciles_offline_edits_when_connectivity_returns() {
        let local = SqliteLocalStore::open_in_memory().await.unwrap();
        let remote = Arc::new(MemoryRemoteStore::<UserPreferences>::new());
        let monitor = Arc::new(ChannelConnectivityMonitor::with_stable_window(
            false,
            Duration::from_millis(10),
        ));
        let repo = Arc::new(RecordRepository::new(
            local,
            Arc::clone(&remote),
            Arc::clone(&monitor) as Arc<dyn ConnectivityMonitor>,
        ));
        let owner = OwnerId::new("user-1");

        let record = SyncableRecord::new(
            owner.clone(),
            UserPreferences::record_id(&owner),
            UserPreferences::manual(UnitSystem::Metric),
        );
        repo.save_record(record).await.unwrap();
        assert_eq!(remote.document_count().await, 0);

        let orchestrator = SyncOrchestrator::new(
            owner.clone(),
            Arc::clone(&monitor) as Arc<dyn ConnectivityMonitor>,
            vec![Arc::clone(&repo) as Arc<dyn SyncParticipant>],
            OrchestratorConfig::default(),
        );

        monitor.set_connected(true);
        orchestrator.trigger_sync(true).await.unwrap();

        assert_eq!(remote.document_count().await, 1);
        let record = repo
            .get_record(&owner, &UserPreferences::record_id(&owner))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sync_status, SyncStatus::Synced);
        assert_eq!(orchestrator.status().state, SyncState::Synced);
    }
}
