//! Record repository: local-first reads, local-immediate writes, batch sync
//!
//! One repository owns the read/write/sync semantics of a single record
//! family. Reads consult the local cache first and fall back to (and cache)
//! the remote copy when reachable; writes land locally before the call
//! returns and are pushed remotely on a best-effort basis. Conflicts are
//! resolved last-write-wins on `updated_at`.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::connectivity::ConnectivityMonitor;
use crate::error::{RemoteError, SyncError, SyncResult};
use crate::local_store::LocalStore;
use crate::model::{
    OwnerId, RecordId, RecordPayload, SyncStatus, SyncableRecord, UnitSystem, UserPreferences,
};
use crate::remote_store::RemoteStore;

/// Outcome summary of one batch sync sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOutcome {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
}

/// Winner of last-write-wins resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictWinner {
    Local,
    Remote,
}

/// Last-write-wins with a deterministic tie-break.
///
/// Remote wins only a strictly greater `updated_at`; equal timestamps favor
/// the device performing the read, avoiding overwrite churn. This is a
/// documented simplification, not a causal-correctness guarantee.
pub fn resolve_conflict<P: RecordPayload>(
    local: &SyncableRecord<P>,
    remote: &SyncableRecord<P>,
) -> SyncResult<ConflictWinner> {
    local.validate_ordering()?;
    remote.validate_ordering()?;

    if remote.updated_at > local.updated_at {
        Ok(ConflictWinner::Remote)
    } else {
        Ok(ConflictWinner::Local)
    }
}

/// A record family the orchestrator can drive through batch sync.
#[async_trait]
pub trait SyncParticipant: Send + Sync {
    /// Family name for logs and status reporting.
    fn name(&self) -> &'static str;

    /// Push every non-synced record of the owner. Partial progress is kept;
    /// see [`RecordRepository::sync_pending`].
    async fn sync_pending(&self, owner: &OwnerId) -> SyncResult<SyncOutcome>;
}

/// Repository for one record family.
pub struct RecordRepository<P, L, R> {
    local: L,
    remote: R,
    connectivity: Arc<dyn ConnectivityMonitor>,
    // Per-record critical sections: two flows must never both read a
    // record's status and race each other's push/mark transitions.
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
    _payload: PhantomData<fn() -> P>,
}

impl<P, L, R> RecordRepository<P, L, R>
where
    P: RecordPayload,
    L: LocalStore<P>,
    R: RemoteStore<P>,
{
    pub fn new(local: L, remote: R, connectivity: Arc<dyn ConnectivityMonitor>) -> Self {
        Self {
            local,
            remote,
            connectivity,
            locks: Mutex::new(HashMap::new()),
            _payload: PhantomData,
        }
    }

    async fn record_lock(&self, owner: &OwnerId, id: &RecordId) -> OwnedMutexGuard<()> {
        let key = (owner.as_str().to_string(), id.as_str().to_string());
        let cell = {
            let mut locks = self.locks.lock().await;
            // Entries nobody holds anymore are stale; drop them so the table
            // does not keep one mutex per record ever touched.
            locks.retain(|_, cell| Arc::strong_count(cell) > 1);
            Arc::clone(locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        cell.lock_owned().await
    }

    /// Read a record local-first.
    ///
    /// When the remote is reachable the cached copy is reconciled against
    /// the remote copy: a winning remote record is written through locally
    /// and marked `Synced`. Remote failures degrade to the local answer and
    /// never surface to the caller.
    pub async fn get_record(
        &self,
        owner: &OwnerId,
        id: &RecordId,
    ) -> SyncResult<Option<SyncableRecord<P>>> {
        let _guard = self.record_lock(owner, id).await;

        let local = self.local.get(owner, id).await?;

        if !self.connectivity.is_connected() {
            return Ok(local);
        }

        let remote = match self.remote.get(owner, id).await {
            Ok(remote) => remote,
            Err(err) => {
                tracing::debug!(
                    kind = P::KIND,
                    owner_id = %owner,
                    record_id = %id,
                    error = %err,
                    "remote read unavailable, serving local copy"
                );
                return Ok(local);
            }
        };

        match (local, remote) {
            // Remote may not have seen the record yet, or it was deleted
            // remotely; the two are indistinguishable here and local is
            // trusted (known limitation, no tombstones).
            (local, None) => Ok(local),
            (None, Some(remote)) => {
                self.local.put(&remote).await?;
                Ok(Some(remote))
            }
            (Some(local), Some(remote)) => match resolve_conflict(&local, &remote)? {
                ConflictWinner::Remote => {
                    tracing::debug!(
                        kind = P::KIND,
                        owner_id = %owner,
                        record_id = %id,
                        "remote copy supersedes local cache"
                    );
                    self.local.put(&remote).await?;
                    Ok(Some(remote))
                }
                // A winning local record keeps its status: pending changes
                // still have to be pushed.
                ConflictWinner::Local => Ok(Some(local)),
            },
        }
    }

    /// Save a record: stamp `updated_at`, persist locally as `Pending`
    /// before returning, then attempt a bounded best-effort remote push.
    ///
    /// Push failures are absorbed; the orchestrator retries later. Only
    /// local storage failures propagate.
    pub async fn save_record(
        &self,
        record: SyncableRecord<P>,
    ) -> SyncResult<SyncableRecord<P>> {
        let guard = self.record_lock(&record.owner_id, &record.id).await;
        self.save_locked(record, guard).await
    }

    // Takes the record's lock from the caller so check-then-write flows stay
    // one critical section.
    async fn save_locked(
        &self,
        mut record: SyncableRecord<P>,
        _guard: OwnedMutexGuard<()>,
    ) -> SyncResult<SyncableRecord<P>> {
        record.touch();
        self.local.put(&record).await?;

        if self.connectivity.has_stable_connection().await {
            match self.remote.put(&record).await {
                Ok(()) => {
                    self.local.mark_synced(&record.owner_id, &record.id).await?;
                    record.sync_status = SyncStatus::Synced;
                }
                Err(err) => {
                    tracing::debug!(
                        kind = P::KIND,
                        owner_id = %record.owner_id,
                        record_id = %record.id,
                        error = %err,
                        "immediate push failed, record stays pending"
                    );
                }
            }
        }

        Ok(record)
    }

    /// Push every non-`Synced` record of the owner.
    ///
    /// Per-record results: success marks the record `Synced`; a rejection
    /// increments its retry count and marks it `Failed` (still eligible for
    /// the next sweep). A transport-level failure aborts the sweep with
    /// [`SyncError::NetworkUnavailable`] without penalizing records —
    /// being offline is not a per-record failure. Already-synced records
    /// are never rolled back; sync is not transactional across records.
    pub async fn sync_pending(&self, owner: &OwnerId) -> SyncResult<SyncOutcome> {
        let pending = self.local.list_pending(owner).await?;
        let mut outcome = SyncOutcome {
            attempted: pending.len(),
            ..SyncOutcome::default()
        };

        for stale in pending {
            let _guard = self.record_lock(owner, &stale.id).await;

            // Re-read under the lock: a concurrent save may have produced a
            // newer version since the pending list was taken.
            let Some(record) = self.local.get(owner, &stale.id).await? else {
                outcome.attempted -= 1;
                continue;
            };
            if record.sync_status == SyncStatus::Synced {
                outcome.attempted -= 1;
                continue;
            }

            match self.remote.put(&record).await {
                Ok(()) => {
                    self.local.mark_synced(owner, &record.id).await?;
                    outcome.synced += 1;
                }
                Err(RemoteError::Unreachable(reason)) => {
                    tracing::debug!(
                        kind = P::KIND,
                        owner_id = %owner,
                        reason,
                        "remote unreachable, aborting sweep"
                    );
                    return Err(SyncError::NetworkUnavailable);
                }
                Err(RemoteError::Rejected(reason)) => {
                    self.local.increment_retry(owner, &record.id).await?;
                    self.local.mark_failed(owner, &record.id).await?;
                    outcome.failed += 1;
                    tracing::warn!(
                        kind = P::KIND,
                        owner_id = %owner,
                        record_id = %record.id,
                        retry_count = record.sync_retry_count + 1,
                        reason,
                        "record sync rejected"
                    );
                }
            }
        }

        if outcome.failed > 0 {
            return Err(SyncError::SyncIncomplete {
                failed: outcome.failed,
                attempted: outcome.attempted,
            });
        }
        Ok(outcome)
    }

    /// Delete the owner's local records and, when connected, the remote
    /// copies. Offline, only the local clear happens and the remote copy is
    /// orphaned until a future explicit clear.
    pub async fn clear(&self, owner: &OwnerId) -> SyncResult<()> {
        self.local.clear(owner).await?;

        if self.connectivity.is_connected() {
            if let Err(err) = self.remote.delete(owner).await {
                tracing::warn!(
                    kind = P::KIND,
                    owner_id = %owner,
                    error = %err,
                    "remote clear failed, remote copy orphaned"
                );
            }
        } else {
            tracing::info!(
                kind = P::KIND,
                owner_id = %owner,
                "cleared locally while offline, remote copy orphaned"
            );
        }

        Ok(())
    }
}

impl<L, R> RecordRepository<UserPreferences, L, R>
where
    L: LocalStore<UserPreferences>,
    R: RemoteStore<UserPreferences>,
{
    /// Apply a locale-derived default unit system.
    ///
    /// A no-op once the user has explicitly set preferences: automatic
    /// re-derivation must never overwrite a manual choice.
    pub async fn apply_derived_default(
        &self,
        owner: &OwnerId,
        unit_system: UnitSystem,
    ) -> SyncResult<SyncableRecord<UserPreferences>> {
        let id = UserPreferences::record_id(owner);

        // The manual-choice check and the dependent write share one lock
        // acquisition: a manual save landing in between must not be
        // overwritten by the derived default.
        let guard = self.record_lock(owner, &id).await;

        let existing = self.local.get(owner, &id).await?;
        if let Some(existing) = existing {
            if existing.payload.is_manually_set {
                return Ok(existing);
            }
            let mut updated = existing;
            updated.payload = UserPreferences::derived(unit_system);
            return self.save_locked(updated, guard).await;
        }

        self.save_locked(
            SyncableRecord::new(owner.clone(), id, UserPreferences::derived(unit_system)),
            guard,
        )
        .await
    }
}

#[async_trait]
impl<P, L, R> SyncParticipant for RecordRepository<P, L, R>
where
    P: RecordPayload,
    L: LocalStore<P>,
    R: RemoteStore<P>,
{
    fn name(&self) -> &'static str {
        P::KIND
    }

    async fn sync_pending(&self, owner: &OwnerId) -> SyncResult<SyncOutcome> {
        RecordRepository::sync_pending(self, owner).await
    }
}
