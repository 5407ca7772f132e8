//! Record model shared by every syncable record family
//!
//! A [`SyncableRecord`] wraps a family-specific payload with the metadata the
//! engine needs: ownership, creation/mutation instants, sync status and retry
//! bookkeeping. `updated_at` is the sole basis for conflict resolution.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Identifier of the user owning a record. All engine operations are
/// partitioned by owner; there is no cross-owner visibility.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a record, unique per owner.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Synchronization status of a local record.
///
/// Legal transitions: `Pending -> Synced` (successful push, or a pull that
/// supersedes local), `Pending -> Failed -> Pending` (failed attempt, then
/// requeued), and `Synced -> Pending` only through a new local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Synced,
    Pending,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Synced => "synced",
            SyncStatus::Pending => "pending",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> SyncResult<Self> {
        match s {
            "synced" => Ok(SyncStatus::Synced),
            "pending" => Ok(SyncStatus::Pending),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(SyncError::LocalStorage(format!(
                "Unknown sync status: {s}"
            ))),
        }
    }
}

/// Family-specific payload carried by a [`SyncableRecord`].
///
/// `KIND` partitions storage: each family gets its own key space locally and
/// its own document path remotely.
pub trait RecordPayload:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    const KIND: &'static str;
}

/// A locally cached, user-owned record tracked by the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncableRecord<P> {
    pub id: RecordId,
    pub owner_id: OwnerId,
    pub payload: P,
    /// Instant the record was first created; immutable after creation.
    pub created_at: DateTime<Utc>,
    /// Instant of the most recent mutation; drives last-write-wins.
    pub updated_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    /// Incremented on every failed sync attempt, reset to 0 on success.
    pub sync_retry_count: u32,
    /// Instant of the most recent sync attempt, used for backoff scheduling.
    pub last_sync_attempt: Option<DateTime<Utc>>,
}

impl<P: RecordPayload> SyncableRecord<P> {
    /// Create a fresh record pending its first push.
    pub fn new(owner_id: OwnerId, id: RecordId, payload: P) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            payload,
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::Pending,
            sync_retry_count: 0,
            last_sync_attempt: None,
        }
    }

    /// Record a local mutation: bump `updated_at` and requeue for sync.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.sync_status = SyncStatus::Pending;
    }

    /// Defensive check that `updated_at >= created_at`.
    pub fn validate_ordering(&self) -> SyncResult<()> {
        if self.updated_at < self.created_at {
            return Err(SyncError::ConflictResolution(format!(
                "record {} updated_at {} precedes created_at {}",
                self.id, self.updated_at, self.created_at
            )));
        }
        Ok(())
    }
}

/// Measurement unit system chosen by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitSystem {
    Metric,
    Imperial,
}

/// Per-user preferences. One document per owner; the record id is the owner
/// id itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserPreferences {
    pub unit_system: UnitSystem,
    /// True once the user has explicitly overridden a derived default.
    /// Automatic re-derivation (e.g. from locale) must never overwrite the
    /// value afterwards.
    pub is_manually_set: bool,
}

impl UserPreferences {
    /// A locale-derived default the user has not confirmed yet.
    pub fn derived(unit_system: UnitSystem) -> Self {
        Self {
            unit_system,
            is_manually_set: false,
        }
    }

    /// An explicit user choice.
    pub fn manual(unit_system: UnitSystem) -> Self {
        Self {
            unit_system,
            is_manually_set: true,
        }
    }

    pub fn record_id(owner: &OwnerId) -> RecordId {
        RecordId::new(owner.as_str())
    }
}

impl RecordPayload for UserPreferences {
    const KIND: &'static str = "preferences";
}

/// Logged menstrual flow intensity for a day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowIntensity {
    Spotting,
    Light,
    Medium,
    Heavy,
}

/// One day's logged health measurements. The record id is `{owner}:{date}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLogEntry {
    pub date: NaiveDate,
    pub period_flow: Option<FlowIntensity>,
    #[serde(default)]
    pub symptoms: Vec<String>,
    pub mood: Option<String>,
    pub notes: Option<String>,
}

impl DailyLogEntry {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            period_flow: None,
            symptoms: Vec::new(),
            mood: None,
            notes: None,
        }
    }

    pub fn record_id(owner: &OwnerId, date: NaiveDate) -> RecordId {
        RecordId::new(format!("{owner}:{date}"))
    }
}

impl RecordPayload for DailyLogEntry {
    const KIND: &'static str = "daily_log";
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> SyncableRecord<UserPreferences> {
        let owner = OwnerId::new("user-1");
        SyncableRecord::new(
            owner.clone(),
            UserPreferences::record_id(&owner),
            UserPreferences::manual(UnitSystem::Imperial),
        )
    }

    #[test]
    fn new_record_is_pending_with_consistent_timestamps() {
        let record = record();
        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert_eq!(record.sync_retry_count, 0);
        assert!(record.last_sync_attempt.is_none());
        assert!(record.updated_at >= record.created_at);
        record.validate_ordering().unwrap();
    }

    #[test]
    fn touch_bumps_updated_at_and_requeues() {
        let mut record = record();
        record.sync_status = SyncStatus::Synced;
        let before = record.updated_at;

        record.touch();

        assert_eq!(record.sync_status, SyncStatus::Pending);
        assert!(record.updated_at >= before);
    }

    #[test]
    fn validate_ordering_rejects_updated_before_created() {
        let mut record = record();
        record.updated_at = record.created_at - chrono::Duration::seconds(1);
        assert!(record.validate_ordering().is_err());
    }

    #[test]
    fn sync_status_round_trips_through_text() {
        for status in [SyncStatus::Synced, SyncStatus::Pending, SyncStatus::Failed] {
            assert_eq!(SyncStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(SyncStatus::from_str("unknown").is_err());
    }

    #[test]
    fn daily_log_record_id_combines_owner_and_date() {
        let owner = OwnerId::new("user-1");
        let date = NaiveDate::from_ymd_opt(2024, 3, 15).unwrap();
        assert_eq!(
            DailyLogEntry::record_id(&owner, date).as_str(),
            "user-1:2024-03-15"
        );
    }
}
