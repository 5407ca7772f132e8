//! Local SQLite store for offline-first record caching
//!
//! Provides:
//! - Owner-scoped CRUD over cached records
//! - Per-record sync status and retry bookkeeping
//! - A pending query for the batch sync sweep
//!
//! The local store is authoritative until a record reaches `Synced`; it must
//! survive process restarts, so records live in a SQLite database keyed by
//! `(kind, owner_id, record_id)`.

use std::marker::PhantomData;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::error::{SyncError, SyncResult};
use crate::model::{OwnerId, RecordId, RecordPayload, SyncStatus, SyncableRecord};

/// Owner-scoped CRUD over locally cached records.
///
/// `put` is an upsert and must not fail short of storage corruption; the
/// status mutators are narrow and idempotent.
#[async_trait]
pub trait LocalStore<P: RecordPayload>: Send + Sync {
    /// Returns the stored record, or `None` when absent. Never errors for
    /// "not found".
    async fn get(&self, owner: &OwnerId, id: &RecordId)
        -> SyncResult<Option<SyncableRecord<P>>>;

    /// Upsert. `created_at` of an existing row is preserved.
    async fn put(&self, record: &SyncableRecord<P>) -> SyncResult<()>;

    /// All records for the owner whose status is not `Synced`.
    async fn list_pending(&self, owner: &OwnerId) -> SyncResult<Vec<SyncableRecord<P>>>;

    /// Mark a record `Synced` and reset its retry count.
    async fn mark_synced(&self, owner: &OwnerId, id: &RecordId) -> SyncResult<()>;

    /// Mark a record `Failed` and stamp the attempt instant. The record
    /// stays eligible for the next sweep.
    async fn mark_failed(&self, owner: &OwnerId, id: &RecordId) -> SyncResult<()>;

    /// Increment the record's retry counter.
    async fn increment_retry(&self, owner: &OwnerId, id: &RecordId) -> SyncResult<()>;

    /// Remove all of the owner's records. Used by sign-out / data-reset.
    async fn clear(&self, owner: &OwnerId) -> SyncResult<()>;
}

// A shared handle to a local store is itself a local store.
#[async_trait]
impl<P: RecordPayload, L: LocalStore<P> + ?Sized> LocalStore<P> for std::sync::Arc<L> {
    async fn get(
        &self,
        owner: &OwnerId,
        id: &RecordId,
    ) -> SyncResult<Option<SyncableRecord<P>>> {
        self.as_ref().get(owner, id).await
    }

    async fn put(&self, record: &SyncableRecord<P>) -> SyncResult<()> {
        self.as_ref().put(record).await
    }

    async fn list_pending(&self, owner: &OwnerId) -> SyncResult<Vec<SyncableRecord<P>>> {
        self.as_ref().list_pending(owner).await
    }

    async fn mark_synced(&self, owner: &OwnerId, id: &RecordId) -> SyncResult<()> {
        self.as_ref().mark_synced(owner, id).await
    }

    async fn mark_failed(&self, owner: &OwnerId, id: &RecordId) -> SyncResult<()> {
        self.as_ref().mark_failed(owner, id).await
    }

    async fn increment_retry(&self, owner: &OwnerId, id: &RecordId) -> SyncResult<()> {
        self.as_ref().increment_retry(owner, id).await
    }

    async fn clear(&self, owner: &OwnerId) -> SyncResult<()> {
        self.as_ref().clear(owner).await
    }
}

/// Configuration for the SQLite-backed local store.
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Path to the database file.
    pub db_path: String,
    /// Maximum number of connections in the pool.
    pub max_connections: u32,
    /// Whether to enable WAL mode.
    pub enable_wal: bool,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            db_path: "carelog_local.db".to_string(),
            max_connections: 5,
            enable_wal: true,
        }
    }
}

/// SQLite implementation of [`LocalStore`].
///
/// All record families share one `records` table partitioned by the payload
/// kind; payloads are stored as JSON text, instants as RFC 3339 text.
pub struct SqliteLocalStore<P> {
    pool: SqlitePool,
    _payload: PhantomData<fn() -> P>,
}

// The pool is shared across payload kinds; cloning a store for another
// family reuses the same database.
impl<P> Clone for SqliteLocalStore<P> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _payload: PhantomData,
        }
    }
}

impl<P: RecordPayload> SqliteLocalStore<P> {
    /// Open (creating if missing) the database at the configured path.
    pub async fn open(config: LocalStoreConfig) -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", config.db_path))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        if config.enable_wal {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await?;
        }
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        let store = Self {
            pool,
            _payload: PhantomData,
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Open an in-memory database. A single connection keeps every caller on
    /// the same in-memory instance.
    pub async fn open_in_memory() -> SyncResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self {
            pool,
            _payload: PhantomData,
        };
        store.initialize_schema().await?;
        Ok(store)
    }

    /// Reuse an already opened pool for another record family.
    pub fn with_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            _payload: PhantomData,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn initialize_schema(&self) -> SyncResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                kind TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                record_id TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                sync_status TEXT NOT NULL DEFAULT 'pending',
                sync_retry_count INTEGER NOT NULL DEFAULT 0,
                last_sync_attempt TEXT,
                PRIMARY KEY (kind, owner_id, record_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_status
             ON records(kind, owner_id, sync_status)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> SyncResult<SyncableRecord<P>> {
        let payload: String = row.try_get("payload")?;
        let created_at: String = row.try_get("created_at")?;
        let updated_at: String = row.try_get("updated_at")?;
        let sync_status: String = row.try_get("sync_status")?;
        let retry_count: i64 = row.try_get("sync_retry_count")?;
        let last_attempt: Option<String> = row.try_get("last_sync_attempt")?;

        Ok(SyncableRecord {
            id: RecordId::new(row.try_get::<String, _>("record_id")?),
            owner_id: OwnerId::new(row.try_get::<String, _>("owner_id")?),
            payload: serde_json::from_str(&payload)?,
            created_at: parse_instant(&created_at)?,
            updated_at: parse_instant(&updated_at)?,
            sync_status: SyncStatus::from_str(&sync_status)?,
            sync_retry_count: u32::try_from(retry_count.max(0)).unwrap_or(u32::MAX),
            last_sync_attempt: last_attempt.as_deref().map(parse_instant).transpose()?,
        })
    }
}

fn parse_instant(raw: &str) -> SyncResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| SyncError::LocalStorage(format!("Invalid timestamp {raw:?}: {e}")))
}

#[async_trait]
impl<P: RecordPayload> LocalStore<P> for SqliteLocalStore<P> {
    async fn get(
        &self,
        owner: &OwnerId,
        id: &RecordId,
    ) -> SyncResult<Option<SyncableRecord<P>>> {
        let row = sqlx::query(
            r#"
            SELECT owner_id, record_id, payload, created_at, updated_at,
                   sync_status, sync_retry_count, last_sync_attempt
            FROM records
            WHERE kind = ? AND owner_id = ? AND record_id = ?
            "#,
        )
        .bind(P::KIND)
        .bind(owner.as_str())
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn put(&self, record: &SyncableRecord<P>) -> SyncResult<()> {
        let payload = serde_json::to_string(&record.payload)?;

        sqlx::query(
            r#"
            INSERT INTO records (
                kind, owner_id, record_id, payload, created_at, updated_at,
                sync_status, sync_retry_count, last_sync_attempt
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (kind, owner_id, record_id) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at,
                sync_status = excluded.sync_status,
                sync_retry_count = excluded.sync_retry_count,
                last_sync_attempt = excluded.last_sync_attempt
            "#,
        )
        .bind(P::KIND)
        .bind(record.owner_id.as_str())
        .bind(record.id.as_str())
        .bind(payload)
        .bind(record.created_at.to_rfc3339())
        .bind(record.updated_at.to_rfc3339())
        .bind(record.sync_status.as_str())
        .bind(i64::from(record.sync_retry_count))
        .bind(record.last_sync_attempt.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            kind = P::KIND,
            owner_id = %record.owner_id,
            record_id = %record.id,
            status = record.sync_status.as_str(),
            "stored record"
        );

        Ok(())
    }

    async fn list_pending(&self, owner: &OwnerId) -> SyncResult<Vec<SyncableRecord<P>>> {
        let rows = sqlx::query(
            r#"
            SELECT owner_id, record_id, payload, created_at, updated_at,
                   sync_status, sync_retry_count, last_sync_attempt
            FROM records
            WHERE kind = ? AND owner_id = ? AND sync_status != 'synced'
            ORDER BY updated_at ASC
            "#,
        )
        .bind(P::KIND)
        .bind(owner.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn mark_synced(&self, owner: &OwnerId, id: &RecordId) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE records
            SET sync_status = 'synced',
                sync_retry_count = 0,
                last_sync_attempt = ?
            WHERE kind = ? AND owner_id = ? AND record_id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(P::KIND)
        .bind(owner.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_failed(&self, owner: &OwnerId, id: &RecordId) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE records
            SET sync_status = 'failed',
                last_sync_attempt = ?
            WHERE kind = ? AND owner_id = ? AND record_id = ?
            "#,
        )
        .bind(Utc::now().to_rfc3339())
        .bind(P::KIND)
        .bind(owner.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn increment_retry(&self, owner: &OwnerId, id: &RecordId) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE records
            SET sync_retry_count = sync_retry_count + 1
            WHERE kind = ? AND owner_id = ? AND record_id = ?
            "#,
        )
        .bind(P::KIND)
        .bind(owner.as_str())
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear(&self, owner: &OwnerId) -> SyncResult<()> {
        let result = sqlx::query("DELETE FROM records WHERE kind = ? AND owner_id = ?")
            .bind(P::KIND)
            .bind(owner.as_str())
            .execute(&self.pool)
            .await?;

        tracing::info!(
            kind = P::KIND,
            owner_id = %owner,
            removed = result.rows_affected(),
            "cleared local records"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UnitSystem, UserPreferences};

    async fn store() -> SqliteLocalStore<UserPreferences> {
        SqliteLocalStore::open_in_memory().await.unwrap()
    }

    fn record(owner: &str) -> SyncableRecord<UserPreferences> {
        let owner = OwnerId::new(owner);
        SyncableRecord::new(
            owner.clone(),
            UserPreferences::record_id(&owner),
            UserPreferences::manual(UnitSystem::Metric),
        )
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let store = store().await;
        let record = record("user-1");

        store.put(&record).await.unwrap();

        let fetched = store.get(&record.owner_id, &record.id).await.unwrap().unwrap();
        assert_eq!(fetched.payload, record.payload);
        assert_eq!(fetched.sync_status, SyncStatus::Pending);
        assert_eq!(fetched.sync_retry_count, 0);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let store = store().await;
        let owner = OwnerId::new("nobody");
        let fetched = store
            .get(&owner, &UserPreferences::record_id(&owner))
            .await
            .unwrap();
        assert!(fetched.is_none());
    }

    #[tokio::test]
    async fn upsert_preserves_created_at() {
        let store = store().await;
        let mut record = record("user-1");
        store.put(&record).await.unwrap();
        let original_created = store
            .get(&record.owner_id, &record.id)
            .await
            .unwrap()
            .unwrap()
            .created_at;

        record.created_at = Utc::now() + chrono::Duration::days(1);
        record.touch();
        store.put(&record).await.unwrap();

        let fetched = store.get(&record.owner_id, &record.id).await.unwrap().unwrap();
        assert_eq!(fetched.created_at, original_created);
        assert_eq!(fetched.updated_at.timestamp_millis(), record.updated_at.timestamp_millis());
    }

    #[tokio::test]
    async fn list_pending_excludes_synced() {
        let store = store().await;
        let record = record("user-1");
        store.put(&record).await.unwrap();

        let pending = store.list_pending(&record.owner_id).await.unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_synced(&record.owner_id, &record.id).await.unwrap();
        let pending = store.list_pending(&record.owner_id).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn list_pending_includes_failed() {
        let store = store().await;
        let record = record("user-1");
        store.put(&record).await.unwrap();
        store.mark_failed(&record.owner_id, &record.id).await.unwrap();

        let pending = store.list_pending(&record.owner_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sync_status, SyncStatus::Failed);
        assert!(pending[0].last_sync_attempt.is_some());
    }

    #[tokio::test]
    async fn mark_synced_resets_retry_count() {
        let store = store().await;
        let record = record("user-1");
        store.put(&record).await.unwrap();

        store.increment_retry(&record.owner_id, &record.id).await.unwrap();
        store.increment_retry(&record.owner_id, &record.id).await.unwrap();
        let fetched = store.get(&record.owner_id, &record.id).await.unwrap().unwrap();
        assert_eq!(fetched.sync_retry_count, 2);

        store.mark_synced(&record.owner_id, &record.id).await.unwrap();
        let fetched = store.get(&record.owner_id, &record.id).await.unwrap().unwrap();
        assert_eq!(fetched.sync_status, SyncStatus::Synced);
        assert_eq!(fetched.sync_retry_count, 0);
    }

    #[tokio::test]
    async fn mark_synced_is_idempotent() {
        let store = store().await;
        let record = record("user-1");
        store.put(&record).await.unwrap();

        store.mark_synced(&record.owner_id, &record.id).await.unwrap();
        store.mark_synced(&record.owner_id, &record.id).await.unwrap();

        let fetched = store.get(&record.owner_id, &record.id).await.unwrap().unwrap();
        assert_eq!(fetched.sync_status, SyncStatus::Synced);
    }

    #[tokio::test]
    async fn clear_is_owner_scoped() {
        let store = store().await;
        let first = record("user-1");
        let second = record("user-2");
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        store.clear(&first.owner_id).await.unwrap();

        assert!(store.get(&first.owner_id, &first.id).await.unwrap().is_none());
        assert!(store.get(&second.owner_id, &second.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn survives_reopen_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir
            .path()
            .join("records.db")
            .to_string_lossy()
            .into_owned();
        let config = LocalStoreConfig {
            db_path: db_path.clone(),
            ..LocalStoreConfig::default()
        };

        let record = record("user-1");
        {
            let store: SqliteLocalStore<UserPreferences> =
                SqliteLocalStore::open(config.clone()).await.unwrap();
            store.put(&record).await.unwrap();
            store.pool().close().await;
        }

        let store: SqliteLocalStore<UserPreferences> =
            SqliteLocalStore::open(config).await.unwrap();
        let fetched = store.get(&record.owner_id, &record.id).await.unwrap().unwrap();
        assert_eq!(fetched.payload, record.payload);
    }
}
