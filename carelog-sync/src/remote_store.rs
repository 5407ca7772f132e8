//! Remote document store adapters
//!
//! The remote store keeps one JSON document per record, scoped by owner.
//! Calls fail when offline ([`RemoteError::Unreachable`]) or on backend
//! error ([`RemoteError::Rejected`]); the two are handled very differently
//! upstream, so classification happens here at the boundary.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::{RemoteError, SyncError, SyncResult};
use crate::model::{OwnerId, RecordId, RecordPayload, SyncStatus, SyncableRecord};

/// Owner-scoped CRUD against the cloud document store.
#[async_trait]
pub trait RemoteStore<P: RecordPayload>: Send + Sync {
    /// Fetch a record; `Ok(None)` when the document does not exist.
    async fn get(
        &self,
        owner: &OwnerId,
        id: &RecordId,
    ) -> Result<Option<SyncableRecord<P>>, RemoteError>;

    /// Upsert a record's document.
    async fn put(&self, record: &SyncableRecord<P>) -> Result<(), RemoteError>;

    /// Delete every document of this family for the owner.
    async fn delete(&self, owner: &OwnerId) -> Result<(), RemoteError>;
}

// A shared handle to a remote store is itself a remote store.
#[async_trait]
impl<P: RecordPayload, R: RemoteStore<P> + ?Sized> RemoteStore<P> for std::sync::Arc<R> {
    async fn get(
        &self,
        owner: &OwnerId,
        id: &RecordId,
    ) -> Result<Option<SyncableRecord<P>>, RemoteError> {
        self.as_ref().get(owner, id).await
    }

    async fn put(&self, record: &SyncableRecord<P>) -> Result<(), RemoteError> {
        self.as_ref().put(record).await
    }

    async fn delete(&self, owner: &OwnerId) -> Result<(), RemoteError> {
        self.as_ref().delete(owner).await
    }
}

/// Wire shape of a remote document. Sync bookkeeping (status, retries) is
/// local-only and never leaves the device.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RemoteDocument<P> {
    payload: P,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<P: RecordPayload> RemoteDocument<P> {
    fn from_record(record: &SyncableRecord<P>) -> Self {
        Self {
            payload: record.payload.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }

    fn into_record(self, owner: &OwnerId, id: &RecordId) -> SyncableRecord<P> {
        SyncableRecord {
            id: id.clone(),
            owner_id: owner.clone(),
            payload: self.payload,
            created_at: self.created_at,
            updated_at: self.updated_at,
            sync_status: SyncStatus::Synced,
            sync_retry_count: 0,
            last_sync_attempt: None,
        }
    }
}

/// Configuration for [`HttpRemoteStore`].
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    /// Base URL of the document API.
    pub base_url: String,
    /// Bearer token; authentication itself is external to the engine.
    pub auth_token: Option<String>,
    /// Per-request timeout.
    pub request_timeout: Duration,
}

impl Default for RemoteStoreConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            auth_token: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// HTTP implementation of [`RemoteStore`].
///
/// Documents live at `{base}/v1/{kind}/{owner}/{record}`; owner-level delete
/// targets `{base}/v1/{kind}/{owner}`.
pub struct HttpRemoteStore<P> {
    client: reqwest::Client,
    config: RemoteStoreConfig,
    _payload: PhantomData<fn() -> P>,
}

impl<P: RecordPayload> HttpRemoteStore<P> {
    pub fn new(config: RemoteStoreConfig) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| SyncError::Internal(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            _payload: PhantomData,
        })
    }

    fn record_url(&self, owner: &OwnerId, id: &RecordId) -> String {
        format!(
            "{}/v1/{}/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            P::KIND,
            owner,
            id
        )
    }

    fn owner_url(&self, owner: &OwnerId) -> String {
        format!(
            "{}/v1/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            P::KIND,
            owner
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Errors raised before a response arrives are transport problems; anything
/// the server answered with is a rejection.
fn classify_transport(err: reqwest::Error) -> RemoteError {
    RemoteError::Unreachable(err.to_string())
}

fn classify_status(status: reqwest::StatusCode) -> RemoteError {
    RemoteError::Rejected(format!("HTTP {}", status.as_u16()))
}

#[async_trait]
impl<P: RecordPayload> RemoteStore<P> for HttpRemoteStore<P> {
    async fn get(
        &self,
        owner: &OwnerId,
        id: &RecordId,
    ) -> Result<Option<SyncableRecord<P>>, RemoteError> {
        let request = self.authorize(self.client.get(self.record_url(owner, id)));
        let response = request.send().await.map_err(classify_transport)?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }

        let document = response
            .json::<RemoteDocument<P>>()
            .await
            .map_err(|e| RemoteError::Rejected(format!("Invalid response body: {e}")))?;

        Ok(Some(document.into_record(owner, id)))
    }

    async fn put(&self, record: &SyncableRecord<P>) -> Result<(), RemoteError> {
        let url = self.record_url(&record.owner_id, &record.id);
        let request = self
            .authorize(self.client.put(url))
            .json(&RemoteDocument::from_record(record));
        let response = request.send().await.map_err(classify_transport)?;

        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }
        Ok(())
    }

    async fn delete(&self, owner: &OwnerId) -> Result<(), RemoteError> {
        let request = self.authorize(self.client.delete(self.owner_url(owner)));
        let response = request.send().await.map_err(classify_transport)?;

        // Deleting an owner with no documents is fine.
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(classify_status(response.status()));
        }
        Ok(())
    }
}

/// In-process [`RemoteStore`] with offline and rejection switches.
///
/// The canonical test double, also usable for local development without a
/// backend. Operation counters let tests assert that rate-limited or offline
/// paths perform no network work.
pub struct MemoryRemoteStore<P> {
    documents: Mutex<HashMap<(String, String), StoredDocument>>,
    online: AtomicBool,
    reject: AtomicBool,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
    _payload: PhantomData<fn() -> P>,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    payload_json: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<P: RecordPayload> MemoryRemoteStore<P> {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            online: AtomicBool::new(true),
            reject: AtomicBool::new(false),
            get_calls: AtomicUsize::new(0),
            put_calls: AtomicUsize::new(0),
            _payload: PhantomData,
        }
    }

    /// Simulate losing or regaining reachability.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Make the backend answer every mutation with a rejection.
    pub fn set_reject(&self, reject: bool) {
        self.reject.store(reject, Ordering::SeqCst);
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    pub async fn document_count(&self) -> usize {
        self.documents.lock().await.len()
    }

    fn check_reachable(&self) -> Result<(), RemoteError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(RemoteError::Unreachable("remote store offline".into()));
        }
        Ok(())
    }

    fn check_accepting(&self) -> Result<(), RemoteError> {
        if self.reject.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("rejected by server".into()));
        }
        Ok(())
    }

    fn key(owner: &OwnerId, id: &RecordId) -> (String, String) {
        (owner.as_str().to_string(), id.as_str().to_string())
    }
}

#[async_trait]
impl<P: RecordPayload> RemoteStore<P> for MemoryRemoteStore<P> {
    async fn get(
        &self,
        owner: &OwnerId,
        id: &RecordId,
    ) -> Result<Option<SyncableRecord<P>>, RemoteError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;

        let documents = self.documents.lock().await;
        let Some(stored) = documents.get(&Self::key(owner, id)) else {
            return Ok(None);
        };
        let payload: P = serde_json::from_str(&stored.payload_json)
            .map_err(|e| RemoteError::Rejected(format!("Invalid stored document: {e}")))?;

        Ok(Some(
            RemoteDocument {
                payload,
                created_at: stored.created_at,
                updated_at: stored.updated_at,
            }
            .into_record(owner, id),
        ))
    }

    async fn put(&self, record: &SyncableRecord<P>) -> Result<(), RemoteError> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        self.check_reachable()?;
        self.check_accepting()?;

        let payload_json = serde_json::to_string(&record.payload)
            .map_err(|e| RemoteError::Rejected(format!("Unserializable payload: {e}")))?;

        let mut documents = self.documents.lock().await;
        documents.insert(
            Self::key(&record.owner_id, &record.id),
            StoredDocument {
                payload_json,
                created_at: record.created_at,
                updated_at: record.updated_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, owner: &OwnerId) -> Result<(), RemoteError> {
        self.check_reachable()?;
        self.check_accepting()?;

        let mut documents = self.documents.lock().await;
        documents.retain(|(doc_owner, _), _| doc_owner.as_str() != owner.as_str());
        Ok(())
    }
}

impl<P: RecordPayload> Default for MemoryRemoteStore<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Seed helper for tests and demos: store a record as if another device had
/// already synced it.
impl<P: RecordPayload> MemoryRemoteStore<P> {
    pub async fn seed(&self, record: &SyncableRecord<P>) -> SyncResult<()> {
        let payload_json = serde_json::to_string(&record.payload)?;
        let mut documents = self.documents.lock().await;
        documents.insert(
            Self::key(&record.owner_id, &record.id),
            StoredDocument {
                payload_json,
                created_at: record.created_at,
                updated_at: record.updated_at,
            },
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{UnitSystem, UserPreferences};

    fn record(owner: &str) -> SyncableRecord<UserPreferences> {
        let owner = OwnerId::new(owner);
        SyncableRecord::new(
            owner.clone(),
            UserPreferences::record_id(&owner),
            UserPreferences::manual(UnitSystem::Imperial),
        )
    }

    #[tokio::test]
    async fn put_then_get_returns_synced_record() {
        let store = MemoryRemoteStore::<UserPreferences>::new();
        let record = record("user-1");

        store.put(&record).await.unwrap();
        let fetched = store.get(&record.owner_id, &record.id).await.unwrap().unwrap();

        assert_eq!(fetched.payload, record.payload);
        assert_eq!(fetched.sync_status, SyncStatus::Synced);
        assert_eq!(fetched.updated_at, record.updated_at);
    }

    #[tokio::test]
    async fn offline_store_is_unreachable() {
        let store = MemoryRemoteStore::<UserPreferences>::new();
        store.set_online(false);
        let record = record("user-1");

        let err = store.put(&record).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable(_)));

        let err = store.get(&record.owner_id, &record.id).await.unwrap_err();
        assert!(matches!(err, RemoteError::Unreachable(_)));
    }

    #[tokio::test]
    async fn rejecting_store_classifies_as_rejected() {
        let store = MemoryRemoteStore::<UserPreferences>::new();
        store.set_reject(true);
        let record = record("user-1");

        let err = store.put(&record).await.unwrap_err();
        assert!(matches!(err, RemoteError::Rejected(_)));
    }

    #[tokio::test]
    async fn delete_removes_only_the_owner() {
        let store = MemoryRemoteStore::<UserPreferences>::new();
        let first = record("user-1");
        let second = record("user-2");
        store.put(&first).await.unwrap();
        store.put(&second).await.unwrap();

        store.delete(&first.owner_id).await.unwrap();

        assert!(store.get(&first.owner_id, &first.id).await.unwrap().is_none());
        assert!(store.get(&second.owner_id, &second.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn missing_document_is_none_not_error() {
        let store = MemoryRemoteStore::<UserPreferences>::new();
        let owner = OwnerId::new("user-1");
        let fetched = store
            .get(&owner, &UserPreferences::record_id(&owner))
            .await
            .unwrap();
        assert!(fetched.is_none());
    }

    #[test]
    fn remote_document_serialization_round_trips() {
        let record = record("user-1");
        let document = RemoteDocument::from_record(&record);

        let json = serde_json::to_string(&document).unwrap();
        let parsed: RemoteDocument<UserPreferences> = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.payload, record.payload);
        assert_eq!(parsed.updated_at, record.updated_at);
    }

    #[test]
    fn http_store_builds_document_urls() {
        let store = HttpRemoteStore::<UserPreferences>::new(RemoteStoreConfig {
            base_url: "https://api.carelog.dev/".to_string(),
            ..RemoteStoreConfig::default()
        })
        .unwrap();

        let owner = OwnerId::new("user-1");
        let id = UserPreferences::record_id(&owner);
        assert_eq!(
            store.record_url(&owner, &id),
            "https://api.carelog.dev/v1/preferences/user-1/user-1"
        );
        assert_eq!(
            store.owner_url(&owner),
            "https://api.carelog.dev/v1/preferences/user-1"
        );
    }
}
