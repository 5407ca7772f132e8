//! Background sync orchestration
//!
//! Provides:
//! - A state machine over `Idle / Syncing / Synced / Failed / Offline /
//!   Stopped`, observable through a watch channel
//! - Connectivity-driven sync triggering with debounced recovery
//! - Single-flight batched sweeps across registered record repositories
//! - Bounded exponential backoff retries and a minimum resync interval
//! - Aggregate health metrics for degraded states
//!
//! One long-lived background task owns the orchestrator's lifecycle; at most
//! one sweep is in flight per instance, and concurrent requests queue behind
//! the running one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::connectivity::{wait_for_stable, ConnectivityMonitor};
use crate::error::{SyncError, SyncResult};
use crate::model::OwnerId;
use crate::repository::SyncParticipant;

/// Orchestrator state. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Idle,
    Syncing,
    Synced,
    Failed,
    /// A sync was requested while disconnected. An expected operating mode,
    /// not an error.
    Offline,
    Stopped,
}

impl SyncState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Syncing => "syncing",
            SyncState::Synced => "synced",
            SyncState::Failed => "failed",
            SyncState::Offline => "offline",
            SyncState::Stopped => "stopped",
        }
    }
}

/// Aggregate sync health counters.
#[derive(Debug, Clone, Default)]
pub struct SyncMetrics {
    pub total_sync_attempts: u64,
    pub failed_syncs: u64,
    /// Reset to 0 on every fully successful sweep. Being offline never
    /// touches this.
    pub consecutive_failures: u32,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub last_successful_sync: Option<DateTime<Utc>>,
}

/// Point-in-time view of the orchestrator for UI and monitoring.
#[derive(Debug, Clone)]
pub struct SyncStatusSnapshot {
    pub state: SyncState,
    pub metrics: SyncMetrics,
}

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Minimum interval between unforced sweeps, measured from the last
    /// successful sync.
    pub min_sync_interval: Duration,
    /// Base delay for the first retry after a failed sweep.
    pub retry_backoff_base: Duration,
    /// Upper bound on the retry delay.
    pub retry_backoff_ceiling: Duration,
    /// `is_healthy()` turns false once `consecutive_failures` exceeds this.
    pub unhealthy_after: u32,
    /// Bound on how long `recover_from_failure` waits for a stable
    /// connection.
    pub stable_wait_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_sync_interval: Duration::from_secs(30),
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_ceiling: Duration::from_secs(300),
            unhealthy_after: 5,
            stable_wait_timeout: Duration::from_secs(30),
        }
    }
}

impl OrchestratorConfig {
    /// Retry delay after `consecutive_failures` failed sweeps:
    /// `base * 2^(n-1)`, capped at the ceiling.
    pub fn backoff_delay(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(16);
        self.retry_backoff_base
            .saturating_mul(2u32.saturating_pow(exponent))
            .min(self.retry_backoff_ceiling)
    }
}

#[derive(Default)]
struct TaskHandles {
    watcher: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

/// Controller for background synchronization of all registered record
/// repositories. Constructed with its collaborators; no ambient globals.
pub struct SyncOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    // Self-handle for the retry task; weak so Drop still tears everything
    // down.
    weak: Weak<Inner>,
    owner: OwnerId,
    connectivity: Arc<dyn ConnectivityMonitor>,
    participants: Vec<Arc<dyn SyncParticipant>>,
    config: OrchestratorConfig,
    state_tx: watch::Sender<SyncState>,
    metrics: StdMutex<SyncMetrics>,
    // Single-flight discipline: one sweep in flight, callers queue behind.
    sweep_lock: Mutex<()>,
    tasks: StdMutex<TaskHandles>,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl SyncOrchestrator {
    pub fn new(
        owner: OwnerId,
        connectivity: Arc<dyn ConnectivityMonitor>,
        participants: Vec<Arc<dyn SyncParticipant>>,
        config: OrchestratorConfig,
    ) -> Self {
        let (state_tx, _state_rx) = watch::channel(SyncState::Idle);

        Self {
            inner: Arc::new_cyclic(|weak| Inner {
                weak: weak.clone(),
                owner,
                connectivity,
                participants,
                config,
                state_tx,
                metrics: StdMutex::new(SyncMetrics::default()),
                sweep_lock: Mutex::new(()),
                tasks: StdMutex::new(TaskHandles::default()),
                started: AtomicBool::new(false),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the background loop: watch the connectivity signal and, on a
    /// disconnected-to-connected edge, trigger a sync once the link is
    /// stable. Idempotent; a second call is a no-op.
    pub fn start(&self) -> SyncResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut conn_rx = inner.connectivity.subscribe();
            let mut was_connected = *conn_rx.borrow();

            while conn_rx.changed().await.is_ok() {
                let now_connected = *conn_rx.borrow_and_update();
                if now_connected && !was_connected {
                    tracing::info!(
                        owner_id = %inner.owner,
                        "connectivity restored, waiting for stability"
                    );
                    if inner.connectivity.has_stable_connection().await {
                        let _ = inner.run_sweep(false).await;
                    }
                }
                was_connected = now_connected;
            }
        });

        if let Ok(mut tasks) = self.inner.tasks.lock() {
            tasks.watcher = Some(handle);
        }
        self.inner.set_state(SyncState::Idle);
        tracing::info!(owner_id = %self.inner.owner, "sync orchestrator started");
        Ok(())
    }

    /// Run one batched sweep across all registered repositories.
    ///
    /// Offline is success (state moves to `Offline`); an unforced call
    /// within the minimum resync interval of the last successful sync is a
    /// rate-limited no-op. `force` bypasses the rate limit for explicit
    /// "sync now" requests.
    pub async fn trigger_sync(&self, force: bool) -> SyncResult<()> {
        self.inner.run_sweep(force).await
    }

    /// Explicit recovery path: wait (bounded) for a stable connection, then
    /// force a sweep.
    pub async fn recover_from_failure(&self) -> SyncResult<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        wait_for_stable(
            self.inner.connectivity.as_ref(),
            self.inner.config.stable_wait_timeout,
        )
        .await?;
        self.inner.run_sweep(true).await
    }

    /// Cancel the background loop and any scheduled retry. Terminal: the
    /// instance accepts no further sync requests.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            if let Some(watcher) = tasks.watcher.take() {
                watcher.abort();
            }
            if let Some(retry) = tasks.retry.take() {
                retry.abort();
            }
        }
        self.inner.set_state(SyncState::Stopped);
        tracing::info!(owner_id = %self.inner.owner, "sync orchestrator stopped");
    }

    /// Current state plus a metrics copy.
    pub fn status(&self) -> SyncStatusSnapshot {
        SyncStatusSnapshot {
            state: *self.inner.state_tx.borrow(),
            metrics: self.inner.metrics(),
        }
    }

    /// Observable state; a new value is pushed on every transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state_tx.subscribe()
    }

    /// False once sync is persistently broken (consecutive failures beyond
    /// the configured threshold). Distinct from merely being offline.
    pub fn is_healthy(&self) -> bool {
        self.inner.metrics().consecutive_failures <= self.inner.config.unhealthy_after
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.inner.tasks.lock() {
            if let Some(watcher) = tasks.watcher.take() {
                watcher.abort();
            }
            if let Some(retry) = tasks.retry.take() {
                retry.abort();
            }
        }
    }
}

impl Inner {
    fn metrics(&self) -> SyncMetrics {
        self.metrics
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn with_metrics<T>(&self, f: impl FnOnce(&mut SyncMetrics) -> T) -> T {
        let mut metrics = self.metrics.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut metrics)
    }

    fn set_state(&self, new: SyncState) {
        let mut applied = false;
        self.state_tx.send_if_modified(|state| {
            // Stopped is terminal.
            if *state == SyncState::Stopped && new != SyncState::Stopped {
                return false;
            }
            if *state == new {
                return false;
            }
            *state = new;
            applied = true;
            true
        });
        if applied {
            tracing::debug!(state = new.as_str(), "sync state changed");
        }
    }

    fn recently_synced(&self) -> bool {
        let Some(last) = self.metrics().last_successful_sync else {
            return false;
        };
        let elapsed = Utc::now()
            .signed_duration_since(last)
            .to_std()
            .unwrap_or(Duration::ZERO);
        elapsed < self.config.min_sync_interval
    }

    async fn run_sweep(&self, force: bool) -> SyncResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }
        let _sweep = self.sweep_lock.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Stopped);
        }

        if !self.connectivity.is_connected() {
            self.set_state(SyncState::Offline);
            tracing::debug!(owner_id = %self.owner, "sync requested while offline");
            return Ok(());
        }

        if !force && self.recently_synced() {
            tracing::debug!(
                owner_id = %self.owner,
                "skipping sync inside minimum resync interval"
            );
            return Ok(());
        }

        let sweep_id = Uuid::new_v4();
        self.set_state(SyncState::Syncing);
        self.with_metrics(|metrics| {
            metrics.total_sync_attempts += 1;
            metrics.last_sync_attempt = Some(Utc::now());
        });

        let mut attempted = 0usize;
        let mut synced = 0usize;
        let mut failed = 0usize;
        for participant in &self.participants {
            match participant.sync_pending(&self.owner).await {
                Ok(outcome) => {
                    attempted += outcome.attempted;
                    synced += outcome.synced;
                    tracing::debug!(
                        sweep_id = %sweep_id,
                        family = participant.name(),
                        attempted = outcome.attempted,
                        synced = outcome.synced,
                        "participant synced"
                    );
                }
                Err(SyncError::NetworkUnavailable) => {
                    tracing::debug!(
                        sweep_id = %sweep_id,
                        family = participant.name(),
                        "connectivity lost mid-sweep"
                    );
                    self.set_state(SyncState::Offline);
                    return Ok(());
                }
                Err(SyncError::SyncIncomplete {
                    failed: family_failed,
                    attempted: family_attempted,
                }) => {
                    attempted += family_attempted;
                    synced += family_attempted - family_failed;
                    failed += family_failed;
                    tracing::warn!(
                        sweep_id = %sweep_id,
                        family = participant.name(),
                        failed = family_failed,
                        "participant sync incomplete"
                    );
                }
                Err(err) => {
                    failed += 1;
                    tracing::warn!(
                        sweep_id = %sweep_id,
                        family = participant.name(),
                        error = %err,
                        "participant sync failed"
                    );
                }
            }
        }

        if failed == 0 {
            self.with_metrics(|metrics| {
                metrics.consecutive_failures = 0;
                metrics.last_successful_sync = Some(Utc::now());
            });
            self.set_state(SyncState::Synced);
            tracing::info!(
                sweep_id = %sweep_id,
                owner_id = %self.owner,
                attempted,
                synced,
                "sync sweep complete"
            );
            return Ok(());
        }

        let (consecutive, delay) = self.with_metrics(|metrics| {
            metrics.failed_syncs += 1;
            metrics.consecutive_failures += 1;
            (
                metrics.consecutive_failures,
                self.config.backoff_delay(metrics.consecutive_failures),
            )
        });
        self.set_state(SyncState::Failed);
        tracing::warn!(
            sweep_id = %sweep_id,
            owner_id = %self.owner,
            failed,
            consecutive_failures = consecutive,
            retry_in_secs = delay.as_secs(),
            "sync sweep failed, retry scheduled"
        );
        self.schedule_retry(delay);

        Err(SyncError::SyncIncomplete { failed, attempted })
    }

    /// Run a forced sweep after the backoff delay, straight through the
    /// single-flight lock; no watcher loop is required. A newer failure
    /// replaces any retry already scheduled.
    fn schedule_retry(&self, delay: Duration) {
        let Some(inner) = self.weak.upgrade() else {
            return;
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = inner.run_sweep(true).await;
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(previous) = tasks.retry.take() {
                previous.abort();
            }
            tasks.retry = Some(handle);
        }
    }
}
