//! Connectivity monitoring with debounced stability checks
//!
//! Platform reachability adapters push the current state into a
//! [`ChannelConnectivityMonitor`]; the engine only depends on the
//! [`ConnectivityMonitor`] trait. The "stable connection" predicate requires
//! connectivity to hold through a debounce window so flapping links do not
//! thrash sync attempts.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};

use crate::error::{SyncError, SyncResult};

/// Default debounce window for the stable-connection predicate.
pub const DEFAULT_STABLE_WINDOW: Duration = Duration::from_secs(3);

/// Read-only view of network reachability.
#[async_trait]
pub trait ConnectivityMonitor: Send + Sync {
    /// Current reachability snapshot.
    fn is_connected(&self) -> bool;

    /// Live connectivity signal; a new value is pushed on every change.
    fn subscribe(&self) -> watch::Receiver<bool>;

    /// True only if connectivity stays up through the debounce window.
    /// Returns as soon as the link drops; never blocks longer than the
    /// window.
    async fn has_stable_connection(&self) -> bool;
}

/// Watch-channel backed monitor. Platform adapters (OS reachability
/// callbacks, test harnesses) feed it via [`set_connected`].
///
/// [`set_connected`]: ChannelConnectivityMonitor::set_connected
pub struct ChannelConnectivityMonitor {
    tx: watch::Sender<bool>,
    stable_window: Duration,
    // Instant of the last disconnected-to-connected transition; None while
    // down. A link up for longer than the window passes the stability check
    // without waiting.
    connected_since: Mutex<Option<Instant>>,
}

impl ChannelConnectivityMonitor {
    pub fn new(initially_connected: bool) -> Self {
        Self::with_stable_window(initially_connected, DEFAULT_STABLE_WINDOW)
    }

    pub fn with_stable_window(initially_connected: bool, stable_window: Duration) -> Self {
        let (tx, _rx) = watch::channel(initially_connected);
        Self {
            tx,
            stable_window,
            connected_since: Mutex::new(initially_connected.then(Instant::now)),
        }
    }

    /// Push the current platform reachability state.
    pub fn set_connected(&self, connected: bool) {
        let previous = self.tx.send_replace(connected);
        if previous != connected {
            *self
                .connected_since
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = connected.then(Instant::now);
            tracing::debug!(connected, "connectivity changed");
        }
    }

    fn connected_since(&self) -> Option<Instant> {
        *self
            .connected_since
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ConnectivityMonitor for ChannelConnectivityMonitor {
    fn is_connected(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    async fn has_stable_connection(&self) -> bool {
        let Some(since) = self.connected_since() else {
            return false;
        };

        // Already stable: the link has held through a full window.
        let elapsed = since.elapsed();
        if elapsed >= self.stable_window {
            return *self.tx.borrow();
        }

        let mut rx = self.tx.subscribe();
        if !*rx.borrow() {
            return false;
        }
        let window = sleep(self.stable_window - elapsed);
        tokio::pin!(window);

        loop {
            tokio::select! {
                () = &mut window => return *rx.borrow(),
                changed = rx.changed() => match changed {
                    // Any drop inside the window means the link is not stable.
                    Ok(()) if *rx.borrow() => {}
                    _ => return false,
                },
            }
        }
    }
}

/// Wait until a stable connection exists, bounded by `wait_timeout`.
///
/// Fails with [`SyncError::NetworkUnavailable`] instead of hanging when
/// connectivity never stabilizes.
pub async fn wait_for_stable(
    monitor: &dyn ConnectivityMonitor,
    wait_timeout: Duration,
) -> SyncResult<()> {
    let deadline = Instant::now() + wait_timeout;
    let mut rx = monitor.subscribe();

    loop {
        if monitor.has_stable_connection().await {
            return Ok(());
        }
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return Err(SyncError::NetworkUnavailable);
        };
        if remaining.is_zero() {
            return Err(SyncError::NetworkUnavailable);
        }
        // Re-probe on the next signal change, or give up at the deadline.
        match timeout(remaining, rx.changed()).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) | Err(_) => return Err(SyncError::NetworkUnavailable),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(connected: bool, window_ms: u64) -> ChannelConnectivityMonitor {
        ChannelConnectivityMonitor::with_stable_window(
            connected,
            Duration::from_millis(window_ms),
        )
    }

    #[tokio::test]
    async fn stable_when_connection_holds_through_window() {
        let monitor = monitor(true, 20);
        assert!(monitor.has_stable_connection().await);
    }

    #[tokio::test]
    async fn not_stable_when_disconnected() {
        let monitor = monitor(false, 20);
        assert!(!monitor.has_stable_connection().await);
    }

    #[tokio::test]
    async fn flapping_link_is_not_stable() {
        let monitor = std::sync::Arc::new(self::monitor(true, 100));

        let flapper = std::sync::Arc::clone(&monitor);
        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            flapper.set_connected(false);
        });

        assert!(!monitor.has_stable_connection().await);
        handle.await.unwrap();
    }

    // A link that has already held through the window answers without
    // re-waiting it out.
    #[tokio::test]
    async fn long_stable_link_answers_immediately() {
        let monitor = monitor(true, 50);
        sleep(Duration::from_millis(80)).await;

        let started = Instant::now();
        assert!(monitor.has_stable_connection().await);
        assert!(started.elapsed() < Duration::from_millis(40));
    }

    #[tokio::test]
    async fn reconnect_restarts_the_window() {
        let monitor = monitor(true, 50);
        sleep(Duration::from_millis(80)).await;

        monitor.set_connected(false);
        monitor.set_connected(true);

        let started = Instant::now();
        assert!(monitor.has_stable_connection().await);
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn wait_for_stable_times_out_while_offline() {
        let monitor = monitor(false, 10);
        let result = wait_for_stable(&monitor, Duration::from_millis(50)).await;
        assert!(matches!(result, Err(SyncError::NetworkUnavailable)));
    }

    #[tokio::test]
    async fn wait_for_stable_succeeds_after_recovery() {
        let monitor = std::sync::Arc::new(self::monitor(false, 10));

        let restorer = std::sync::Arc::clone(&monitor);
        let handle = tokio::spawn(async move {
            sleep(Duration::from_millis(20)).await;
            restorer.set_connected(true);
        });

        wait_for_stable(monitor.as_ref(), Duration::from_secs(1))
            .await
            .unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn subscribe_sees_changes() {
        let monitor = monitor(true, 10);
        let mut rx = monitor.subscribe();
        assert!(*rx.borrow());

        monitor.set_connected(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
