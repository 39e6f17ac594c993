use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Tells long-lived connections that the server is going away and counts
/// how many are still open.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    tx: Arc<watch::Sender<bool>>,
    active: Arc<AtomicUsize>,
}

/// Held by a connection for its lifetime.
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a connection. The receiver flips to `true` on shutdown.
    pub fn register(&self) -> (ConnectionGuard, watch::Receiver<bool>) {
        self.active.fetch_add(1, Ordering::AcqRel);
        (
            ConnectionGuard {
                active: Arc::clone(&self.active),
            },
            self.tx.subscribe(),
        )
    }

    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Wait until every registered connection has dropped its guard.
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_for_all_closed(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.active_connections() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guards_are_counted() {
        let coordinator = ShutdownCoordinator::new();
        let (a, _) = coordinator.register();
        let (b, _) = coordinator.register();
        assert_eq!(coordinator.active_connections(), 2);
        drop(a);
        assert_eq!(coordinator.active_connections(), 1);
        drop(b);
        assert!(coordinator.wait_for_all_closed(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn shutdown_reaches_registered_receivers() {
        let coordinator = ShutdownCoordinator::new();
        let (_guard, mut rx) = coordinator.register();
        assert!(!coordinator.is_shutting_down());
        coordinator.shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
        assert!(coordinator.is_shutting_down());
    }

    #[tokio::test]
    async fn late_registrations_see_shutdown() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.shutdown();
        let (_guard, rx) = coordinator.register();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn wait_times_out_with_open_connections() {
        let coordinator = ShutdownCoordinator::new();
        let (_guard, _) = coordinator.register();
        assert!(!coordinator.wait_for_all_closed(Duration::from_millis(30)).await);
    }
}
