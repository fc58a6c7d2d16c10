//! Process-wide shutdown signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Cloneable shutdown flag that sleeping loops can wait on.
#[derive(Clone)]
pub struct Shutdown {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once shutdown has been triggered.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // Sender lives in self, so this only errors if it is dropped.
        let _ = rx.wait_for(|down| *down).await;
    }

    /// Sleep up to `duration`, waking early on shutdown.
    ///
    /// Returns true if shutdown was triggered.
    pub async fn wait(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancelled() => true,
            _ = tokio::time::sleep(duration) => self.is_shutdown(),
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_times_out_without_shutdown() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.wait(Duration::from_millis(5)).await);
    }

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait(Duration::from_secs(60)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.trigger();
        assert!(waiter.await.unwrap());
        assert!(shutdown.is_shutdown());
    }
}
