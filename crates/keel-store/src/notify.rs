//! Policy change notification.
//!
//! A wake-up signal, not a queue: signals raised while nobody waits collapse into one stored
//! permit. Consumers must re-read the last generation after every wake-up and should also poll,
//! since several commits may be observed as a single signal.

use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Clone, Default)]
pub struct PolicyChangeNotifier {
    inner: Arc<Notify>,
}

impl PolicyChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal that a new generation exists.
    pub fn notify(&self) {
        self.inner.notify_one();
    }

    /// Wait for the next signal, or consume a pending one.
    pub async fn notified(&self) {
        self.inner.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn signals_coalesce_into_one_wakeup() {
        let notifier = PolicyChangeNotifier::new();
        notifier.notify();
        notifier.notify();

        tokio::time::timeout(Duration::from_millis(100), notifier.notified())
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_millis(50), notifier.notified()).await;
        assert!(second.is_err());
    }
}
