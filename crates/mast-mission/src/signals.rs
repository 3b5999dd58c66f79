use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A boolean that can be awaited.
#[derive(Debug, Default)]
pub struct Flag {
    value: AtomicBool,
    notify: Notify,
}

impl Flag {
    /// Returns true if the flag was not already set.
    pub fn set(&self) -> bool {
        let was = self.value.swap(true, Ordering::SeqCst);
        if !was {
            self.notify.notify_waiters();
        }
        !was
    }

    pub fn clear(&self) {
        self.value.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }

    /// Resolves once the flag is set; immediately if it already is.
    pub async fn wait(&self) {
        loop {
            // register before checking so a concurrent set() is not missed
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// Shared between the mission driver and the condition monitors.
#[derive(Debug, Default)]
pub struct MissionSignals {
    pub obstacle_triggered: Flag,
    pub mast_found: Flag,
    pub is_returning: Flag,
    pub altitude_reached: Flag,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_set_is_idempotent() {
        let f = Flag::default();
        assert!(!f.is_set());
        assert!(f.set());
        assert!(!f.set());
        assert!(f.is_set());
        f.clear();
        assert!(!f.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_wakes_on_set() {
        let signals = Arc::new(MissionSignals::default());
        let s = signals.clone();
        let waiter = tokio::spawn(async move { s.mast_found.wait().await });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());
        signals.mast_found.set();
        tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();

        // already set: returns straight away
        signals.mast_found.wait().await;
    }
}
