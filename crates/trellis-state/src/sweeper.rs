//! Background expiry sweeping.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::store::StateStore;

/// Handle to a running sweeper task. The task stops when the handle is
/// dropped, when [`SweeperHandle::stop`] is called, or when the store is
/// dropped.
#[derive(Debug)]
pub struct SweeperHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper and wait for the task to exit.
    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl StateStore {
    /// Spawn a task calling [`StateStore::sweep_expired`] every `interval`.
    ///
    /// Must be called from within a tokio runtime. The task only holds a
    /// weak reference to the store.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let interval = interval.max(Duration::from_millis(1));
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let store = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        let removed = store.sweep_expired();
                        if removed > 0 {
                            debug!(removed, "Background sweep evicted expired entries");
                        }
                    }
                }
            }
            debug!("State sweeper stopped");
        });

        SweeperHandle {
            cancel,
            task: Some(task),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::SetOptions;
    use crate::scope::{Scope, ScopeIds};
    use serde_json::json;

    #[tokio::test]
    async fn test_sweeper_evicts_in_background() {
        let store = Arc::new(StateStore::new());
        store
            .set(
                "k",
                json!(1),
                Scope::Global,
                &ScopeIds::none(),
                SetOptions::new().expires_in(Duration::from_millis(20)),
            )
            .unwrap();

        let handle = store.spawn_sweeper(Duration::from_millis(10));
        assert!(handle.is_running());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(store.len(), 0);

        handle.stop().await;
    }

    #[tokio::test]
    async fn test_sweeper_exits_when_store_dropped() {
        let store = Arc::new(StateStore::new());
        let handle = store.spawn_sweeper(Duration::from_millis(5));
        drop(store);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_running());
    }
}
