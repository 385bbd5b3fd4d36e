use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use v6_types::entities::SessionId;

/// Serializes `submit_task`'s check-then-materialize critical section for
/// a given `(session_id, handle)`: whether a dataframe's current
/// `last_session_task_id` is still alive, and (if not) admitting the next
/// modifier, must happen as one atomic step so two concurrent submissions
/// against the same handle can't both observe "no alive modifier" and
/// both proceed. Not held across a modifier task's actual execution —
/// that happens out-of-process, reported back via `PATCH /run/<id>` from
/// whichever nodes run it — so the guard's critical section is short.
/// Compute tasks against a ready dataframe are not gated here and may run
/// concurrently with each other.
#[derive(Default)]
pub struct DataframeLocks {
    locks: RwLock<HashMap<(SessionId, String), Arc<Mutex<()>>>>,
}

impl DataframeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn mutex_for(&self, session_id: SessionId, handle: &str) -> Arc<Mutex<()>> {
        let key = (session_id, handle.to_string());
        if let Some(existing) = self.locks.read().await.get(&key) {
            return existing.clone();
        }
        let mut locks = self.locks.write().await;
        locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Acquire the serialization guard for `(session_id, handle)`.
    pub async fn acquire(&self, session_id: SessionId, handle: &str) -> OwnedMutexGuard<()> {
        self.mutex_for(session_id, handle)
            .await
            .lock_owned()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_handle_serializes_concurrent_holders() {
        let locks = Arc::new(DataframeLocks::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let l1 = locks.clone();
        let o1 = order.clone();
        let t1 = tokio::spawn(async move {
            let _guard = l1.acquire(1, "patients").await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            o1.lock().await.push(1);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        let l2 = locks.clone();
        let o2 = order.clone();
        let t2 = tokio::spawn(async move {
            let _guard = l2.acquire(1, "patients").await;
            o2.lock().await.push(2);
        });

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(*order.lock().await, vec![1, 2]);
    }

    #[tokio::test]
    async fn different_handles_do_not_contend() {
        let locks = DataframeLocks::new();
        let _a = locks.acquire(1, "a").await;
        let fut = locks.acquire(1, "b");
        let _b = tokio::time::timeout(Duration::from_millis(100), fut)
            .await
            .expect("independent handles must not block each other");
    }
}
