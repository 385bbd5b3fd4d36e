use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tokio::time::sleep;

#[derive(Debug, Clone)]
struct LockRow {
    process_id: String,
    expires_at: Instant,
}

/// Application-level named mutex, grounded on the original
/// `DatabaseLock` table (acquire/release/cleanup-expired, timeout-bound).
/// Here it guards named critical sections within one coordinator process
/// rather than rows in a shared relational table, since this workspace
/// runs the coordinator as a single process (see DESIGN.md).
#[derive(Debug, Default)]
pub struct DatabaseLock {
    rows: Mutex<HashMap<String, LockRow>>,
}

impl DatabaseLock {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
        }
    }

    fn poll_interval() -> Duration {
        Duration::from_millis(100)
    }

    /// Attempt to acquire `lock_name` for `process_id`, polling until
    /// `timeout` elapses. Returns `true` iff the lock was acquired.
    pub async fn acquire_lock(&self, lock_name: &str, process_id: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut rows = self.rows.lock().await;
                self.cleanup_expired(&mut rows);
                if let Some(existing) = rows.get(lock_name) {
                    if existing.process_id != process_id {
                        // held by someone else, fall through to poll/timeout
                    } else {
                        return true;
                    }
                } else {
                    rows.insert(
                        lock_name.to_string(),
                        LockRow {
                            process_id: process_id.to_string(),
                            expires_at: Instant::now() + timeout,
                        },
                    );
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Self::poll_interval()).await;
        }
    }

    /// Release `lock_name` if it is currently held by `process_id`.
    pub async fn release_lock(&self, lock_name: &str, process_id: &str) {
        let mut rows = self.rows.lock().await;
        if let Some(existing) = rows.get(lock_name) {
            if existing.process_id == process_id {
                rows.remove(lock_name);
            }
        }
    }

    fn cleanup_expired(&self, rows: &mut HashMap<String, LockRow>) {
        let now = Instant::now();
        rows.retain(|_, row| row.expires_at >= now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn acquire_then_release_leaves_no_rows() {
        let lock = DatabaseLock::new();
        assert!(lock.acquire_lock("migration", "pid-1", Duration::from_secs(1)).await);
        lock.release_lock("migration", "pid-1").await;
        assert!(lock.rows.lock().await.is_empty());
    }

    #[tokio::test]
    async fn second_holder_times_out() {
        let lock = Arc::new(DatabaseLock::new());
        assert!(lock.acquire_lock("migration", "pid-1", Duration::from_secs(5)).await);

        let start = Instant::now();
        let acquired = lock
            .acquire_lock("migration", "pid-2", Duration::from_millis(300))
            .await;
        let elapsed = start.elapsed();

        assert!(!acquired);
        assert!(elapsed >= Duration::from_millis(250));
    }

    #[tokio::test]
    async fn independent_lock_names_do_not_contend() {
        let lock = DatabaseLock::new();
        assert!(lock.acquire_lock("a", "pid-1", Duration::from_secs(1)).await);
        assert!(lock.acquire_lock("b", "pid-2", Duration::from_secs(1)).await);
    }
}
