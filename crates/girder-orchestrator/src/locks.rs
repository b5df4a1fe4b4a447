// Path-level write locks. Within a tenant, concurrent builds writing to
// the same workspace path are serialized; distinct paths proceed freely.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub struct PathLockManager {
    locks: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl PathLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the write lock for `(tenant, path)`, waiting if another
    /// writer holds it. The guard releases on drop.
    pub async fn write_lock(&self, tenant: &str, path: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            Arc::clone(
                locks
                    .entry((tenant.to_string(), path.to_string()))
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_path_excludes_concurrent_writers() {
        let locks = Arc::new(PathLockManager::new());
        let acquired_late = Arc::new(AtomicUsize::new(0));

        let first = locks.write_lock("acme", "out/main.txt").await;

        let locks2 = Arc::clone(&locks);
        let late = Arc::clone(&acquired_late);
        let start = tokio::time::Instant::now();
        let waiter = tokio::spawn(async move {
            let _guard = locks2.write_lock("acme", "out/main.txt").await;
            if start.elapsed() >= Duration::from_millis(80) {
                late.store(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(first);
        waiter.await.unwrap();
        assert_eq!(acquired_late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_tenants_do_not_contend() {
        let locks = PathLockManager::new();
        let _a = locks.write_lock("acme", "out/main.txt").await;
        // Would deadlock if tenants shared a lock key.
        let _b = locks.write_lock("globex", "out/main.txt").await;
    }
}
