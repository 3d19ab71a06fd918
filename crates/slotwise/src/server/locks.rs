//! Per-device serialization of server-side mutations.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

/// Sharded mutual exclusion keyed by device id.
///
/// Two reports for the same device always land on the same shard and never
/// interleave; unrelated devices contend only when they share a shard.
#[derive(Debug)]
pub struct DeviceLocks {
    shards: Box<[Mutex<()>]>,
}

impl DeviceLocks {
    /// Create `shards` locks (at least one).
    #[must_use]
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(())).collect();
        Self { shards }
    }

    /// Number of shards.
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, device_id: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        // Modulo keeps the value below the shard count, which is a usize.
        #[allow(clippy::cast_possible_truncation)]
        let index = (hasher.finish() % self.shards.len() as u64) as usize;
        index
    }

    /// Wait for exclusive access to `device_id`.
    pub async fn lock(&self, device_id: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(device_id)].lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_same_device_same_shard() {
        let locks = DeviceLocks::new(64);
        assert_eq!(locks.shard_index("dev-1"), locks.shard_index("dev-1"));
        assert!(locks.shard_index("dev-2") < 64);
    }

    #[test]
    fn test_zero_shards_is_one() {
        assert_eq!(DeviceLocks::new(0).shard_count(), 1);
    }

    #[tokio::test]
    async fn test_same_device_is_serialized() {
        let locks = Arc::new(DeviceLocks::new(8));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let locks = Arc::clone(&locks);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let _guard = locks.lock("dev-1").await;
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
