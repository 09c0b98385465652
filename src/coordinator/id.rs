//! Cluster-wide unique ID allocation
//!
//! IDs are handed out from an in-memory window `(base, end]`. When the
//! window is exhausted a new one is reserved by advancing the persisted
//! high-water mark with a compare-and-swap, so every window is disjoint
//! across nodes and restarts. IDs lost in an unused window are never
//! reissued.

use crate::common::{bytes_to_uint64, uint64_to_bytes, Error, Result, METRICS};
use crate::coordinator::keys::Keys;
use crate::metastore::{Client, Compare, Op, Txn};
use rand::Rng;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
struct Window {
    base: u64,
    end: u64,
}

pub struct IdAllocator {
    client: Client,
    key: String,
    step: u64,
    window: Mutex<Window>,
}

impl IdAllocator {
    pub fn new(client: Client, keys: &Keys, step: u64) -> Self {
        Self {
            client,
            key: keys.alloc_id(),
            step: step.max(1),
            window: Mutex::new(Window::default()),
        }
    }

    /// Return a fresh id, reserving a new window when the current one is used up.
    pub async fn alloc(&self) -> Result<u64> {
        let mut window = self.window.lock().await;
        if window.base == window.end {
            let end = self.generate().await?;
            window.end = end;
            window.base = end - self.step;
        }
        window.base += 1;
        METRICS.ids_allocated.inc();
        Ok(window.base)
    }

    /// Advance the persisted high-water mark by one step and return the new
    /// value. Conflicts with concurrent allocators are retried.
    async fn generate(&self) -> Result<u64> {
        let mut attempts = 0u32;
        loop {
            let current = self.client.get_value(&self.key).await?;
            let (old, cmp) = match &current {
                None => (0, Compare::absent(self.key.clone())),
                Some(bytes) => (
                    bytes_to_uint64(bytes)?,
                    Compare::value(self.key.clone(), bytes.clone()),
                ),
            };
            let end = old.checked_add(self.step).ok_or_else(|| {
                Error::Internal(format!("id space exhausted at {}", old))
            })?;

            let txn = Txn::new()
                .when([cmp])
                .and_then([Op::put(self.key.clone(), uint64_to_bytes(end))]);
            if self.client.txn(txn).await?.succeeded {
                METRICS.id_batches.inc();
                info!("idAllocator allocates a new id window, end {}", end);
                return Ok(end);
            }

            attempts += 1;
            if attempts % 16 == 0 {
                warn!("id allocation still contended after {} attempts", attempts);
            } else {
                debug!("id allocation conflict, retry");
            }
            let jitter = rand::thread_rng().gen_range(1..=10);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metastore::MemStore;
    use std::sync::Arc;

    fn allocator(store: &MemStore, step: u64) -> IdAllocator {
        let client = Client::new(
            Arc::new(store.client("pd", vec![], vec![])),
            Duration::from_secs(1),
        );
        IdAllocator::new(client, &Keys::new(1), step)
    }

    #[tokio::test]
    async fn test_alloc_sequential_window() {
        let store = MemStore::new();
        let alloc = allocator(&store, 5);
        let ids: Vec<u64> = {
            let mut v = Vec::new();
            for _ in 0..7 {
                v.push(alloc.alloc().await.unwrap());
            }
            v
        };
        assert_eq!(ids, vec![1, 2, 3, 4, 5, 6, 7]);
        let stored = store.dump("/pd/1/alloc_id").unwrap();
        assert_eq!(bytes_to_uint64(&stored.value).unwrap(), 10);
    }

    #[tokio::test]
    async fn test_restart_skips_unused_window() {
        let store = MemStore::new();
        let first = allocator(&store, 100);
        assert_eq!(first.alloc().await.unwrap(), 1);

        let second = allocator(&store, 100);
        assert_eq!(second.alloc().await.unwrap(), 101);
    }

    #[tokio::test]
    async fn test_store_unavailable() {
        let store = MemStore::new();
        let alloc = allocator(&store, 10);
        store.set_available(false);
        assert!(matches!(
            alloc.alloc().await,
            Err(Error::StoreUnavailable(_))
        ));
        store.set_available(true);
        assert_eq!(alloc.alloc().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_counter() {
        let store = MemStore::new();
        store.put_raw("/pd/1/alloc_id", b"abc");
        let alloc = allocator(&store, 10);
        assert!(matches!(
            alloc.alloc().await,
            Err(Error::MetadataCorrupted(_))
        ));
    }
}
