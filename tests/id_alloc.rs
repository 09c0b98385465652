//! ID allocation tests

mod common;

use common::{start_member, test_config};
use minipd::coordinator::id::IdAllocator;
use minipd::coordinator::keys::Keys;
use minipd::metastore::{Client, MemStore};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn allocator(store: &MemStore, step: u64) -> Arc<IdAllocator> {
    let client = Client::new(
        Arc::new(store.client("pd", vec![], vec![])),
        Duration::from_secs(1),
    );
    Arc::new(IdAllocator::new(client, &Keys::new(1), step))
}

fn assert_increasing(ids: &[u64]) {
    assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids not increasing: {:?}", ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_allocators_never_collide() {
    let store = MemStore::new();
    let allocators: Vec<_> = (0..3).map(|_| allocator(&store, 7)).collect();

    let mut handles = Vec::new();
    for alloc in &allocators {
        for _ in 0..4 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..40 {
                    ids.push(alloc.alloc().await.unwrap());
                }
                ids
            }));
        }
    }

    let mut seen = HashSet::new();
    for h in handles {
        let ids = h.await.unwrap();
        assert_increasing(&ids);
        for id in ids {
            assert!(id > 0);
            assert!(seen.insert(id), "id {} allocated twice", id);
        }
    }
    assert_eq!(seen.len(), 3 * 4 * 40);
}

#[tokio::test]
async fn test_restarts_never_reissue() {
    let store = MemStore::new();
    let mut seen = HashSet::new();
    let mut last_max = 0;

    for _ in 0..5 {
        let alloc = allocator(&store, 10);
        let mut ids = Vec::new();
        for _ in 0..13 {
            ids.push(alloc.alloc().await.unwrap());
        }
        assert_increasing(&ids);
        assert!(ids[0] > last_max);
        last_max = *ids.last().unwrap();
        for id in ids {
            assert!(seen.insert(id));
        }
    }
}

#[tokio::test]
async fn test_server_alloc_across_members() {
    let store = MemStore::new();
    let a = start_member(&store, test_config("pd-1")).await;
    let b = start_member(&store, test_config("pd-2")).await;

    let mut seen = HashSet::new();
    for _ in 0..25 {
        assert!(seen.insert(a.alloc_id().await.unwrap()));
        assert!(seen.insert(b.alloc_id().await.unwrap()));
    }

    a.close().await;
    let c = start_member(&store, test_config("pd-3")).await;
    for _ in 0..25 {
        assert!(seen.insert(c.alloc_id().await.unwrap()));
    }

    b.close().await;
    c.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
#[cfg_attr(not(feature = "heavy-tests"), ignore)]
async fn test_heavy_contention() {
    let store = MemStore::new();
    let allocators: Vec<_> = (0..8).map(|_| allocator(&store, 3)).collect();

    let mut handles = Vec::new();
    for alloc in &allocators {
        for _ in 0..8 {
            let alloc = alloc.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..200 {
                    ids.push(alloc.alloc().await.unwrap());
                }
                ids
            }));
        }
    }

    let mut seen = HashSet::new();
    for h in handles {
        for id in h.await.unwrap() {
            assert!(seen.insert(id));
        }
    }
    assert_eq!(seen.len(), 8 * 8 * 200);
}
