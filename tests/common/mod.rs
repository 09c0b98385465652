//! Shared helpers for integration tests
#![allow(dead_code)]

use minipd::common::RegionStorageBackend;
use minipd::metastore::MemStore;
use minipd::{Config, Server};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

pub fn test_config(name: &str) -> Config {
    Config {
        name: name.to_string(),
        advertise_client_urls: format!("http://{}.invalid:2379", name),
        advertise_peer_urls: format!("http://{}.invalid:2380", name),
        lease: 1,
        store_timeout_ms: 1_000,
        id_alloc_step: 10,
        leader_priority_check_interval_ms: 100,
        metrics_interval_ms: 100,
        region_storage: RegionStorageBackend::Memory,
        ..Default::default()
    }
}

/// Join a member to `store` and start serving.
pub async fn start_member(store: &MemStore, cfg: Config) -> Arc<Server> {
    let client = store.client(&cfg.name, cfg.client_urls(), cfg.peer_urls());
    let server = Server::attach(cfg, Arc::new(client)).await.unwrap();
    server.run().await.unwrap();
    server
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait for exactly one leader among `servers` and return its index.
pub async fn wait_leader(servers: &[Arc<Server>]) -> usize {
    let ok = wait_until(Duration::from_secs(10), || async move {
        servers.iter().filter(|s| s.is_leader()).count() == 1
    })
    .await;
    assert!(ok, "no single leader elected");
    servers
        .iter()
        .position(|s| s.is_leader())
        .expect("leader vanished")
}
