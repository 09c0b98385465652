//! Metadata store abstraction
//!
//! The control plane only needs a narrow contract from its backing store:
//! linearizable reads, atomic conditional multi-key writes, leases that
//! delete their keys on expiry, and per-key watches. Anything offering those
//! (etcd, an embedded store, a test double) can sit behind [`MetadataStore`].
//!
//! [`Client`] is the handle every component shares. It bounds each call with
//! the configured request timeout and logs slow transactions.

pub mod memory;

use crate::common::{Error, Result, METRICS};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

pub use memory::{MemClient, MemStore};

pub type LeaseId = i64;

/// Lease id meaning "no lease attached"
pub const NO_LEASE: LeaseId = 0;

const SLOW_TXN_THRESHOLD: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created; 0 means it does not exist
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: LeaseId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareTarget {
    Value(Vec<u8>),
    CreateRevision(i64),
    ModRevision(i64),
}

/// Equality predicate on one key, evaluated atomically inside a [`Txn`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Compare {
    pub key: String,
    pub target: CompareTarget,
}

impl Compare {
    pub fn value(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::Value(value.into()),
        }
    }

    pub fn create_revision(key: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::CreateRevision(revision),
        }
    }

    pub fn mod_revision(key: impl Into<String>, revision: i64) -> Self {
        Self {
            key: key.into(),
            target: CompareTarget::ModRevision(revision),
        }
    }

    /// The key has never been written (or was deleted).
    pub fn absent(key: impl Into<String>) -> Self {
        Self::create_revision(key, 0)
    }

    /// Value comparisons against a missing key never hold.
    pub fn matches(&self, kv: Option<&KeyValue>) -> bool {
        match &self.target {
            CompareTarget::Value(v) => kv.is_some_and(|kv| &kv.value == v),
            CompareTarget::CreateRevision(r) => kv.map_or(0, |kv| kv.create_revision) == *r,
            CompareTarget::ModRevision(r) => kv.map_or(0, |kv| kv.mod_revision) == *r,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put {
        key: String,
        value: Vec<u8>,
        lease: LeaseId,
    },
    Delete {
        key: String,
    },
}

impl Op {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            lease: NO_LEASE,
        }
    }

    pub fn put_with_lease(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: LeaseId) -> Self {
        Op::Put {
            key: key.into(),
            value: value.into(),
            lease,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Op::Delete { key: key.into() }
    }

    pub fn key(&self) -> &str {
        match self {
            Op::Put { key, .. } | Op::Delete { key } => key,
        }
    }
}

/// Atomic conditional multi-key write: if every compare holds, apply
/// `then`, otherwise apply `otherwise`.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub then: Vec<Op>,
    pub otherwise: Vec<Op>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.then.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = Op>) -> Self {
        self.otherwise.extend(ops);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    /// Store revision after the transaction
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Put(KeyValue),
    Delete { key: String, mod_revision: i64 },
}

/// Event stream for one key; ends when the store or client closes.
pub struct Watcher {
    rx: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watcher {
    pub fn new(rx: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { rx }
    }

    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.rx.recv().await
    }
}

/// A member of the metadata store's own replication group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMember {
    pub id: u64,
    pub name: String,
    pub peer_urls: Vec<String>,
    pub client_urls: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStatus {
    pub term: u64,
    pub applied_index: u64,
    pub committed_index: u64,
    pub leader: u64,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Refresh a lease; `Error::LeaseExpired` once it is gone.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Watch one key for changes made at or after `start_revision`.
    async fn watch(&self, key: &str, start_revision: i64) -> Result<Watcher>;

    /// This node's id inside the store's replication group
    fn local_member_id(&self) -> u64;

    async fn members(&self) -> Result<Vec<StoreMember>>;

    /// Hand the store's own raft leadership to `target`.
    async fn move_leader(&self, target: u64) -> Result<()>;

    async fn status(&self) -> Result<StoreStatus>;

    fn endpoints(&self) -> Vec<String>;

    async fn close(&self) -> Result<()>;
}

/// Shared, timeout-bounded handle to the metadata store
#[derive(Clone)]
pub struct Client {
    inner: Arc<dyn MetadataStore>,
    timeout: Duration,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoints", &self.inner.endpoints())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Client {
    pub fn new(inner: Arc<dyn MetadataStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &Arc<dyn MetadataStore> {
        &self.inner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(
        &self,
        op: &str,
        fut: impl std::future::Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::store(op, format!("timed out after {:?}", self.timeout))),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.bounded("get", self.inner.get(key)).await
    }

    pub async fn get_value(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get(key).await?.map(|kv| kv.value))
    }

    /// Commit a transaction, logging it when it runs too slow.
    pub async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let start = Instant::now();
        let summary = if tracing::enabled!(tracing::Level::WARN) {
            Some(format!(
                "compares={:?} then={:?}",
                txn.compares.iter().map(|c| c.key.as_str()).collect::<Vec<_>>(),
                txn.then.iter().map(Op::key).collect::<Vec<_>>()
            ))
        } else {
            None
        };

        let res = self.bounded("txn", self.inner.txn(txn)).await;

        let elapsed = start.elapsed();
        METRICS.record_txn(elapsed);
        if elapsed > SLOW_TXN_THRESHOLD {
            METRICS.slow_txns.inc();
            tracing::warn!(
                "txn runs too slow, elapsed {:?}, ok {}, {}",
                elapsed,
                res.is_ok(),
                summary.unwrap_or_default()
            );
        }
        res
    }

    pub async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.bounded("grant lease", self.inner.grant_lease(ttl)).await
    }

    pub async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        self.bounded("keep alive", self.inner.keep_alive(lease)).await
    }

    pub async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.bounded("revoke lease", self.inner.revoke_lease(lease)).await
    }

    pub async fn watch(&self, key: &str, start_revision: i64) -> Result<Watcher> {
        self.bounded("watch", self.inner.watch(key, start_revision)).await
    }

    pub fn local_member_id(&self) -> u64 {
        self.inner.local_member_id()
    }

    pub async fn members(&self) -> Result<Vec<StoreMember>> {
        self.bounded("list members", self.inner.members()).await
    }

    pub async fn move_leader(&self, target: u64) -> Result<()> {
        self.bounded("move leader", self.inner.move_leader(target)).await
    }

    pub async fn status(&self) -> Result<StoreStatus> {
        self.bounded("status", self.inner.status()).await
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.inner.endpoints()
    }

    pub async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
