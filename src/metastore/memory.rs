//! Embedded in-process metadata store
//!
//! A single linearizable key space with revisions, leases and watches,
//! shared by any number of [`MemClient`] handles. Each client is one member
//! of the store's replication group, so several control-plane nodes can run
//! against the same `MemStore` inside one process.

use super::{
    Compare, KeyValue, LeaseId, MetadataStore, Op, StoreMember, StoreStatus, Txn, TxnResponse,
    WatchEvent, Watcher, NO_LEASE,
};
use crate::common::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

struct Lease {
    ttl: Duration,
    deadline: Instant,
    keys: HashSet<String>,
}

struct WatchSlot {
    key: String,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct Inner {
    revision: i64,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, Lease>,
    next_lease: LeaseId,
    watchers: Vec<WatchSlot>,
    members: BTreeMap<u64, StoreMember>,
    next_member: u64,
    leader: u64,
    term: u64,
}

impl Inner {
    fn notify(&mut self, event: WatchEvent) {
        let key = match &event {
            WatchEvent::Put(kv) => kv.key.as_str(),
            WatchEvent::Delete { key, .. } => key.as_str(),
        };
        let key = key.to_string();
        self.watchers
            .retain(|w| w.key != key || w.tx.send(event.clone()).is_ok());
    }

    fn delete_key(&mut self, key: &str, revision: i64) {
        if let Some(old) = self.kvs.remove(key) {
            if old.lease != NO_LEASE {
                if let Some(lease) = self.leases.get_mut(&old.lease) {
                    lease.keys.remove(key);
                }
            }
            self.notify(WatchEvent::Delete {
                key: key.to_string(),
                mod_revision: revision,
            });
        }
    }

    fn put_key(&mut self, key: &str, value: &[u8], lease: LeaseId, revision: i64) {
        let (create_revision, version, old_lease) = match self.kvs.get(key) {
            Some(old) => (old.create_revision, old.version + 1, old.lease),
            None => (revision, 1, NO_LEASE),
        };
        if old_lease != NO_LEASE && old_lease != lease {
            if let Some(l) = self.leases.get_mut(&old_lease) {
                l.keys.remove(key);
            }
        }
        if lease != NO_LEASE {
            if let Some(l) = self.leases.get_mut(&lease) {
                l.keys.insert(key.to_string());
            }
        }
        let kv = KeyValue {
            key: key.to_string(),
            value: value.to_vec(),
            create_revision,
            mod_revision: revision,
            version,
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());
        self.notify(WatchEvent::Put(kv));
    }

    fn revoke(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };
        if !lease.keys.is_empty() {
            self.revision += 1;
            let revision = self.revision;
            let mut keys: Vec<_> = lease.keys.into_iter().collect();
            keys.sort();
            for key in keys {
                self.delete_key(&key, revision);
            }
        }
        true
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, l)| l.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            tracing::debug!("lease {} expired", id);
            self.revoke(id);
        }
    }
}

struct Shared {
    state: Mutex<Inner>,
    available: AtomicBool,
    stopped: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.state.lock().unwrap_or_else(|e| e.into_inner());
        inner.expire_leases(Instant::now());
        inner
    }
}

/// The embedded store "process"
#[derive(Clone)]
pub struct MemStore {
    shared: Arc<Shared>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(Inner {
                    next_lease: 1,
                    next_member: 1,
                    ..Default::default()
                }),
                available: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Join a new member and return its client. The first member becomes
    /// the store leader.
    pub fn client(&self, name: &str, client_urls: Vec<String>, peer_urls: Vec<String>) -> MemClient {
        let mut inner = self.shared.lock();
        let id = inner.next_member;
        inner.next_member += 1;
        inner.members.insert(
            id,
            StoreMember {
                id,
                name: name.to_string(),
                peer_urls,
                client_urls,
            },
        );
        if inner.leader == 0 {
            inner.leader = id;
            inner.term = 1;
        }
        MemClient {
            shared: self.shared.clone(),
            member_id: id,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulate the store becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Stop the store; every client sees `StoreUnavailable` afterwards and
    /// open watches end.
    pub fn close(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.shared.lock();
        inner.watchers.clear();
        tracing::info!("embedded metadata store stopped");
    }

    pub fn is_closed(&self) -> bool {
        self.shared.stopped.load(Ordering::SeqCst)
    }

    pub fn revision(&self) -> i64 {
        self.shared.lock().revision
    }

    /// Raw snapshot of a key, bypassing clients (tests and diagnostics).
    pub fn dump(&self, key: &str) -> Option<KeyValue> {
        self.shared.lock().kvs.get(key).cloned()
    }

    /// Raw write bypassing clients, used to inject foreign state.
    pub fn put_raw(&self, key: &str, value: &[u8]) {
        let mut inner = self.shared.lock();
        inner.revision += 1;
        let revision = inner.revision;
        inner.put_key(key, value, NO_LEASE, revision);
    }

    /// Force a lease to expire now, as if its holder had gone silent.
    pub fn expire_lease(&self, lease: LeaseId) {
        let mut inner = self.shared.lock();
        inner.revoke(lease);
    }
}

/// One member's connection to a [`MemStore`]
#[derive(Clone)]
pub struct MemClient {
    shared: Arc<Shared>,
    member_id: u64,
    closed: Arc<AtomicBool>,
}

impl MemClient {
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("client is closed".into()));
        }
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("store is stopped".into()));
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable("store is unreachable".into()));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataStore for MemClient {
    async fn get(&self, key: &str) -> Result<Option<KeyValue>> {
        self.check()?;
        Ok(self.shared.lock().kvs.get(key).cloned())
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        self.check()?;
        let mut inner = self.shared.lock();

        let succeeded = txn
            .compares
            .iter()
            .all(|c: &Compare| c.matches(inner.kvs.get(&c.key)));
        let ops = if succeeded { &txn.then } else { &txn.otherwise };

        for op in ops {
            if let Op::Put { lease, .. } = op {
                if *lease != NO_LEASE && !inner.leases.contains_key(lease) {
                    return Err(Error::LeaseExpired(*lease));
                }
            }
        }

        if !ops.is_empty() {
            inner.revision += 1;
            let revision = inner.revision;
            for op in ops {
                match op {
                    Op::Put { key, value, lease } => inner.put_key(key, value, *lease, revision),
                    Op::Delete { key } => inner.delete_key(key, revision),
                }
            }
        }

        Ok(TxnResponse {
            succeeded,
            revision: inner.revision,
        })
    }

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId> {
        self.check()?;
        let mut inner = self.shared.lock();
        let id = inner.next_lease;
        inner.next_lease += 1;
        inner.leases.insert(
            id,
            Lease {
                ttl,
                deadline: Instant::now() + ttl,
                keys: HashSet::new(),
            },
        );
        Ok(id)
    }

    async fn keep_alive(&self, lease: LeaseId) -> Result<()> {
        self.check()?;
        let mut inner = self.shared.lock();
        match inner.leases.get_mut(&lease) {
            Some(l) => {
                l.deadline = Instant::now() + l.ttl;
                Ok(())
            }
            None => Err(Error::LeaseExpired(lease)),
        }
    }

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()> {
        self.check()?;
        if self.shared.lock().revoke(lease) {
            Ok(())
        } else {
            Err(Error::LeaseExpired(lease))
        }
    }

    async fn watch(&self, key: &str, start_revision: i64) -> Result<Watcher> {
        self.check()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.shared.lock();

        // No history is kept: replay the current state when it is newer
        // than what the caller has seen.
        match inner.kvs.get(key) {
            Some(kv) if start_revision > 0 && kv.mod_revision >= start_revision => {
                let _ = tx.send(WatchEvent::Put(kv.clone()));
            }
            None if start_revision > 0 => {
                let _ = tx.send(WatchEvent::Delete {
                    key: key.to_string(),
                    mod_revision: inner.revision,
                });
            }
            _ => {}
        }

        inner.watchers.push(WatchSlot {
            key: key.to_string(),
            tx,
        });
        Ok(Watcher::new(rx))
    }

    fn local_member_id(&self) -> u64 {
        self.member_id
    }

    async fn members(&self) -> Result<Vec<StoreMember>> {
        self.check()?;
        Ok(self.shared.lock().members.values().cloned().collect())
    }

    async fn move_leader(&self, target: u64) -> Result<()> {
        self.check()?;
        let mut inner = self.shared.lock();
        if !inner.members.contains_key(&target) {
            return Err(Error::NotFound(format!("store member {}", target)));
        }
        if inner.leader != target {
            inner.leader = target;
            inner.term += 1;
        }
        Ok(())
    }

    async fn status(&self) -> Result<StoreStatus> {
        self.check()?;
        let inner = self.shared.lock();
        Ok(StoreStatus {
            term: inner.term,
            applied_index: inner.revision as u64,
            committed_index: inner.revision as u64,
            leader: inner.leader,
        })
    }

    fn endpoints(&self) -> Vec<String> {
        self.shared
            .lock()
            .members
            .get(&self.member_id)
            .map(|m| m.client_urls.clone())
            .unwrap_or_default()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(store: &MemStore) -> MemClient {
        store.client("pd", vec!["http://127.0.0.1:2379".into()], vec![])
    }

    #[test]
    fn test_txn_create_once() {
        tokio_test::block_on(async {
            let store = MemStore::new();
            let c = client(&store);
            let txn = || {
                Txn::new()
                    .when([Compare::absent("/root")])
                    .and_then([Op::put("/root", b"a".to_vec())])
            };

            assert!(c.txn(txn()).await.unwrap().succeeded);
            assert!(!c.txn(txn()).await.unwrap().succeeded);

            let kv = c.get("/root").await.unwrap().unwrap();
            assert_eq!(kv.value, b"a");
            assert_eq!(kv.create_revision, 1);
            assert_eq!(kv.version, 1);
        });
    }

    #[test]
    fn test_revoke_lease_deletes_keys() {
        tokio_test::block_on(async {
            let store = MemStore::new();
            let c = client(&store);
            let lease = c.grant_lease(Duration::from_secs(30)).await.unwrap();
            c.txn(Txn::new().and_then([Op::put_with_lease("/leader", b"me".to_vec(), lease)]))
                .await
                .unwrap();
            let mut w = c.watch("/leader", 0).await.unwrap();

            c.revoke_lease(lease).await.unwrap();
            assert!(c.get("/leader").await.unwrap().is_none());
            assert!(matches!(w.next().await, Some(WatchEvent::Delete { .. })));
            assert!(matches!(c.keep_alive(lease).await, Err(Error::LeaseExpired(_))));
        });
    }

    #[test]
    fn test_put_with_unknown_lease_fails_whole_txn() {
        tokio_test::block_on(async {
            let store = MemStore::new();
            let c = client(&store);
            let res = c
                .txn(Txn::new().and_then([
                    Op::put("/a", b"1".to_vec()),
                    Op::put_with_lease("/b", b"2".to_vec(), 99),
                ]))
                .await;
            assert!(matches!(res, Err(Error::LeaseExpired(99))));
            assert!(c.get("/a").await.unwrap().is_none());
        });
    }

    #[test]
    fn test_unavailable_and_closed() {
        tokio_test::block_on(async {
            let store = MemStore::new();
            let c1 = client(&store);
            let c2 = client(&store);

            store.set_available(false);
            assert!(matches!(c1.get("/x").await, Err(Error::StoreUnavailable(_))));
            store.set_available(true);

            c1.close().await.unwrap();
            assert!(c1.get("/x").await.is_err());
            assert!(c2.get("/x").await.is_ok());

            store.close();
            assert!(c2.get("/x").await.is_err());
        });
    }

    #[test]
    fn test_members_and_move_leader() {
        tokio_test::block_on(async {
            let store = MemStore::new();
            let c1 = client(&store);
            let c2 = client(&store);
            assert_eq!(c1.status().await.unwrap().leader, c1.local_member_id());
            assert_eq!(c1.members().await.unwrap().len(), 2);

            c1.move_leader(c2.local_member_id()).await.unwrap();
            let status = c2.status().await.unwrap();
            assert_eq!(status.leader, c2.local_member_id());
            assert_eq!(status.term, 2);
        });
    }
}
