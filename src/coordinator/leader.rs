//! Leadership campaign and maintenance
//!
//! One leader key per cluster holds the serialized descriptor of the elected
//! member, attached to a lease the leader keeps alive. The metadata store
//! guarantees a single holder; every guarded write in the crate carries a
//! value comparison against that key, so a stale leader cannot commit even
//! before it notices its own demotion.

use crate::common::{Error, Result, METRICS};
use crate::coordinator::cluster::ClusterLifecycle;
use crate::coordinator::keys::Keys;
use crate::coordinator::member::Member;
use crate::coordinator::state::ProcessState;
use crate::metastore::{Client, Compare, LeaseId, Op, Txn, WatchEvent, NO_LEASE};
use arc_swap::ArcSwapOption;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pause between failed loop iterations
const LOOP_BACKOFF: Duration = Duration::from_millis(200);

/// Proof of leadership captured when it was acquired. Guarded writes use
/// the token's comparison instead of re-reading shared state.
#[derive(Debug, Clone)]
pub struct LeaderToken {
    leader_key: String,
    member_value: Arc<Vec<u8>>,
    lease: LeaseId,
}

impl LeaderToken {
    pub fn compare(&self) -> Compare {
        Compare::value(self.leader_key.clone(), self.member_value.as_ref().clone())
    }

    pub fn lease(&self) -> LeaseId {
        self.lease
    }
}

pub struct Leadership {
    client: Client,
    keys: Keys,
    member: Member,
    member_value: Arc<Vec<u8>>,
    lease_ttl: Duration,
    state: Arc<ProcessState>,
    token: ArcSwapOption<LeaderToken>,
    guard_failed: Notify,
}

impl Leadership {
    pub fn new(
        client: Client,
        keys: Keys,
        member: Member,
        lease_ttl: Duration,
        state: Arc<ProcessState>,
    ) -> Result<Self> {
        let member_value = Arc::new(member.encode()?);
        Ok(Self {
            client,
            keys,
            member,
            member_value,
            lease_ttl,
            state,
            token: ArcSwapOption::empty(),
            guard_failed: Notify::new(),
        })
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn member_value(&self) -> &[u8] {
        &self.member_value
    }

    pub fn is_leader(&self) -> bool {
        self.token.load().is_some()
    }

    pub fn token(&self) -> Option<Arc<LeaderToken>> {
        self.token.load_full()
    }

    /// The leader as last observed by this node
    pub fn leader(&self) -> Option<Arc<Member>> {
        self.state.leader()
    }

    pub(crate) fn not_leader(&self, what: &str) -> Error {
        let hint = self
            .leader()
            .filter(|l| l.member_id != self.member.member_id)
            .map(|l| l.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        Error::NotLeader(format!("{}, current leader is {}", what, hint))
    }

    /// Commit `ops` only if this node still holds the leader key.
    pub async fn leader_txn(&self, what: &str, ops: Vec<Op>) -> Result<()> {
        let token = self.token().ok_or_else(|| self.not_leader(what))?;
        self.guarded_txn(&token, what, Vec::new(), ops)
            .await
            .and_then(|ok| if ok { Ok(()) } else { Err(self.not_leader(what)) })
    }

    /// Commit `ops` guarded by the token plus `compares`. Returns false when
    /// only the extra compares failed; a lost leader key is `NotLeader`.
    pub async fn guarded_txn(
        &self,
        token: &LeaderToken,
        what: &str,
        compares: Vec<Compare>,
        ops: Vec<Op>,
    ) -> Result<bool> {
        let has_extra = !compares.is_empty();
        let txn = Txn::new()
            .when(compares)
            .when([token.compare()])
            .and_then(ops);
        let resp = self.client.txn(txn).await?;
        if resp.succeeded {
            return Ok(true);
        }

        let still_leader = if has_extra {
            self.holds_key(token).await
        } else {
            false
        };
        if still_leader {
            return Ok(false);
        }
        METRICS.guarded_write_failures.inc();
        warn!("{} failed, maybe not leader", what);
        self.report_guard_failure();
        Err(self.not_leader(what))
    }

    /// Wake the keep-alive loop so it re-validates the leader key now.
    pub fn report_guard_failure(&self) {
        self.guard_failed.notify_one();
    }

    async fn holds_key(&self, token: &LeaderToken) -> bool {
        match self.client.get(&self.keys.leader()).await {
            Ok(Some(kv)) => kv.value == *token.member_value && kv.lease == token.lease,
            Ok(None) => false,
            Err(e) => {
                warn!("check leader key failed: {}", e);
                false
            }
        }
    }

    /// Delete the leader key if it still holds `value`.
    async fn delete_leader_key_if(&self, value: Vec<u8>) -> Result<()> {
        let key = self.keys.leader();
        let resp = self
            .client
            .txn(
                Txn::new()
                    .when([Compare::value(key.clone(), value)])
                    .and_then([Op::delete(key)]),
            )
            .await?;
        if !resp.succeeded {
            debug!("stale leader key already replaced");
        }
        Ok(())
    }

    /// Leader loop: watch the current leader, campaign when the key is free,
    /// serve while elected. Runs until `cancel` fires.
    pub async fn campaign_loop(
        self: Arc<Self>,
        cancel: CancellationToken,
        lifecycle: Weak<ClusterLifecycle>,
    ) {
        loop {
            if cancel.is_cancelled() {
                info!("server is closed, exit leader loop");
                return;
            }

            let kv = match self.client.get(&self.keys.leader()).await {
                Ok(kv) => kv,
                Err(e) => {
                    error!("get leader error: {}", e);
                    if !sleep_or_cancel(&cancel, LOOP_BACKOFF).await {
                        return;
                    }
                    continue;
                }
            };

            if let Some(kv) = kv {
                match Member::decode(&kv.value) {
                    Ok(leader) if kv.value == *self.member_value => {
                        warn!("leader is still {}, delete and campaign again", leader);
                    }
                    Ok(leader) => {
                        info!("leader is {}, watch it", leader);
                        self.state.set_leader(Some(leader));
                        self.watch_leader(kv.mod_revision, &cancel).await;
                        self.state.set_leader(None);
                        info!("leader changed, try to campaign leader");
                        continue;
                    }
                    Err(e) => {
                        error!(
                            "leader key holds undecodable value {:?}: {}",
                            String::from_utf8_lossy(&kv.value),
                            e
                        );
                        if kv.lease != NO_LEASE {
                            // Leased, so it goes away when the lease expires
                            self.watch_leader(kv.mod_revision, &cancel).await;
                            continue;
                        }
                    }
                }
                if let Err(e) = self.delete_leader_key_if(kv.value).await {
                    error!("delete leader key error: {}", e);
                    if !sleep_or_cancel(&cancel, LOOP_BACKOFF).await {
                        return;
                    }
                    continue;
                }
            }

            match self.campaign(&cancel, &lifecycle).await {
                Ok(true) => {}
                Ok(false) => debug!("campaign leader failed, other server may campaign ok"),
                Err(e) => {
                    error!("campaign leader error: {}", e);
                    if !sleep_or_cancel(&cancel, LOOP_BACKOFF).await {
                        return;
                    }
                }
            }
        }
    }

    /// Block until the observed leader key is deleted or replaced by a
    /// different holder.
    async fn watch_leader(&self, revision: i64, cancel: &CancellationToken) {
        let key = self.keys.leader();
        let mut watcher = match self.client.watch(&key, revision + 1).await {
            Ok(w) => w,
            Err(e) => {
                error!("watch leader error: {}", e);
                sleep_or_cancel(cancel, LOOP_BACKOFF).await;
                return;
            }
        };

        // Expired leases are only noticed by the store on access, so poll too.
        let mut recheck = tokio::time::interval((self.lease_ttl / 2).max(Duration::from_millis(50)));
        recheck.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        recheck.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = watcher.next() => match event {
                    Some(WatchEvent::Delete { .. }) => {
                        info!("leader key is deleted");
                        return;
                    }
                    Some(WatchEvent::Put(kv)) => match Member::decode(&kv.value) {
                        Ok(leader) => {
                            info!("leader changed to {}", leader);
                            self.state.set_leader(Some(leader));
                        }
                        Err(e) => warn!("undecodable leader value: {}", e),
                    },
                    None => {
                        warn!("leader watch channel is closed");
                        sleep_or_cancel(cancel, LOOP_BACKOFF).await;
                        return;
                    }
                },
                _ = recheck.tick() => match self.client.get(&key).await {
                    Ok(None) => {
                        info!("leader key is gone");
                        return;
                    }
                    Ok(Some(_)) => {}
                    Err(e) => {
                        warn!("recheck leader error: {}", e);
                        return;
                    }
                },
            }
        }
    }

    /// Try to take the leader key. Returns Ok(false) if another member won.
    /// On success, serves as leader until leadership is lost.
    async fn campaign(
        &self,
        cancel: &CancellationToken,
        lifecycle: &Weak<ClusterLifecycle>,
    ) -> Result<bool> {
        let lease = self.client.grant_lease(self.lease_ttl).await?;
        let key = self.keys.leader();
        let txn = Txn::new()
            .when([Compare::absent(key.clone())])
            .and_then([Op::put_with_lease(
                key.clone(),
                self.member_value.as_ref().clone(),
                lease,
            )]);

        let resp = match self.client.txn(txn).await {
            Ok(resp) => resp,
            Err(e) => {
                self.revoke_quietly(lease).await;
                return Err(e);
            }
        };
        if !resp.succeeded {
            self.revoke_quietly(lease).await;
            return Ok(false);
        }

        let token = Arc::new(LeaderToken {
            leader_key: key,
            member_value: self.member_value.clone(),
            lease,
        });
        self.token.store(Some(token.clone()));
        self.state.set_leader(Some(self.member.clone()));
        METRICS.is_leader.set(1);
        METRICS.leader_changes.inc();
        info!("{} campaigned leader ok with lease {}", self.member, lease);

        if let Some(cluster) = lifecycle.upgrade() {
            match cluster.start().await {
                Ok(_) => {}
                Err(Error::NotBootstrapped(id)) => {
                    info!("cluster {} is not bootstrapped yet, serving without it", id)
                }
                Err(e) => {
                    error!("start cluster failed, resign leadership: {}", e);
                    self.step_down(&token, lifecycle).await;
                    return Err(e);
                }
            }
        }

        info!("{} is ready to serve as leader", self.member);
        let res = self.keep_leadership(&token, cancel).await;
        self.step_down(&token, lifecycle).await;
        res.map(|_| true)
    }

    async fn keep_leadership(&self, token: &LeaderToken, cancel: &CancellationToken) -> Result<()> {
        let mut ticker = tokio::time::interval((self.lease_ttl / 3).max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("server is closed, resign leadership");
                    return Ok(());
                }
                _ = self.guard_failed.notified() => {
                    if !self.holds_key(token).await {
                        warn!("guarded write rejected and leader key is no longer ours");
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.client.keep_alive(token.lease).await {
                        warn!("keep alive lease {} failed: {}", token.lease, e);
                        return Err(e);
                    }
                    if !self.holds_key(token).await {
                        info!("leader key changed, step down");
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn step_down(&self, token: &LeaderToken, lifecycle: &Weak<ClusterLifecycle>) {
        self.token.store(None);
        self.state.set_leader(None);
        METRICS.is_leader.set(0);
        METRICS.leader_changes.inc();
        if let Some(cluster) = lifecycle.upgrade() {
            if let Err(e) = cluster.stop().await {
                warn!("stop cluster error: {}", e);
            }
        }
        self.revoke_quietly(token.lease).await;
        info!("{} is no longer leader", self.member);
    }

    async fn revoke_quietly(&self, lease: LeaseId) {
        if let Err(e) = self.client.revoke_lease(lease).await {
            debug!("revoke lease {}: {}", lease, e);
        }
    }

    /// Give up leadership voluntarily by deleting our leader key.
    pub async fn resign(&self) -> Result<()> {
        self.leader_txn("resign leader", vec![Op::delete(self.keys.leader())])
            .await?;
        self.report_guard_failure();
        Ok(())
    }

    // === Leader priority ===

    pub async fn get_member_leader_priority(&self, member_id: u64) -> Result<i32> {
        let key = self.keys.member_leader_priority(member_id);
        match self.client.get_value(&key).await? {
            None => Ok(0),
            Some(v) => std::str::from_utf8(&v)
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .ok_or_else(|| Error::MetadataCorrupted(format!("leader priority at {}", key))),
        }
    }

    pub async fn set_member_leader_priority(&self, member_id: u64, priority: i32) -> Result<()> {
        let key = self.keys.member_leader_priority(member_id);
        self.leader_txn(
            "save leader priority",
            vec![Op::put(key, priority.to_string().into_bytes())],
        )
        .await
    }

    pub async fn delete_member_leader_priority(&self, member_id: u64) -> Result<()> {
        let key = self.keys.member_leader_priority(member_id);
        self.leader_txn("delete leader priority", vec![Op::delete(key)])
            .await
    }

    /// Move the store's own leadership here when our priority beats the
    /// current store leader's.
    pub async fn check_store_leader_priority(&self) -> Result<()> {
        let my_id = self.client.local_member_id();
        let status = self.client.status().await?;
        if status.leader == my_id || status.leader == 0 {
            return Ok(());
        }
        let my_priority = self.get_member_leader_priority(my_id).await?;
        let leader_priority = self.get_member_leader_priority(status.leader).await?;
        if my_priority > leader_priority {
            info!(
                "transfer store leadership from {} (priority {}) to {} (priority {})",
                status.leader, leader_priority, my_id, my_priority
            );
            self.client.move_leader(my_id).await?;
        }
        Ok(())
    }
}

/// Returns false if cancelled while sleeping.
pub(crate) async fn sleep_or_cancel(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}
