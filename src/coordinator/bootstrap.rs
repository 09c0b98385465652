//! One-time cluster bootstrap
//!
//! The first storage node registers itself and the initial region. All
//! bootstrap records are written in one transaction that only succeeds
//! while the cluster root key has never been created, so at most one
//! request wins no matter how many race.

use crate::common::{timestamp_now_nanos, uint64_to_bytes, Error, Result, METRICS};
use crate::coordinator::cluster::{ClusterLifecycle, LifecycleEvent};
use crate::coordinator::config_store::ConfigStore;
use crate::coordinator::metadata::{encode, ClusterMeta, RegionMeta, StoreMeta};
use crate::coordinator::storage::Storage;
use crate::metastore::{Compare, Op};
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapRequest {
    /// Cluster id from the request header
    pub cluster_id: u64,
    pub store: Option<StoreMeta>,
    pub region: Option<RegionMeta>,
}

/// Reject malformed requests before anything is written.
pub fn check_bootstrap_request(cluster_id: u64, req: &BootstrapRequest) -> Result<()> {
    if req.cluster_id != cluster_id {
        return Err(Error::Validation(format!(
            "mismatch cluster id, need {} but got {}",
            cluster_id, req.cluster_id
        )));
    }

    let store = req
        .store
        .as_ref()
        .ok_or_else(|| Error::Validation("missing store meta for bootstrap".into()))?;
    if store.id == 0 {
        return Err(Error::Validation("invalid zero store id".into()));
    }
    if store.address.is_empty() {
        return Err(Error::Validation(format!("store {} has empty address", store.id)));
    }

    let region = req
        .region
        .as_ref()
        .ok_or_else(|| Error::Validation("missing region meta for bootstrap".into()))?;
    if region.id == 0 {
        return Err(Error::Validation("invalid zero region id".into()));
    }
    if !region.start_key.is_empty() || !region.end_key.is_empty() {
        return Err(Error::Validation(format!(
            "invalid first region key range, must all be empty for bootstrapping {:?}",
            region
        )));
    }
    if region.peers.len() != 1 {
        return Err(Error::Validation(format!(
            "invalid first region peer count {}, must be 1 for bootstrapping",
            region.peers.len()
        )));
    }
    let peer = region.peers[0];
    if peer.id == 0 {
        return Err(Error::Validation("invalid zero peer id".into()));
    }
    if peer.store_id != store.id {
        return Err(Error::Validation(format!(
            "invalid peer store id {} != {} for bootstrapping",
            peer.store_id, store.id
        )));
    }
    Ok(())
}

pub struct Bootstrapper {
    cluster_id: u64,
    storage: Arc<Storage>,
    config: Arc<ConfigStore>,
    lifecycle: Arc<ClusterLifecycle>,
}

impl Bootstrapper {
    pub fn new(
        cluster_id: u64,
        storage: Arc<Storage>,
        config: Arc<ConfigStore>,
        lifecycle: Arc<ClusterLifecycle>,
    ) -> Self {
        Self {
            cluster_id,
            storage,
            config,
            lifecycle,
        }
    }

    pub async fn bootstrap(&self, req: BootstrapRequest) -> Result<()> {
        let res = self.do_bootstrap(req).await;
        let outcome = match &res {
            Ok(()) => "ok",
            Err(Error::AlreadyBootstrapped(_)) => "already_bootstrapped",
            Err(Error::Validation(_)) => "invalid",
            Err(_) => "error",
        };
        METRICS.bootstrap.with_label(outcome).inc();
        res
    }

    async fn do_bootstrap(&self, req: BootstrapRequest) -> Result<()> {
        check_bootstrap_request(self.cluster_id, &req)?;
        let (Some(store), Some(region)) = (req.store, req.region) else {
            return Err(Error::Validation("incomplete bootstrap request".into()));
        };

        let leadership = self.storage.leadership();
        let Some(token) = leadership.token() else {
            return Err(self.already_bootstrapped_or(Error::NotLeader(format!(
                "bootstrap cluster {} must be served by the leader",
                self.cluster_id
            )))
            .await);
        };

        let max_replicas = self.config.get_replication().max_replicas;
        let max_peer_count = u32::try_from(max_replicas).map_err(|_| {
            Error::Validation(format!("max-replicas {} is too large", max_replicas))
        })?;
        let meta = ClusterMeta {
            id: self.cluster_id,
            max_peer_count,
        };
        let keys = self.storage.keys();
        let cluster_root = keys.cluster_root();
        let ops = vec![
            Op::put(cluster_root.clone(), encode(&meta)?),
            Op::put(keys.bootstrap_time(), uint64_to_bytes(timestamp_now_nanos())),
            Op::put(keys.store(store.id), encode(&store)?),
            Op::put(keys.region(region.id), encode(&region)?),
        ];

        info!(
            "try to bootstrap raft cluster {} with store {} region {}",
            self.cluster_id, store.id, region.id
        );
        let committed = match leadership
            .guarded_txn(
                &token,
                "bootstrap cluster",
                vec![Compare::absent(cluster_root)],
                ops,
            )
            .await
        {
            Ok(committed) => committed,
            Err(e @ Error::NotLeader(_)) => return Err(self.already_bootstrapped_or(e).await),
            Err(e) => return Err(e),
        };
        if !committed {
            warn!("cluster {} already bootstrapped", self.cluster_id);
            return Err(Error::AlreadyBootstrapped(self.cluster_id));
        }

        if let Err(e) = self.storage.save_region_local(&region) {
            warn!("save region {} to local storage failed: {}", region.id, e);
        }
        if let Err(e) = self.storage.flush() {
            warn!("flush local region storage failed: {}", e);
        }

        info!("bootstrap cluster {} ok", self.cluster_id);
        if let Err(e) = self.lifecycle.transition(LifecycleEvent::Bootstrapped).await {
            error!("mark cluster {} bootstrapped failed: {}", self.cluster_id, e);
            return Ok(());
        }
        if let Err(e) = self.lifecycle.start().await {
            error!("start cluster {} after bootstrap failed: {}", self.cluster_id, e);
        }
        Ok(())
    }

    /// A cluster that already exists wins over the leadership error.
    async fn already_bootstrapped_or(&self, err: Error) -> Error {
        match self.storage.load_cluster_meta().await {
            Ok(Some(_)) => Error::AlreadyBootstrapped(self.cluster_id),
            _ => err,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::metadata::{Peer, RegionEpoch};

    fn request() -> BootstrapRequest {
        BootstrapRequest {
            cluster_id: 9,
            store: Some(StoreMeta {
                id: 1,
                address: "127.0.0.1:20160".into(),
                ..Default::default()
            }),
            region: Some(RegionMeta {
                id: 2,
                start_key: vec![],
                end_key: vec![],
                region_epoch: RegionEpoch {
                    conf_ver: 1,
                    version: 1,
                },
                peers: vec![Peer {
                    id: 3,
                    store_id: 1,
                    is_learner: false,
                }],
            }),
        }
    }

    #[test]
    fn test_valid_request() {
        check_bootstrap_request(9, &request()).unwrap();
    }

    #[test]
    fn test_invalid_requests() {
        let invalid = |f: &dyn Fn(&mut BootstrapRequest)| {
            let mut req = request();
            f(&mut req);
            matches!(check_bootstrap_request(9, &req), Err(Error::Validation(_)))
        };

        assert!(invalid(&|r| r.cluster_id = 8));
        assert!(invalid(&|r| r.store = None));
        assert!(invalid(&|r| r.region = None));
        assert!(invalid(&|r| r.store.as_mut().unwrap().id = 0));
        assert!(invalid(&|r| r.store.as_mut().unwrap().address.clear()));
        assert!(invalid(&|r| r.region.as_mut().unwrap().id = 0));
        assert!(invalid(&|r| r.region.as_mut().unwrap().start_key = b"a".to_vec()));
        assert!(invalid(&|r| r.region.as_mut().unwrap().peers.clear()));
        assert!(invalid(&|r| r.region.as_mut().unwrap().peers[0].store_id = 2));
        assert!(invalid(&|r| r.region.as_mut().unwrap().peers[0].id = 0));
        assert!(invalid(&|r| {
            let peer = r.region.as_ref().unwrap().peers[0];
            r.region.as_mut().unwrap().peers.push(peer);
        }));
    }
}
