//! Cluster metadata persistence
//!
//! Reads of cluster records go straight to the metadata store. Config
//! writes are leader-guarded. Regions are also mirrored into the local
//! [`RegionStore`].

use crate::common::{bytes_to_uint64, Result};
use crate::coordinator::keys::Keys;
use crate::coordinator::leader::{LeaderToken, Leadership};
use crate::coordinator::metadata::{decode, ClusterMeta, RegionMeta, RegionStore, StoreMeta};
use crate::metastore::{Client, Op};
use std::sync::Arc;

pub struct Storage {
    client: Client,
    keys: Keys,
    leadership: Arc<Leadership>,
    regions: RegionStore,
}

impl Storage {
    pub fn new(client: Client, keys: Keys, leadership: Arc<Leadership>, regions: RegionStore) -> Self {
        Self {
            client,
            keys,
            leadership,
            regions,
        }
    }

    pub fn keys(&self) -> &Keys {
        &self.keys
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn leadership(&self) -> &Arc<Leadership> {
        &self.leadership
    }

    pub fn regions(&self) -> &RegionStore {
        &self.regions
    }

    /// Cluster meta; `None` until the cluster is bootstrapped.
    pub async fn load_cluster_meta(&self) -> Result<Option<ClusterMeta>> {
        self.load(&self.keys.cluster_root()).await
    }

    /// Bootstrap time in unix nanoseconds
    pub async fn load_bootstrap_time(&self) -> Result<Option<u64>> {
        match self.client.get_value(&self.keys.bootstrap_time()).await? {
            Some(bytes) => Ok(Some(bytes_to_uint64(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn load_store(&self, store_id: u64) -> Result<Option<StoreMeta>> {
        self.load(&self.keys.store(store_id)).await
    }

    pub async fn load_region(&self, region_id: u64) -> Result<Option<RegionMeta>> {
        self.load(&self.keys.region(region_id)).await
    }

    async fn load<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.client.get_value(key).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Raw persisted config aggregate
    pub async fn load_config(&self) -> Result<Option<Vec<u8>>> {
        self.client.get_value(&self.keys.config()).await
    }

    /// Persist the config aggregate under the leadership held by `token`.
    pub async fn save_config(&self, token: &LeaderToken, value: Vec<u8>) -> Result<()> {
        let what = "save config";
        let ops = vec![Op::put(self.keys.config(), value)];
        if self.leadership.guarded_txn(token, what, Vec::new(), ops).await? {
            Ok(())
        } else {
            Err(self.leadership.not_leader(what))
        }
    }

    pub fn save_region_local(&self, region: &RegionMeta) -> Result<()> {
        self.regions.save_region(region)
    }

    pub fn load_region_local(&self, region_id: u64) -> Result<Option<RegionMeta>> {
        self.regions.load_region(region_id)
    }

    pub fn flush(&self) -> Result<()> {
        self.regions.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.regions.close()
    }
}
