//! Versioned runtime configuration
//!
//! Each config kind is an immutable snapshot behind an `ArcSwap`; readers
//! never block. Setters validate first, capture the leader token, swap the
//! snapshot, then persist the whole aggregate as one JSON document under
//! `<root>/config` guarded by that token.
//!
//! A write without leadership leaves every snapshot untouched, including
//! one whose guarded commit loses to a new leader. A store failure leaves
//! the new value visible locally and `Error::Persist` tells the caller to
//! retry.

use crate::common::{
    Config, Error, LabelPropertyConfig, NamespaceConfig, ReplicationConfig, Result,
    ScheduleConfig, Version, METRICS,
};
use crate::coordinator::leader::LeaderToken;
use crate::coordinator::storage::Storage;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Everything persisted under the config key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigAggregate {
    pub schedule: ScheduleConfig,
    pub replication: ReplicationConfig,
    pub namespace: BTreeMap<String, NamespaceConfig>,
    pub label_property: LabelPropertyConfig,
    pub cluster_version: Version,
}

pub struct ConfigStore {
    storage: Arc<Storage>,
    schedule: ArcSwap<ScheduleConfig>,
    replication: ArcSwap<ReplicationConfig>,
    namespace: ArcSwap<BTreeMap<String, NamespaceConfig>>,
    label_property: ArcSwap<LabelPropertyConfig>,
    cluster_version: ArcSwap<Version>,
    /// Serializes writers so every persist carries all applied changes
    write_lock: Mutex<()>,
}

impl ConfigStore {
    /// Seed the snapshots from the startup config.
    pub fn new(storage: Arc<Storage>, cfg: &Config) -> Self {
        Self {
            storage,
            schedule: ArcSwap::from_pointee(cfg.schedule.clone()),
            replication: ArcSwap::from_pointee(cfg.replication.clone()),
            namespace: ArcSwap::from_pointee(cfg.namespace.clone()),
            label_property: ArcSwap::from_pointee(cfg.label_property.clone()),
            cluster_version: ArcSwap::from_pointee(cfg.cluster_version.clone()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn aggregate(&self) -> ConfigAggregate {
        ConfigAggregate {
            schedule: self.schedule.load().as_ref().clone(),
            replication: self.replication.load().as_ref().clone(),
            namespace: self.namespace.load().as_ref().clone(),
            label_property: self.label_property.load().as_ref().clone(),
            cluster_version: self.cluster_version.load().as_ref().clone(),
        }
    }

    /// Replace every snapshot with the persisted aggregate, if one exists.
    /// Returns whether anything was loaded.
    pub async fn reload(&self) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let Some(bytes) = self.storage.load_config().await? else {
            return Ok(false);
        };
        let agg: ConfigAggregate = serde_json::from_slice(&bytes)
            .map_err(|e| Error::MetadataCorrupted(format!("persisted config: {}", e)))?;

        self.schedule.store(Arc::new(agg.schedule));
        self.replication.store(Arc::new(agg.replication));
        self.namespace.store(Arc::new(agg.namespace));
        self.label_property.store(Arc::new(agg.label_property));
        self.cluster_version.store(Arc::new(agg.cluster_version));
        info!("load config from metadata store");
        Ok(true)
    }

    fn leader_token(&self, what: &str) -> Result<Arc<LeaderToken>> {
        let leadership = self.storage.leadership();
        leadership.token().ok_or_else(|| leadership.not_leader(what))
    }

    /// Persist the aggregate after `slot` was swapped away from `old`.
    /// Losing leadership puts `old` back.
    async fn commit<T>(&self, token: &LeaderToken, slot: &ArcSwap<T>, old: Arc<T>) -> Result<()> {
        let value = serde_json::to_vec(&self.aggregate())?;
        match self.storage.save_config(token, value).await {
            Ok(()) => Ok(()),
            Err(e @ Error::NotLeader(_)) => {
                slot.store(old);
                warn!("config change dropped: {}", e);
                Err(e)
            }
            Err(e) => {
                METRICS.config_persist_failures.inc();
                warn!("persist config failed, value applied in memory only: {}", e);
                Err(Error::Persist(e.to_string()))
            }
        }
    }

    // === Schedule ===

    pub fn get_schedule(&self) -> Arc<ScheduleConfig> {
        self.schedule.load_full()
    }

    pub async fn set_schedule(&self, cfg: ScheduleConfig) -> Result<()> {
        cfg.validate()?;
        let _guard = self.write_lock.lock().await;
        let token = self.leader_token("set schedule config")?;
        let old = self.schedule.swap(Arc::new(cfg));
        info!("schedule config is updated, old {:?}", old);
        self.commit(&token, &self.schedule, old).await
    }

    // === Replication ===

    pub fn get_replication(&self) -> Arc<ReplicationConfig> {
        self.replication.load_full()
    }

    pub async fn set_replication(&self, cfg: ReplicationConfig) -> Result<()> {
        cfg.validate()?;
        let _guard = self.write_lock.lock().await;
        let token = self.leader_token("set replication config")?;
        let old = self.replication.swap(Arc::new(cfg));
        info!(
            "replication config is updated, old max-replicas {} labels {:?}",
            old.max_replicas, old.location_labels
        );
        self.commit(&token, &self.replication, old).await
    }

    // === Namespaces ===

    /// Zero value when the namespace is unknown
    pub fn get_namespace(&self, name: &str) -> NamespaceConfig {
        self.namespace.load().get(name).cloned().unwrap_or_default()
    }

    /// Namespace config with zero fields taken from the global settings
    pub fn get_namespace_with_adjust(&self, name: &str) -> NamespaceConfig {
        let mut cfg = self.get_namespace(name);
        cfg.adjust(&self.schedule.load(), &self.replication.load());
        cfg
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        self.namespace.load().contains_key(name)
    }

    pub fn namespaces(&self) -> Arc<BTreeMap<String, NamespaceConfig>> {
        self.namespace.load_full()
    }

    pub async fn set_namespace(&self, name: &str, cfg: NamespaceConfig) -> Result<()> {
        if name.is_empty() {
            return Err(Error::Validation("namespace name cannot be empty".into()));
        }
        let _guard = self.write_lock.lock().await;
        let token = self.leader_token("set namespace config")?;
        let mut map = self.namespace.load().as_ref().clone();
        match map.insert(name.to_string(), cfg.clone()) {
            Some(old) => info!(
                "namespace {} config is updated, old {:?} new {:?}",
                name, old, cfg
            ),
            None => info!("namespace {} is added, config {:?}", name, cfg),
        }
        let old = self.namespace.swap(Arc::new(map));
        self.commit(&token, &self.namespace, old).await
    }

    pub async fn delete_namespace(&self, name: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut map = self.namespace.load().as_ref().clone();
        if map.remove(name).is_none() {
            return Ok(());
        }
        let token = self.leader_token("delete namespace config")?;
        let old = self.namespace.swap(Arc::new(map));
        info!("namespace {} is deleted", name);
        self.commit(&token, &self.namespace, old).await
    }

    // === Label properties ===

    pub fn get_label_property(&self) -> Arc<LabelPropertyConfig> {
        self.label_property.load_full()
    }

    pub async fn set_label_property(&self, typ: &str, key: &str, value: &str) -> Result<()> {
        check_label_property(typ, key, value)?;
        let _guard = self.write_lock.lock().await;
        let mut cfg = self.label_property.load().as_ref().clone();
        if !cfg.insert(typ, key, value) {
            return Ok(());
        }
        let token = self.leader_token("set label property")?;
        let old = self.label_property.swap(Arc::new(cfg));
        info!("label property {} added {}={}", typ, key, value);
        self.commit(&token, &self.label_property, old).await
    }

    pub async fn delete_label_property(&self, typ: &str, key: &str, value: &str) -> Result<()> {
        check_label_property(typ, key, value)?;
        let _guard = self.write_lock.lock().await;
        let mut cfg = self.label_property.load().as_ref().clone();
        if !cfg.remove(typ, key, value) {
            return Ok(());
        }
        let token = self.leader_token("delete label property")?;
        let old = self.label_property.swap(Arc::new(cfg));
        info!("label property {} removed {}={}", typ, key, value);
        self.commit(&token, &self.label_property, old).await
    }

    // === Cluster version ===

    pub fn get_cluster_version(&self) -> Arc<Version> {
        self.cluster_version.load_full()
    }

    pub async fn set_cluster_version(&self, version: &str) -> Result<()> {
        let v = Version::parse(version)?;
        let _guard = self.write_lock.lock().await;
        let token = self.leader_token("set cluster version")?;
        let old = self.cluster_version.swap(Arc::new(v.clone()));
        info!("cluster version changed from {} to {}", old, v);
        self.commit(&token, &self.cluster_version, old).await
    }
}

fn check_label_property(typ: &str, key: &str, value: &str) -> Result<()> {
    if typ.is_empty() || key.is_empty() || value.is_empty() {
        return Err(Error::Validation(format!(
            "invalid label property {:?} {:?}={:?}",
            typ, key, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::keys::Keys;
    use crate::coordinator::leader::Leadership;
    use crate::coordinator::member::Member;
    use crate::coordinator::metadata::RegionStore;
    use crate::coordinator::state::ProcessState;
    use crate::metastore::{Client, MemStore};
    use std::time::Duration;

    fn config_store(store: &MemStore) -> ConfigStore {
        let client = Client::new(
            Arc::new(store.client("pd", vec![], vec![])),
            Duration::from_secs(1),
        );
        let keys = Keys::new(7);
        let cfg = Config::default();
        let leadership = Arc::new(
            Leadership::new(
                client.clone(),
                keys.clone(),
                Member::from_config(1, &cfg),
                Duration::from_secs(3),
                Arc::new(ProcessState::new()),
            )
            .unwrap(),
        );
        let storage = Arc::new(Storage::new(client, keys, leadership, RegionStore::memory()));
        ConfigStore::new(storage, &cfg)
    }

    #[tokio::test]
    async fn test_validation_before_mutation() {
        let store = MemStore::new();
        let cs = config_store(&store);
        let mut bad = ScheduleConfig::default();
        bad.low_space_ratio = 2.0;
        assert!(matches!(cs.set_schedule(bad).await, Err(Error::Validation(_))));
        assert_eq!(*cs.get_schedule(), ScheduleConfig::default());

        assert!(cs.set_cluster_version("not-a-version").await.is_err());
        assert!(cs.set_namespace("", NamespaceConfig::default()).await.is_err());
        assert!(cs.set_label_property("", "zone", "z1").await.is_err());
    }

    #[tokio::test]
    async fn test_set_without_leadership_changes_nothing() {
        let store = MemStore::new();
        let cs = config_store(&store);
        let version = cs.get_cluster_version();
        let mut cfg = ScheduleConfig::default();
        cfg.leader_schedule_limit = 64;
        assert!(matches!(
            cs.set_schedule(cfg).await,
            Err(Error::NotLeader(_))
        ));
        assert_eq!(*cs.get_schedule(), ScheduleConfig::default());

        assert!(matches!(
            cs.set_namespace("ns1", NamespaceConfig::default()).await,
            Err(Error::NotLeader(_))
        ));
        assert!(!cs.namespace_exists("ns1"));
        assert!(matches!(
            cs.set_label_property("reject-leader", "zone", "z1").await,
            Err(Error::NotLeader(_))
        ));
        assert!(cs.get_label_property().0.is_empty());
        assert!(matches!(
            cs.set_cluster_version("9.0.0").await,
            Err(Error::NotLeader(_))
        ));
        assert_eq!(cs.get_cluster_version(), version);
        assert!(store.dump("/pd/7/config").is_none());
    }

    #[tokio::test]
    async fn test_delete_unknown_namespace_is_noop() {
        let store = MemStore::new();
        let cs = config_store(&store);
        cs.delete_namespace("missing").await.unwrap();
        assert_eq!(cs.get_namespace("missing"), NamespaceConfig::default());
        assert!(!cs.reload().await.unwrap());
    }
}
