//! Configuration for minipd
//!
//! Startup settings for the server plus the runtime-mutable scheduling and
//! replication options that the config store keeps versioned in the
//! metadata store.

use crate::common::{Error, Result, Version};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Human readable member name, unique inside the cluster
    pub name: String,

    /// Data directory (local region mirror lives under it)
    pub data_dir: PathBuf,

    /// Bind address for the HTTP ping/status surface
    pub bind_addr: String,

    /// URLs advertised to clients (comma separated)
    pub advertise_client_urls: String,

    /// URLs advertised to peers (comma separated)
    pub advertise_peer_urls: String,

    /// Leadership lease in seconds
    pub lease: u64,

    /// Per-request timeout against the metadata store
    pub store_timeout_ms: u64,

    /// Number of IDs reserved per allocator round-trip
    pub id_alloc_step: u64,

    /// How often the store-leader priority loop runs
    pub leader_priority_check_interval_ms: u64,

    /// How often store state metrics are collected
    pub metrics_interval_ms: u64,

    /// Namespace classifier name
    pub namespace_classifier: String,

    /// Backend for the local region mirror
    pub region_storage: RegionStorageBackend,

    /// Logging level
    pub log_level: String,

    pub security: SecurityConfig,

    pub schedule: ScheduleConfig,

    pub replication: ReplicationConfig,

    pub namespace: BTreeMap<String, NamespaceConfig>,

    pub label_property: LabelPropertyConfig,

    pub cluster_version: Version,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "pd".to_string(),
            data_dir: PathBuf::from("./pd-data"),
            bind_addr: "127.0.0.1:2379".to_string(),
            advertise_client_urls: "http://127.0.0.1:2379".to_string(),
            advertise_peer_urls: "http://127.0.0.1:2380".to_string(),
            lease: 3,
            store_timeout_ms: 3_000,
            id_alloc_step: 1_000,
            leader_priority_check_interval_ms: 60_000,
            metrics_interval_ms: 60_000,
            namespace_classifier: "default".to_string(),
            region_storage: RegionStorageBackend::RocksDb,
            log_level: "info".to_string(),
            security: SecurityConfig::default(),
            schedule: ScheduleConfig::default(),
            replication: ReplicationConfig::default(),
            namespace: BTreeMap::new(),
            label_property: LabelPropertyConfig::default(),
            cluster_version: Version::default(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then `MINIPD_*` environment variables.
    /// Nested keys use `__`, e.g. `MINIPD_SCHEDULE__MAX_SNAPSHOT_COUNT`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MINIPD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::InvalidConfig("name cannot be empty".into()));
        }
        if self.lease == 0 {
            return Err(Error::InvalidConfig("lease must be at least 1 second".into()));
        }
        if self.id_alloc_step == 0 {
            return Err(Error::InvalidConfig("id-alloc-step must be positive".into()));
        }
        if self.client_urls().is_empty() {
            return Err(Error::InvalidConfig(
                "advertise-client-urls cannot be empty".into(),
            ));
        }
        self.schedule
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        self.replication
            .validate()
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        Ok(())
    }

    pub fn client_urls(&self) -> Vec<String> {
        split_urls(&self.advertise_client_urls)
    }

    pub fn peer_urls(&self) -> Vec<String> {
        split_urls(&self.advertise_peer_urls)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn leader_priority_check_interval(&self) -> Duration {
        Duration::from_millis(self.leader_priority_check_interval_ms)
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_millis(self.metrics_interval_ms)
    }
}

fn split_urls(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .map(|u| u.trim_end_matches('/').to_string())
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionStorageBackend {
    RocksDb,
    Memory,
}

/// TLS material paths handed to the transport layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub cacert_path: String,
    pub cert_path: String,
    pub key_path: String,
}

/// Balance and scheduling knobs consumed by the placement subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub max_snapshot_count: u64,
    pub max_pending_peer_count: u64,
    pub max_merge_region_size: u64,
    pub split_merge_interval_secs: u64,
    pub patrol_region_interval_ms: u64,
    pub max_store_down_time_secs: u64,
    pub leader_schedule_limit: u64,
    pub region_schedule_limit: u64,
    pub replica_schedule_limit: u64,
    pub merge_schedule_limit: u64,
    pub tolerant_size_ratio: f64,
    pub low_space_ratio: f64,
    pub high_space_ratio: f64,
    pub disable_raft_learner: bool,
    pub disable_remove_down_replica: bool,
    pub disable_replace_offline_replica: bool,
    pub disable_make_up_replica: bool,
    pub disable_remove_extra_replica: bool,
    pub disable_location_replacement: bool,
    pub schedulers: Vec<SchedulerConfig>,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            max_snapshot_count: 3,
            max_pending_peer_count: 16,
            max_merge_region_size: 0,
            split_merge_interval_secs: 3_600,
            patrol_region_interval_ms: 100,
            max_store_down_time_secs: 1_800,
            leader_schedule_limit: 4,
            region_schedule_limit: 4,
            replica_schedule_limit: 8,
            merge_schedule_limit: 8,
            tolerant_size_ratio: 5.0,
            low_space_ratio: 0.8,
            high_space_ratio: 0.6,
            disable_raft_learner: false,
            disable_remove_down_replica: false,
            disable_replace_offline_replica: false,
            disable_make_up_replica: false,
            disable_remove_extra_replica: false,
            disable_location_replacement: false,
            schedulers: vec![
                SchedulerConfig::new("balance-region"),
                SchedulerConfig::new("balance-leader"),
                SchedulerConfig::new("hot-region"),
                SchedulerConfig::new("label"),
            ],
        }
    }
}

impl ScheduleConfig {
    pub fn validate(&self) -> Result<()> {
        if self.tolerant_size_ratio < 0.0 {
            return Err(Error::Validation(
                "tolerant-size-ratio should be nonnegative".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.low_space_ratio) {
            return Err(Error::Validation(
                "low-space-ratio should between 0 and 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.high_space_ratio) {
            return Err(Error::Validation(
                "high-space-ratio should between 0 and 1".into(),
            ));
        }
        if self.high_space_ratio >= self.low_space_ratio {
            return Err(Error::Validation(
                "high-space-ratio should be smaller than low-space-ratio".into(),
            ));
        }
        if let Some(s) = self.schedulers.iter().find(|s| s.kind.trim().is_empty()) {
            return Err(Error::Validation(format!(
                "scheduler with args {:?} has an empty type",
                s.args
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub disable: bool,
}

impl SchedulerConfig {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            args: Vec::new(),
            disable: false,
        }
    }
}

/// Replica count and topology labels
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub max_replicas: u64,
    pub location_labels: Vec<String>,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_replicas: 3,
            location_labels: Vec::new(),
        }
    }
}

impl ReplicationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_replicas == 0 {
            return Err(Error::Validation("max-replicas should be positive".into()));
        }
        if self.max_replicas > u64::from(u32::MAX) {
            return Err(Error::Validation(format!(
                "max-replicas {} is too large",
                self.max_replicas
            )));
        }
        for (i, label) in self.location_labels.iter().enumerate() {
            validate_label_key(label)?;
            if self.location_labels[..i].contains(label) {
                return Err(Error::Validation(format!(
                    "duplicated location label {:?}",
                    label
                )));
            }
        }
        Ok(())
    }
}

/// Per-namespace limits; zero means "inherit the global value"
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamespaceConfig {
    pub leader_schedule_limit: u64,
    pub region_schedule_limit: u64,
    pub replica_schedule_limit: u64,
    pub merge_schedule_limit: u64,
    pub max_replicas: u64,
}

impl NamespaceConfig {
    /// Replace zero fields with the global schedule/replication values.
    pub fn adjust(&mut self, schedule: &ScheduleConfig, replication: &ReplicationConfig) {
        fn fill(v: &mut u64, global: u64) {
            if *v == 0 {
                *v = global;
            }
        }
        fill(&mut self.leader_schedule_limit, schedule.leader_schedule_limit);
        fill(&mut self.region_schedule_limit, schedule.region_schedule_limit);
        fill(&mut self.replica_schedule_limit, schedule.replica_schedule_limit);
        fill(&mut self.merge_schedule_limit, schedule.merge_schedule_limit);
        fill(&mut self.max_replicas, replication.max_replicas);
    }
}

/// A `key=value` label attached to a store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreLabel {
    pub key: String,
    pub value: String,
}

/// Label properties grouped by property type (e.g. `reject-leader`)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LabelPropertyConfig(pub BTreeMap<String, Vec<StoreLabel>>);

impl LabelPropertyConfig {
    /// Returns false when the label was already present.
    pub fn insert(&mut self, typ: &str, key: &str, value: &str) -> bool {
        let labels = self.0.entry(typ.to_string()).or_default();
        if labels.iter().any(|l| l.key == key && l.value == value) {
            return false;
        }
        labels.push(StoreLabel {
            key: key.to_string(),
            value: value.to_string(),
        });
        true
    }

    /// Returns false when nothing matched.
    pub fn remove(&mut self, typ: &str, key: &str, value: &str) -> bool {
        let Some(labels) = self.0.get_mut(typ) else {
            return false;
        };
        let before = labels.len();
        labels.retain(|l| !(l.key == key && l.value == value));
        let removed = labels.len() != before;
        if labels.is_empty() {
            self.0.remove(typ);
        }
        removed
    }

    pub fn get(&self, typ: &str) -> &[StoreLabel] {
        self.0.get(typ).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Label keys: alphanumerics with `-`, `_`, `.` inside, no leading/trailing punctuation.
pub fn validate_label_key(s: &str) -> Result<()> {
    let ok = !s.is_empty()
        && s.len() <= 63
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && s.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && s.chars().last().is_some_and(|c| c.is_ascii_alphanumeric());
    if !ok {
        return Err(Error::Validation(format!("invalid label {:?}", s)));
    }
    Ok(())
}
