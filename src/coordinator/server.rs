//! Control-plane server supervisor
//!
//! Owns every component of one member, runs its background loops and
//! tears everything down exactly once.

use crate::common::{
    bytes_to_uint64, timestamp_now, uint64_to_bytes, Config, Error, LabelPropertyConfig,
    NamespaceConfig, ReplicationConfig, Result, ScheduleConfig, SecurityConfig, Version, METRICS,
};
use crate::coordinator::bootstrap::{BootstrapRequest, Bootstrapper};
use crate::coordinator::cluster::{ClusterLifecycle, ClusterService, ClusterStatus, HeartbeatStreams};
use crate::coordinator::config_store::ConfigStore;
use crate::coordinator::health::{HealthChecker, DEFAULT_PROBE_TIMEOUT};
use crate::coordinator::id::IdAllocator;
use crate::coordinator::keys::{Keys, CLUSTER_ID_PATH};
use crate::coordinator::leader::{sleep_or_cancel, Leadership};
use crate::coordinator::member::Member;
use crate::coordinator::metadata::{ClusterMeta, RegionStore};
use crate::coordinator::namespace::{create_classifier, Classifier};
use crate::coordinator::state::{ProcessState, ServingPhase};
use crate::coordinator::storage::Storage;
use crate::metastore::{Client, Compare, MemStore, MetadataStore, Op, Txn};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const TIME_MONITOR_INTERVAL: Duration = Duration::from_millis(500);

/// Applies a new log filter to the installed subscriber
pub type LogLevelHook = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;

pub struct Server {
    cfg: Config,
    state: Arc<ProcessState>,
    embedded: Option<MemStore>,
    client: Client,
    cluster_id: u64,
    keys: Keys,
    member: Member,
    id_allocator: IdAllocator,
    storage: Arc<Storage>,
    leadership: Arc<Leadership>,
    lifecycle: Arc<ClusterLifecycle>,
    bootstrapper: Bootstrapper,
    health: HealthChecker,
    heartbeats: Arc<HeartbeatStreams>,
    classifier: Box<dyn Classifier>,
    config: Arc<ConfigStore>,
    cancel: CancellationToken,
    loops: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    log_level: Mutex<String>,
    log_hook: Mutex<Option<LogLevelHook>>,
}

impl Server {
    /// Build a server backed by a fresh embedded metadata store.
    pub async fn create(cfg: Config) -> Result<Arc<Self>> {
        let store = MemStore::new();
        let client = store.client(&cfg.name, cfg.client_urls(), cfg.peer_urls());
        Self::build(cfg, Arc::new(client), Some(store)).await
    }

    /// Build a server on an already running metadata store.
    pub async fn attach(cfg: Config, store: Arc<dyn MetadataStore>) -> Result<Arc<Self>> {
        Self::build(cfg, store, None).await
    }

    async fn build(
        cfg: Config,
        store: Arc<dyn MetadataStore>,
        embedded: Option<MemStore>,
    ) -> Result<Arc<Self>> {
        cfg.validate()?;
        info!("starting pd member {}", cfg.name);
        info!("  client urls: {:?}", cfg.client_urls());
        info!("  data dir: {}", cfg.data_dir.display());

        let client = Client::new(store, cfg.store_timeout());
        let cluster_id = init_cluster_id(&client).await?;
        METRICS.cluster_id.set(cluster_id);
        let keys = Keys::new(cluster_id);
        info!("init cluster id {}, root path {}", cluster_id, keys.root());

        let member = Member::from_config(client.local_member_id(), &cfg);
        let state = Arc::new(ProcessState::new());
        let leadership = Arc::new(Leadership::new(
            client.clone(),
            keys.clone(),
            member.clone(),
            cfg.lease_ttl(),
            state.clone(),
        )?);

        let id_allocator = IdAllocator::new(client.clone(), &keys, cfg.id_alloc_step);
        let regions = RegionStore::open(cfg.region_storage, cfg.data_dir.join("region-meta"))?;
        let storage = Arc::new(Storage::new(
            client.clone(),
            keys.clone(),
            leadership.clone(),
            regions,
        ));

        let config = Arc::new(ConfigStore::new(storage.clone(), &cfg));
        config.reload().await?;

        let classifier = create_classifier(&cfg.namespace_classifier)?;
        let heartbeats = Arc::new(HeartbeatStreams::new());
        let meta = storage.load_cluster_meta().await?;
        let lifecycle = Arc::new(ClusterLifecycle::new(
            cluster_id,
            storage.clone(),
            leadership.clone(),
            config.clone(),
            vec![heartbeats.clone() as Arc<dyn ClusterService>],
            meta,
        ));
        let bootstrapper =
            Bootstrapper::new(cluster_id, storage.clone(), config.clone(), lifecycle.clone());
        let health = HealthChecker::new(DEFAULT_PROBE_TIMEOUT)?;

        let log_level = cfg.log_level.clone();
        Ok(Arc::new(Self {
            cfg,
            state,
            embedded,
            client,
            cluster_id,
            keys,
            member,
            id_allocator,
            storage,
            leadership,
            lifecycle,
            bootstrapper,
            health,
            heartbeats,
            classifier,
            config,
            cancel: CancellationToken::new(),
            loops: tokio::sync::Mutex::new(Vec::new()),
            log_level: Mutex::new(log_level),
            log_hook: Mutex::new(None),
        }))
    }

    /// Mark the server serving and spawn its background loops.
    pub async fn run(self: &Arc<Self>) -> Result<()> {
        // Held across the transition so a racing close awaits every loop
        let mut loops = self.loops.lock().await;
        if !self.state.transition(ServingPhase::Created, ServingPhase::Serving) {
            return Err(Error::Closed);
        }

        loops.push(tokio::spawn(self.leadership.clone().campaign_loop(
            self.cancel.clone(),
            Arc::downgrade(&self.lifecycle),
        )));

        let leadership = self.leadership.clone();
        loops.push(self.spawn_ticker(
            "store leader priority",
            self.cfg.leader_priority_check_interval(),
            move || {
                let leadership = leadership.clone();
                async move {
                    if !leadership.is_leader() {
                        return;
                    }
                    if let Err(e) = leadership.check_store_leader_priority().await {
                        warn!("check store leader priority failed: {}", e);
                    }
                }
            },
        ));

        let client = self.client.clone();
        loops.push(self.spawn_ticker(
            "metrics",
            self.cfg.metrics_interval(),
            move || {
                let client = client.clone();
                async move { collect_store_metrics(&client).await }
            },
        ));

        loops.push(tokio::spawn(time_monitor(self.cancel.clone())));

        info!("pd member {} is serving", self.member);
        Ok(())
    }

    fn spawn_ticker<F, Fut>(&self, name: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(10)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => tick().await,
                }
            }
            debug!("{} loop exited", name);
        })
    }

    /// Shut down; only the first call does anything.
    pub async fn close(&self) {
        let closed = self.state.transition(ServingPhase::Serving, ServingPhase::Closed)
            || self.state.transition(ServingPhase::Created, ServingPhase::Closed);
        if !closed {
            return;
        }
        info!("closing pd member {}", self.member);

        self.cancel.cancel();
        let loops = std::mem::take(&mut *self.loops.lock().await);
        for handle in loops {
            if let Err(e) = handle.await {
                error!("background loop panicked: {}", e);
            }
        }

        if let Err(e) = self.lifecycle.close().await {
            error!("close cluster error: {}", e);
        }
        if let Err(e) = self.client.close().await {
            error!("close metadata store client error: {}", e);
        }
        if let Some(store) = &self.embedded {
            store.close();
        }
        if let Err(e) = self.heartbeats.close().await {
            error!("close heartbeat streams error: {}", e);
        }
        if let Err(e) = self.storage.close() {
            error!("close storage error: {}", e);
        }
        self.state.set_leader(None);
        info!("pd member {} is closed", self.member);
    }

    pub fn phase(&self) -> ServingPhase {
        self.state.phase()
    }

    pub fn is_serving(&self) -> bool {
        self.state.is_serving()
    }

    pub fn is_closed(&self) -> bool {
        self.state.phase() == ServingPhase::Closed
    }

    // === Identity ===

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    pub fn root_path(&self) -> &str {
        self.keys.root()
    }

    pub fn endpoints(&self) -> Vec<String> {
        self.client.endpoints()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn storage(&self) -> &Arc<Storage> {
        &self.storage
    }

    pub fn embedded_store(&self) -> Option<&MemStore> {
        self.embedded.as_ref()
    }

    pub fn get_security_config(&self) -> &SecurityConfig {
        &self.cfg.security
    }

    // === Leadership ===

    pub fn leader(&self) -> Option<Arc<Member>> {
        self.leadership.leader()
    }

    pub fn is_leader(&self) -> bool {
        self.is_serving() && self.leadership.is_leader()
    }

    pub fn leadership(&self) -> &Arc<Leadership> {
        &self.leadership
    }

    pub async fn resign_leader(&self) -> Result<()> {
        self.leadership.resign().await
    }

    pub async fn get_member_leader_priority(&self, member_id: u64) -> Result<i32> {
        self.leadership.get_member_leader_priority(member_id).await
    }

    pub async fn set_member_leader_priority(&self, member_id: u64, priority: i32) -> Result<()> {
        self.leadership
            .set_member_leader_priority(member_id, priority)
            .await
    }

    pub async fn delete_member_leader_priority(&self, member_id: u64) -> Result<()> {
        self.leadership.delete_member_leader_priority(member_id).await
    }

    /// Members of the store group, with their leader priorities
    pub async fn get_members(&self) -> Result<Vec<Member>> {
        let mut members = Vec::new();
        for m in self.client.members().await? {
            let leader_priority = self.leadership.get_member_leader_priority(m.id).await?;
            members.push(Member {
                member_id: m.id,
                name: m.name,
                client_urls: m.client_urls,
                peer_urls: m.peer_urls,
                leader_priority,
            });
        }
        Ok(members)
    }

    pub async fn check_health(&self, members: &[Member]) -> BTreeMap<u64, Member> {
        self.health.check_health(members).await
    }

    // === Cluster ===

    pub async fn alloc_id(&self) -> Result<u64> {
        self.id_allocator.alloc().await
    }

    pub async fn bootstrap_cluster(&self, req: BootstrapRequest) -> Result<()> {
        if !self.is_serving() {
            return Err(Error::Closed);
        }
        self.bootstrapper.bootstrap(req).await
    }

    /// Cluster meta once bootstrapped
    pub async fn get_cluster_meta(&self) -> Result<Option<ClusterMeta>> {
        match self.lifecycle.meta() {
            Some(meta) => Ok(Some(meta)),
            None => self.storage.load_cluster_meta().await,
        }
    }

    pub async fn cluster_status(&self) -> Result<ClusterStatus> {
        self.lifecycle.status().await
    }

    pub fn is_cluster_running(&self) -> bool {
        self.lifecycle.is_running()
    }

    /// The running cluster, only while serving as leader
    pub fn get_raft_cluster(&self) -> Option<Arc<ClusterLifecycle>> {
        if !self.is_serving() || !self.lifecycle.is_running() {
            return None;
        }
        Some(self.lifecycle.clone())
    }

    pub fn lifecycle(&self) -> &Arc<ClusterLifecycle> {
        &self.lifecycle
    }

    pub fn heartbeat_streams(&self) -> &Arc<HeartbeatStreams> {
        &self.heartbeats
    }

    pub fn is_namespace_exist(&self, name: &str) -> bool {
        self.classifier.is_namespace_exist(name)
    }

    // === Config ===

    pub fn config_store(&self) -> &Arc<ConfigStore> {
        &self.config
    }

    pub fn get_schedule_config(&self) -> Arc<ScheduleConfig> {
        self.config.get_schedule()
    }

    pub async fn set_schedule_config(&self, cfg: ScheduleConfig) -> Result<()> {
        self.config.set_schedule(cfg).await
    }

    pub fn get_replication_config(&self) -> Arc<ReplicationConfig> {
        self.config.get_replication()
    }

    pub async fn set_replication_config(&self, cfg: ReplicationConfig) -> Result<()> {
        self.config.set_replication(cfg).await
    }

    pub fn get_namespace_config(&self, name: &str) -> NamespaceConfig {
        self.config.get_namespace(name)
    }

    pub fn get_namespace_config_with_adjust(&self, name: &str) -> NamespaceConfig {
        self.config.get_namespace_with_adjust(name)
    }

    pub async fn set_namespace_config(&self, name: &str, cfg: NamespaceConfig) -> Result<()> {
        self.config.set_namespace(name, cfg).await
    }

    pub async fn delete_namespace_config(&self, name: &str) -> Result<()> {
        self.config.delete_namespace(name).await
    }

    pub fn get_label_property(&self) -> Arc<LabelPropertyConfig> {
        self.config.get_label_property()
    }

    pub async fn set_label_property(&self, typ: &str, key: &str, value: &str) -> Result<()> {
        self.config.set_label_property(typ, key, value).await
    }

    pub async fn delete_label_property(&self, typ: &str, key: &str, value: &str) -> Result<()> {
        self.config.delete_label_property(typ, key, value).await
    }

    pub fn get_cluster_version(&self) -> Arc<Version> {
        self.config.get_cluster_version()
    }

    pub async fn set_cluster_version(&self, version: &str) -> Result<()> {
        self.config.set_cluster_version(version).await
    }

    // === Logging ===

    pub fn set_log_level_hook(&self, hook: LogLevelHook) {
        *self.log_hook.lock().unwrap_or_else(|e| e.into_inner()) = Some(hook);
    }

    pub fn get_log_level(&self) -> String {
        self.log_level
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_log_level(&self, level: &str) -> Result<()> {
        level
            .parse::<tracing::Level>()
            .map_err(|_| Error::Validation(format!("invalid log level {:?}", level)))?;
        if let Some(hook) = self.log_hook.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            hook(level)?;
        }
        let old = std::mem::replace(
            &mut *self.log_level.lock().unwrap_or_else(|e| e.into_inner()),
            level.to_string(),
        );
        warn!("log level changed from {} to {}", old, level);
        Ok(())
    }
}

/// Read the cluster id, creating it if this is the first member ever.
async fn init_cluster_id(client: &Client) -> Result<u64> {
    if let Some(bytes) = client.get_value(CLUSTER_ID_PATH).await? {
        return parse_cluster_id(&bytes);
    }

    let id = (timestamp_now() << 32) | rand::random::<u32>() as u64;
    let txn = Txn::new()
        .when([Compare::absent(CLUSTER_ID_PATH)])
        .and_then([Op::put(CLUSTER_ID_PATH, uint64_to_bytes(id))]);
    if client.txn(txn).await?.succeeded {
        return Ok(id);
    }

    match client.get_value(CLUSTER_ID_PATH).await? {
        Some(bytes) => parse_cluster_id(&bytes),
        None => Err(Error::ClusterIdentity(
            "cluster id vanished after a conflicting write".into(),
        )),
    }
}

fn parse_cluster_id(bytes: &[u8]) -> Result<u64> {
    match bytes_to_uint64(bytes) {
        Ok(0) => Err(Error::ClusterIdentity("stored cluster id is zero".into())),
        Ok(id) => Ok(id),
        Err(e) => Err(Error::ClusterIdentity(e.to_string())),
    }
}

async fn collect_store_metrics(client: &Client) {
    match client.status().await {
        Ok(status) => {
            METRICS.store_term.set(status.term);
            METRICS.store_applied_index.set(status.applied_index);
            METRICS.store_committed_index.set(status.committed_index);
        }
        Err(e) => debug!("collect store status failed: {}", e),
    }
}

/// Warn whenever the wall clock moves backwards.
async fn time_monitor(cancel: CancellationToken) {
    let mut last = SystemTime::now();
    while sleep_or_cancel(&cancel, TIME_MONITOR_INTERVAL).await {
        let now = SystemTime::now();
        if let Err(e) = now.duration_since(last) {
            METRICS.time_jump_back.inc();
            error!("system time jumps backward by {:?}", e.duration());
        }
        last = now;
    }
    debug!("time monitor exited");
}
