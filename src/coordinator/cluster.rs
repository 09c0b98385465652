//! Cluster lifecycle state machine
//!
//! ```text
//!  NotBootstrapped --Bootstrapped--> Stopped --Start--> Running
//!                                      ^                  |
//!                                      +------Stop--------+
//!  any --Close--> Closed
//! ```
//!
//! Every trigger (bootstrap, leadership gained or lost, shutdown) goes
//! through [`ClusterLifecycle::transition`], serialized by one async lock.
//! Running implies bootstrapped and leader at the time of the transition.

use crate::common::{Error, Result};
use crate::coordinator::config_store::ConfigStore;
use crate::coordinator::leader::Leadership;
use crate::coordinator::metadata::{ClusterMeta, Peer, RegionMeta};
use crate::coordinator::storage::Storage;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    NotBootstrapped,
    Stopped,
    Running,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Bootstrapped,
    Start,
    Stop,
    Close,
}

/// A subsystem that only runs while the cluster is running on the leader
#[async_trait]
pub trait ClusterService: Send + Sync {
    fn name(&self) -> &str;

    async fn start(&self, meta: &ClusterMeta) -> Result<()>;

    async fn stop(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    /// Unix nanoseconds, absent before bootstrap
    pub raft_bootstrap_time: Option<u64>,
    pub is_initialized: bool,
}

#[derive(Debug)]
struct Inner {
    state: LifecycleState,
    meta: Option<ClusterMeta>,
}

pub struct ClusterLifecycle {
    cluster_id: u64,
    storage: Arc<Storage>,
    leadership: Arc<Leadership>,
    config: Arc<ConfigStore>,
    services: Vec<Arc<dyn ClusterService>>,
    inner: Mutex<Inner>,
    transition_lock: tokio::sync::Mutex<()>,
}

impl ClusterLifecycle {
    /// `meta` is the cluster meta found at startup, if any.
    pub fn new(
        cluster_id: u64,
        storage: Arc<Storage>,
        leadership: Arc<Leadership>,
        config: Arc<ConfigStore>,
        services: Vec<Arc<dyn ClusterService>>,
        meta: Option<ClusterMeta>,
    ) -> Self {
        let state = if meta.is_some() {
            LifecycleState::Stopped
        } else {
            LifecycleState::NotBootstrapped
        };
        Self {
            cluster_id,
            storage,
            leadership,
            config,
            services,
            inner: Mutex::new(Inner { state, meta }),
            transition_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> LifecycleState {
        self.inner().state
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    pub fn meta(&self) -> Option<ClusterMeta> {
        self.inner().meta
    }

    fn set_state(&self, state: LifecycleState) {
        let mut inner = self.inner();
        if inner.state != state {
            info!("cluster {} state {:?} -> {:?}", self.cluster_id, inner.state, state);
            inner.state = state;
        }
    }

    pub async fn start(&self) -> Result<LifecycleState> {
        self.transition(LifecycleEvent::Start).await
    }

    pub async fn stop(&self) -> Result<LifecycleState> {
        self.transition(LifecycleEvent::Stop).await
    }

    pub async fn close(&self) -> Result<LifecycleState> {
        self.transition(LifecycleEvent::Close).await
    }

    /// Apply one event and return the resulting state.
    pub async fn transition(&self, event: LifecycleEvent) -> Result<LifecycleState> {
        let _guard = self.transition_lock.lock().await;
        let current = self.state();
        debug!("cluster lifecycle event {:?} in state {:?}", event, current);

        match (current, event) {
            (LifecycleState::Closed, LifecycleEvent::Close) => Ok(current),
            (LifecycleState::Closed, _) => Err(Error::Closed),

            (LifecycleState::NotBootstrapped, LifecycleEvent::Bootstrapped) => {
                self.load_meta().await?;
                Ok(self.state())
            }
            (_, LifecycleEvent::Bootstrapped) => Ok(current),

            (LifecycleState::Running, LifecycleEvent::Start) => Ok(current),
            (_, LifecycleEvent::Start) => {
                if !self.leadership.is_leader() {
                    return Err(Error::NotLeader(format!(
                        "start cluster {} requires leadership",
                        self.cluster_id
                    )));
                }
                let meta = match self.meta() {
                    Some(meta) => meta,
                    None => self.load_meta().await?,
                };
                if let Err(e) = self.config.reload().await {
                    warn!("reload config before starting cluster: {}", e);
                }
                self.start_services(&meta).await?;
                self.set_state(LifecycleState::Running);
                Ok(LifecycleState::Running)
            }

            (LifecycleState::Running, LifecycleEvent::Stop) => {
                self.stop_services(self.services.len()).await;
                self.set_state(LifecycleState::Stopped);
                Ok(LifecycleState::Stopped)
            }
            (_, LifecycleEvent::Stop) => Ok(current),

            (state, LifecycleEvent::Close) => {
                if state == LifecycleState::Running {
                    self.stop_services(self.services.len()).await;
                }
                self.set_state(LifecycleState::Closed);
                Ok(LifecycleState::Closed)
            }
        }
    }

    /// Pick up cluster meta written by a bootstrap (possibly on another node).
    async fn load_meta(&self) -> Result<ClusterMeta> {
        let meta = self
            .storage
            .load_cluster_meta()
            .await?
            .ok_or(Error::NotBootstrapped(self.cluster_id))?;
        let mut inner = self.inner();
        inner.meta = Some(meta);
        if inner.state == LifecycleState::NotBootstrapped {
            info!("cluster {} is bootstrapped", self.cluster_id);
            inner.state = LifecycleState::Stopped;
        }
        Ok(meta)
    }

    async fn start_services(&self, meta: &ClusterMeta) -> Result<()> {
        for (i, svc) in self.services.iter().enumerate() {
            if let Err(e) = svc.start(meta).await {
                warn!("start {} failed: {}", svc.name(), e);
                self.stop_services(i).await;
                return Err(e);
            }
            debug!("{} started", svc.name());
        }
        Ok(())
    }

    /// Stop the first `n` services in reverse start order.
    async fn stop_services(&self, n: usize) {
        for svc in self.services[..n].iter().rev() {
            svc.stop().await;
            debug!("{} stopped", svc.name());
        }
    }

    pub async fn status(&self) -> Result<ClusterStatus> {
        let raft_bootstrap_time = self.storage.load_bootstrap_time().await?;
        let is_initialized = match self.meta() {
            Some(_) => true,
            None => self.storage.load_cluster_meta().await?.is_some(),
        };
        Ok(ClusterStatus {
            raft_bootstrap_time,
            is_initialized,
        })
    }
}

/// A region heartbeat as reported by a storage node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHeartbeat {
    pub region: RegionMeta,
    pub leader: Option<Peer>,
}

/// Fan-in of region heartbeats, forwarded to the current subscriber while
/// the cluster is running.
pub struct HeartbeatStreams {
    tx: mpsc::Sender<RegionHeartbeat>,
    subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<RegionHeartbeat>>>>,
    active: Arc<AtomicBool>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

const HEARTBEAT_CHANNEL_SIZE: usize = 1024;

impl HeartbeatStreams {
    /// Spawn the dispatcher task. Must be called inside a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::channel::<RegionHeartbeat>(HEARTBEAT_CHANNEL_SIZE);
        let subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<RegionHeartbeat>>>> =
            Arc::new(Mutex::new(None));
        let active = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();

        let task = {
            let subscriber = subscriber.clone();
            let active = active.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let hb = tokio::select! {
                        _ = cancel.cancelled() => break,
                        hb = rx.recv() => match hb {
                            Some(hb) => hb,
                            None => break,
                        },
                    };
                    if !active.load(Ordering::SeqCst) {
                        debug!("drop heartbeat of region {}, cluster not running", hb.region.id);
                        continue;
                    }
                    let mut sub = subscriber.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(s) = sub.as_ref() {
                        if s.send(hb).is_err() {
                            debug!("heartbeat subscriber is gone");
                            sub.take();
                        }
                    }
                }
                info!("heartbeat streams dispatcher exited");
            })
        };

        Self {
            tx,
            subscriber,
            active,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Replace the subscriber; earlier subscribers stop receiving.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RegionHeartbeat> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.subscriber.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    pub async fn send(&self, hb: RegionHeartbeat) -> Result<()> {
        self.tx.send(hb).await.map_err(|_| Error::Closed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop the dispatcher and wait for it to exit.
    pub async fn close(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        self.cancel.cancel();
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.await
                .map_err(|e| Error::Internal(format!("heartbeat dispatcher: {}", e)))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ClusterService for HeartbeatStreams {
    fn name(&self) -> &str {
        "heartbeat-streams"
    }

    async fn start(&self, meta: &ClusterMeta) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Closed);
        }
        info!("heartbeat streams serving cluster {}", meta.id);
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}
