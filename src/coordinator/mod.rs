//! Control-plane coordinator
//!
//! The coordinator is responsible for:
//! - Leadership among control-plane members (lease-backed leader key)
//! - One-time cluster bootstrap
//! - Cluster-wide unique ID allocation
//! - Versioned runtime configuration
//! - Cluster lifecycle on the elected leader
//! - Member health probing

pub mod bootstrap;
pub mod cluster;
pub mod config_store;
pub mod health;
pub mod http;
pub mod id;
pub mod keys;
pub mod leader;
pub mod member;
pub mod metadata;
pub mod namespace;
pub mod server;
pub mod state;
pub mod storage;

pub use bootstrap::BootstrapRequest;
pub use cluster::{ClusterLifecycle, ClusterStatus, LifecycleState};
pub use member::Member;
pub use server::Server;
