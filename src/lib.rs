//! # minipd
//!
//! The control-plane core of a placement driver for a distributed
//! key-value store:
//! - Lease-backed leader election among control-plane members
//! - One-time cluster bootstrap with the first store and region
//! - Cluster-wide unique ID allocation in persisted windows
//! - Versioned schedule / replication / namespace configuration
//! - Cluster lifecycle that only runs on the elected leader
//! - Member health probing over HTTP
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │              Metadata store                   │
//! │  (linearizable KV: txn, leases, watches)      │
//! └──────┬──────────────┬──────────────┬─────────┘
//!        │              │              │
//! ┌──────▼─────┐ ┌──────▼─────┐ ┌──────▼─────┐
//! │   pd-1     │ │   pd-2     │ │   pd-3     │
//! │  (leader)  │ │ (follower) │ │ (follower) │
//! │ lifecycle  │ │  watching  │ │  watching  │
//! └────────────┘ └────────────┘ └────────────┘
//! ```
//!
//! ## Usage
//!
//! ```bash
//! minipd-server serve \
//!   --name pd-1 \
//!   --bind 127.0.0.1:2379 \
//!   --data-dir ./pd-data \
//!   --client-urls http://127.0.0.1:2379
//! ```

pub mod common;
pub mod coordinator;
pub mod metastore;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use coordinator::Server;

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
