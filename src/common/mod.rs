//! Common utilities and types shared across minipd

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;
pub mod version;

pub use config::{
    Config, LabelPropertyConfig, NamespaceConfig, RegionStorageBackend, ReplicationConfig,
    ScheduleConfig, SchedulerConfig, SecurityConfig, StoreLabel,
};
pub use error::{Error, Result};
pub use metrics::METRICS;
pub use utils::{bytes_to_uint64, timestamp_now, timestamp_now_nanos, uint64_to_bytes};
pub use version::Version;
