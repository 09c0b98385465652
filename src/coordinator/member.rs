//! Control-plane member descriptor

use crate::common::{Config, Result};
use serde::{Deserialize, Serialize};

/// Identity of one control-plane node. Its serialized form is what gets
/// stored under the leader key; byte equality with the local copy is the
/// leadership proof behind every guarded write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub member_id: u64,
    pub name: String,
    pub client_urls: Vec<String>,
    pub peer_urls: Vec<String>,
    #[serde(default)]
    pub leader_priority: i32,
}

impl Member {
    pub fn from_config(member_id: u64, cfg: &Config) -> Self {
        Self {
            member_id,
            name: cfg.name.clone(),
            client_urls: cfg.client_urls(),
            peer_urls: cfg.peer_urls(),
            leader_priority: 0,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| crate::Error::MetadataCorrupted(format!("member: {}", e)))
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.name, self.member_id)
    }
}
