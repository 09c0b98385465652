//! Metadata key layout
//!
//! ```text
//! /pd/cluster_id                          cluster identity (first writer wins)
//! /pd/<cluster_id>/leader                 serialized leader member
//! /pd/<cluster_id>/alloc_id               id allocator high-water mark
//! /pd/<cluster_id>/config                 persisted config aggregate
//! /pd/<cluster_id>/member/<id>/leader_priority
//! /pd/<cluster_id>/raft                   cluster meta (bootstrap marker)
//! /pd/<cluster_id>/raft/bootstrap_time
//! /pd/<cluster_id>/raft/store/<id>
//! /pd/<cluster_id>/raft/region/<id>
//! ```

pub const PD_ROOT_PATH: &str = "/pd";
pub const CLUSTER_ID_PATH: &str = "/pd/cluster_id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    root: String,
}

impl Keys {
    pub fn new(cluster_id: u64) -> Self {
        Self {
            root: format!("{}/{}", PD_ROOT_PATH, cluster_id),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn leader(&self) -> String {
        format!("{}/leader", self.root)
    }

    pub fn alloc_id(&self) -> String {
        format!("{}/alloc_id", self.root)
    }

    pub fn config(&self) -> String {
        format!("{}/config", self.root)
    }

    pub fn member_leader_priority(&self, member_id: u64) -> String {
        format!("{}/member/{}/leader_priority", self.root, member_id)
    }

    pub fn cluster_root(&self) -> String {
        format!("{}/raft", self.root)
    }

    pub fn bootstrap_time(&self) -> String {
        format!("{}/raft/bootstrap_time", self.root)
    }

    pub fn store(&self, store_id: u64) -> String {
        format!("{}/raft/store/{:020}", self.root, store_id)
    }

    pub fn region(&self, region_id: u64) -> String {
        format!("{}/raft/region/{:020}", self.root, region_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout() {
        let keys = Keys::new(42);
        assert_eq!(keys.root(), "/pd/42");
        assert_eq!(keys.leader(), "/pd/42/leader");
        assert_eq!(keys.cluster_root(), "/pd/42/raft");
        assert_eq!(keys.store(1), "/pd/42/raft/store/00000000000000000001");
        assert_eq!(keys.member_leader_priority(7), "/pd/42/member/7/leader_priority");
    }
}
