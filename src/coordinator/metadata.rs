//! Cluster metadata records and the local region mirror
//!
//! Stores:
//! - Cluster meta (id, max peer count), written once at bootstrap
//! - Store descriptors (storage nodes of the data plane)
//! - Region descriptors (keyspace shards and their replica sets)
//!
//! Records are bincode-encoded. Regions are additionally mirrored into a
//! local key-value store (RocksDB or memory) under the data directory; the
//! metadata store stays the source of truth.

use crate::common::{Error, RegionStorageBackend, Result, StoreLabel};
use rocksdb::{Options, DB};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

const CF_REGIONS: &str = "regions";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMeta {
    pub id: u64,
    pub max_peer_count: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreState {
    #[default]
    Up,
    Offline,
    Tombstone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub id: u64,
    pub address: String,
    pub labels: Vec<StoreLabel>,
    pub state: StoreState,
    pub version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: u64,
    pub store_id: u64,
    pub is_learner: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionMeta {
    pub id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub region_epoch: RegionEpoch,
    pub peers: Vec<Peer>,
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| Error::MetadataCorrupted(e.to_string()))
}

/// Backend for the region mirror
trait RegionKv: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn scan(&self) -> Result<Vec<Vec<u8>>>;
    fn flush(&self) -> Result<()>;
    fn close(&self) -> Result<()>;
}

#[derive(Default)]
struct MemRegionKv {
    map: Mutex<Option<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemRegionKv {
    fn new() -> Self {
        Self {
            map: Mutex::new(Some(BTreeMap::new())),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&mut BTreeMap<Vec<u8>, Vec<u8>>) -> T) -> Result<T> {
        let mut guard = self.map.lock().unwrap_or_else(|e| e.into_inner());
        guard.as_mut().map(f).ok_or(Error::Closed)
    }
}

impl RegionKv for MemRegionKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with(|m| m.get(key).cloned())
    }
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with(|m| {
            m.insert(key.to_vec(), value.to_vec());
        })
    }
    fn scan(&self) -> Result<Vec<Vec<u8>>> {
        self.with(|m| m.values().cloned().collect())
    }
    fn flush(&self) -> Result<()> {
        self.with(|_| ())
    }
    fn close(&self) -> Result<()> {
        self.map.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

struct RocksRegionKv {
    db: Mutex<Option<DB>>,
}

impl RocksRegionKv {
    fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = DB::open_cf(&opts, path, vec![CF_REGIONS])?;
        Ok(Self {
            db: Mutex::new(Some(db)),
        })
    }

    fn with<T>(&self, f: impl FnOnce(&DB) -> Result<T>) -> Result<T> {
        let guard = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let db = guard.as_ref().ok_or(Error::Closed)?;
        f(db)
    }
}

fn cf(db: &DB) -> Result<&rocksdb::ColumnFamily> {
    db.cf_handle(CF_REGIONS)
        .ok_or_else(|| Error::Internal(format!("missing column family {}", CF_REGIONS)))
}

impl RegionKv for RocksRegionKv {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with(|db| Ok(db.get_cf(cf(db)?, key)?))
    }
    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.with(|db| Ok(db.put_cf(cf(db)?, key, value)?))
    }
    fn scan(&self) -> Result<Vec<Vec<u8>>> {
        self.with(|db| {
            let mut out = Vec::new();
            for item in db.iterator_cf(cf(db)?, rocksdb::IteratorMode::Start) {
                let (_, value) = item?;
                out.push(value.to_vec());
            }
            Ok(out)
        })
    }
    fn flush(&self) -> Result<()> {
        self.with(|db| Ok(db.flush_cf(cf(db)?)?))
    }
    fn close(&self) -> Result<()> {
        let db = self.db.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(db) = db {
            db.flush()?;
        }
        Ok(())
    }
}

/// Local best-effort cache of region descriptors
pub struct RegionStore {
    kv: Box<dyn RegionKv>,
}

impl RegionStore {
    /// Open the mirror; `path` is only used by the RocksDB backend.
    pub fn open(backend: RegionStorageBackend, path: impl AsRef<Path>) -> Result<Self> {
        let kv: Box<dyn RegionKv> = match backend {
            RegionStorageBackend::RocksDb => Box::new(RocksRegionKv::open(path.as_ref())?),
            RegionStorageBackend::Memory => Box::new(MemRegionKv::new()),
        };
        Ok(Self { kv })
    }

    pub fn memory() -> Self {
        Self {
            kv: Box::new(MemRegionKv::new()),
        }
    }

    pub fn save_region(&self, region: &RegionMeta) -> Result<()> {
        self.kv.put(&region.id.to_be_bytes(), &encode(region)?)
    }

    pub fn load_region(&self, region_id: u64) -> Result<Option<RegionMeta>> {
        match self.kv.get(&region_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_regions(&self) -> Result<Vec<RegionMeta>> {
        self.kv.scan()?.iter().map(|b| decode(b)).collect()
    }

    pub fn flush(&self) -> Result<()> {
        self.kv.flush()
    }

    pub fn close(&self) -> Result<()> {
        self.kv.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn region(id: u64) -> RegionMeta {
        RegionMeta {
            id,
            start_key: vec![],
            end_key: vec![],
            region_epoch: RegionEpoch {
                conf_ver: 1,
                version: 1,
            },
            peers: vec![Peer {
                id: id + 1,
                store_id: 1,
                is_learner: false,
            }],
        }
    }

    #[test]
    fn test_region_store_rocksdb() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("region-meta");
        {
            let store = RegionStore::open(RegionStorageBackend::RocksDb, &path).unwrap();
            store.save_region(&region(2)).unwrap();
            store.save_region(&region(4)).unwrap();
            store.flush().unwrap();
            store.close().unwrap();
            assert!(matches!(store.load_region(2), Err(Error::Closed)));
        }

        let store = RegionStore::open(RegionStorageBackend::RocksDb, &path).unwrap();
        assert_eq!(store.load_region(2).unwrap().unwrap(), region(2));
        assert_eq!(store.list_regions().unwrap().len(), 2);
        assert!(store.load_region(3).unwrap().is_none());
    }

    #[test]
    fn test_region_store_memory() {
        let store = RegionStore::memory();
        store.save_region(&region(9)).unwrap();
        assert_eq!(store.load_region(9).unwrap().unwrap().peers[0].id, 10);
        store.close().unwrap();
        assert!(store.save_region(&region(9)).is_err());
    }

    #[test]
    fn test_decode_corrupted() {
        let res: Result<ClusterMeta> = decode(&[1, 2]);
        assert!(matches!(res, Err(Error::MetadataCorrupted(_))));
    }
}
