//! KV directory (C4, spec §4.4): the in-memory catalog of KV stores living
//! in one file. Two ordered indexes over the same `KvsNode` set — the
//! intrusive AVL trees of `kv_instance.cc`'s `kvs_id_tree`/`kvs_name_tree`
//! become a pair of `BTreeMap`s (spec §9).

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::filemgr::FileMgr;

/// Persisted flag: the store was opened with a custom comparator.
pub const KVS_FLAG_CUSTOM_CMP: u64 = 0x1;

pub const DEFAULT_KVS_ID: u64 = 0;
pub const DEFAULT_KVS_NAME: &str = "default";

/// A key comparator bound to a KVS. Only the existence of one is persisted
/// (`KVS_FLAG_CUSTOM_CMP`); the function itself is rebound at every open
/// from the caller-supplied comparator list (spec §4.6).
pub type Comparator = Arc<dyn Fn(&[u8], &[u8]) -> std::cmp::Ordering + Send + Sync>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KvsStat {
    pub nlivenodes: u64,
    pub ndocs: u64,
    pub datasize: u64,
    pub wal_ndocs: u64,
    pub wal_ndeletes: u64,
}

#[derive(Clone)]
pub struct KvsNode {
    pub id: u64,
    pub name: String,
    pub seqnum: u64,
    pub flags: u64,
    pub stat: KvsStat,
    pub custom_cmp: Option<Comparator>,
}

impl KvsNode {
    pub fn has_custom_cmp_flag(&self) -> bool {
        self.flags & KVS_FLAG_CUSTOM_CMP != 0
    }
}

impl std::fmt::Debug for KvsNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvsNode")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("seqnum", &self.seqnum)
            .field("flags", &self.flags)
            .field("stat", &self.stat)
            .field("custom_cmp", &self.custom_cmp.is_some())
            .finish()
    }
}

struct Inner {
    by_name: BTreeMap<String, u64>,
    by_id: BTreeMap<u64, KvsNode>,
    id_counter: u64,
    default_kvs_cmp: Option<Comparator>,
    custom_cmp_enabled: bool,
}

/// `kv_header`: one per open file, guarded by a single lock (spec §3/§5).
pub struct KvDirectory {
    inner: parking_lot::Mutex<Inner>,
}

impl Default for KvDirectory {
    fn default() -> Self {
        KvDirectory::new()
    }
}

impl KvDirectory {
    pub fn new() -> Self {
        KvDirectory {
            inner: parking_lot::Mutex::new(Inner {
                by_name: BTreeMap::new(),
                by_id: BTreeMap::new(),
                id_counter: DEFAULT_KVS_ID + 1,
                default_kvs_cmp: None,
                custom_cmp_enabled: false,
            }),
        }
    }

    /// §4.4 `create`: allocate a fresh ID and insert into both indexes.
    pub fn create(&self, name: &str, custom_cmp: Option<Comparator>) -> Result<KvsNode> {
        if name == DEFAULT_KVS_NAME {
            return Err(Error::NameExists(name.to_string()));
        }
        let mut inner = self.inner.lock();
        if inner.by_name.contains_key(name) {
            return Err(Error::NameExists(name.to_string()));
        }
        let id = inner.id_counter;
        inner.id_counter += 1;
        let mut flags = 0u64;
        if custom_cmp.is_some() {
            flags |= KVS_FLAG_CUSTOM_CMP;
            inner.custom_cmp_enabled = true;
        }
        let node = KvsNode {
            id,
            name: name.to_string(),
            seqnum: 0,
            flags,
            stat: KvsStat::default(),
            custom_cmp,
        };
        inner.by_name.insert(name.to_string(), id);
        inner.by_id.insert(id, node.clone());
        Ok(node)
    }

    /// §4.4 `remove`: returns the removed node to the caller for disposal.
    pub fn remove(&self, name: &str) -> Result<KvsNode> {
        let mut inner = self.inner.lock();
        let id = inner.by_name.remove(name).ok_or(Error::NotFound)?;
        let node = inner
            .by_id
            .remove(&id)
            .expect("by_name and by_id indexes diverged");
        Ok(node)
    }

    pub fn find_by_name(&self, name: &str) -> Option<KvsNode> {
        let inner = self.inner.lock();
        let id = *inner.by_name.get(name)?;
        inner.by_id.get(&id).cloned()
    }

    pub fn find_by_id(&self, id: u64) -> Option<KvsNode> {
        self.inner.lock().by_id.get(&id).cloned()
    }

    /// §4.4 `get_seqnum`: ID 0 (the default KVS) delegates to the file's own
    /// seqnum; an unknown ID returns 0 rather than erroring, so WAL restore
    /// can silently skip documents whose KVS was dropped.
    pub fn get_seqnum<F: FileMgr>(&self, id: u64, file: &F) -> u64 {
        if id == DEFAULT_KVS_ID {
            return file.get_seqnum();
        }
        self.inner
            .lock()
            .by_id
            .get(&id)
            .map(|n| n.seqnum)
            .unwrap_or(0)
    }

    pub fn set_seqnum<F: FileMgr>(&self, id: u64, seqnum: u64, file: &F) {
        if id == DEFAULT_KVS_ID {
            file.set_seqnum(seqnum);
            return;
        }
        if let Some(node) = self.inner.lock().by_id.get_mut(&id) {
            node.seqnum = seqnum;
        }
    }

    pub fn set_custom_cmp(&self, id: u64, cmp: Option<Comparator>) {
        if let Some(node) = self.inner.lock().by_id.get_mut(&id) {
            node.custom_cmp = cmp;
        }
    }

    /// §4.4 `reset_all_stats`: used after compaction copies the directory
    /// into the new file.
    pub fn reset_all_stats(&self) {
        let mut inner = self.inner.lock();
        for node in inner.by_id.values_mut() {
            node.stat = KvsStat::default();
        }
    }

    pub fn default_cmp(&self) -> Option<Comparator> {
        self.inner.lock().default_kvs_cmp.clone()
    }

    pub fn set_default_cmp(&self, cmp: Option<Comparator>) {
        let mut inner = self.inner.lock();
        inner.custom_cmp_enabled = inner.custom_cmp_enabled || cmp.is_some();
        inner.default_kvs_cmp = cmp;
    }

    pub fn custom_cmp_enabled(&self) -> bool {
        self.inner.lock().custom_cmp_enabled
    }

    pub fn id_counter(&self) -> u64 {
        self.inner.lock().id_counter
    }

    /// All nodes, in by-name order (deterministic; used by the codec and by
    /// `get_kvs_name_list`).
    pub fn all_nodes(&self) -> Vec<KvsNode> {
        let inner = self.inner.lock();
        inner
            .by_name
            .values()
            .map(|id| inner.by_id[id].clone())
            .collect()
    }

    /// `(id_counter, nodes-in-by-name-order)`, for the export codec.
    pub fn export_snapshot(&self) -> (u64, Vec<KvsNode>) {
        let inner = self.inner.lock();
        let nodes = inner
            .by_name
            .values()
            .map(|id| inner.by_id[id].clone())
            .collect();
        (inner.id_counter, nodes)
    }

    /// Replace the directory's contents wholesale, for the import codec.
    pub fn import_snapshot(&self, id_counter: u64, nodes: Vec<KvsNode>) {
        let mut inner = self.inner.lock();
        inner.by_name.clear();
        inner.by_id.clear();
        inner.id_counter = id_counter;
        for node in nodes {
            inner.by_name.insert(node.name.clone(), node.id);
            inner.by_id.insert(node.id, node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_find_round_trips() {
        let dir = KvDirectory::new();
        let node = dir.create("a", None).unwrap();
        assert_eq!(node.id, 1);
        assert_eq!(dir.find_by_name("a").unwrap().id, 1);
        assert_eq!(dir.find_by_id(1).unwrap().name, "a");
    }

    #[test]
    fn duplicate_name_fails() {
        let dir = KvDirectory::new();
        dir.create("a", None).unwrap();
        assert!(matches!(dir.create("a", None), Err(Error::NameExists(_))));
    }

    #[test]
    fn ids_are_never_reused_after_remove() {
        let dir = KvDirectory::new();
        dir.create("a", None).unwrap();
        dir.remove("a").unwrap();
        let b = dir.create("b", None).unwrap();
        assert_eq!(b.id, 2);
        assert!(dir.find_by_name("a").is_none());
    }

    #[test]
    fn remove_missing_fails_not_found() {
        let dir = KvDirectory::new();
        assert!(matches!(dir.remove("ghost"), Err(Error::NotFound)));
    }

    #[test]
    fn default_name_is_reserved() {
        let dir = KvDirectory::new();
        assert!(matches!(
            dir.create(DEFAULT_KVS_NAME, None),
            Err(Error::NameExists(_))
        ));
    }
}
