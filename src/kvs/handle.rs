//! File handle + KV handle manager (C6, spec §4.6).
//!
//! Grounded on `fdb_kvs_open`/`_fdb_kvs_create`/`fdb_kvs_remove`/
//! `fdb_kvs_rollback`/`fdb_kvs_close`/`fdb_kvs_cmp_check` in
//! `original_source/src/kv_instance.cc`. The compaction-handoff retry loop
//! (§5 "relays the file mutex to `new_file`") has no live collaborator to
//! hand off to in this crate — `FileMgr` never reports anything other than
//! `Normal` — so each retry loop here collapses to a single pass; the shape
//! (rollback check, then file-status check, then the actual mutation) is
//! kept so a real compaction collaborator can be slotted in later.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::docio::DocIoHandle;
use crate::error::{Error, Result};
use crate::filemgr::{FileMgr, FileStatus};
use crate::hbtrie::HbTrie;
use crate::wal::Wal;

use super::codec::{self, KV_HEADER_KEY};
use super::directory::{Comparator, KvDirectory, KvsNode, DEFAULT_KVS_ID, DEFAULT_KVS_NAME};

pub const FHANDLE_ROOT_OPENED: u32 = 0x1;
pub const FHANDLE_ROOT_INITIALIZED: u32 = 0x2;
pub const FHANDLE_ROOT_CUSTOM_CMP: u32 = 0x4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvsType {
    Root,
    Sub,
}

pub struct KvsInfo {
    pub kvs_type: KvsType,
    pub id: u64,
}

/// Per-open configuration a caller supplies to `kvs_open`/`kvs_create`.
#[derive(Clone, Default)]
pub struct KvsConfig {
    pub create_if_missing: bool,
    pub read_only: bool,
    pub custom_cmp: Option<Comparator>,
}

/// A cursor into one KVS (spec §3 "KvsHandle").
pub struct KvsHandle {
    pub info: KvsInfo,
    pub config: KvsConfig,
    /// `Some(seqnum)` iff this handle is a snapshot pinned at that seqnum.
    pub max_seqnum: Option<u64>,
    pub kv_info_offset: Mutex<Option<u64>>,
}

impl KvsHandle {
    pub fn is_snapshot(&self) -> bool {
        self.max_seqnum.is_some()
    }
}

/// Groups the root handle and every child handle opened against the same
/// file (spec §3 "FileHandle").
pub struct FileHandle<F: FileMgr, W: Wal, T: HbTrie> {
    pub file: Arc<F>,
    pub wal: Arc<W>,
    pub trie: Arc<T>,
    pub docio: Arc<DocIoHandle<F>>,
    pub directory: Arc<KvDirectory>,
    flags: Mutex<u32>,
    cmp_list: Mutex<Vec<(Option<String>, Comparator)>>,
    children: Mutex<Vec<Arc<KvsHandle>>>,
    root: Mutex<Option<Arc<KvsHandle>>>,
}

impl<F: FileMgr, W: Wal, T: HbTrie> FileHandle<F, W, T> {
    pub fn new(
        file: Arc<F>,
        wal: Arc<W>,
        trie: Arc<T>,
        docio: Arc<DocIoHandle<F>>,
        directory: Arc<KvDirectory>,
    ) -> Self {
        FileHandle {
            file,
            wal,
            trie,
            docio,
            directory,
            flags: Mutex::new(0),
            cmp_list: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            root: Mutex::new(None),
        }
    }

    /// Register a (name, comparator) binding consulted at open time. A
    /// `None` name binds the default KVS.
    pub fn register_comparator(&self, name: Option<String>, cmp: Comparator) {
        self.cmp_list.lock().push((name, cmp));
    }

    /// Load the directory from its persisted system document, if one
    /// exists at `offset`. Called once, right after the file is opened.
    pub fn load_directory(&self, offset: u64) -> Result<()> {
        let doc = self.docio.read_doc(offset)?;
        let body = doc.body.unwrap_or_default();
        codec::import_into(&self.directory, &body)
    }

    /// Persist the KV directory as a system document. Assumes the caller
    /// already holds `file.mutex()` (spec §5 lock ordering) — every call
    /// site (`kvs_create`/`kvs_info_create`/`kvs_remove`/`kvs_rollback`)
    /// takes the file mutex for its whole mutation sequence, and going
    /// through `DocIoHandle`'s locking entry point from there would re-lock
    /// the same non-reentrant `parking_lot::Mutex` `self.docio` shares with
    /// it and deadlock.
    fn persist_directory_locked(&self) -> Result<u64> {
        let body = codec::export(&self.directory);
        self.docio.append_doc_system_locked(KV_HEADER_KEY, &body)
    }

    /// §4.6 `kvs_open`.
    pub fn kvs_open(self: &Arc<Self>, name: Option<&str>, config: KvsConfig) -> Result<Arc<KvsHandle>> {
        match name {
            None | Some(DEFAULT_KVS_NAME) => self.open_root(config),
            Some(name) => self.open_sub(name, config),
        }
    }

    fn resolve_default_cmp(&self, config: &KvsConfig) -> Option<Comparator> {
        self.cmp_list
            .lock()
            .iter()
            .find(|(n, _)| n.is_none() || n.as_deref() == Some(DEFAULT_KVS_NAME))
            .map(|(_, f)| f.clone())
            .or_else(|| config.custom_cmp.clone())
    }

    fn open_root(self: &Arc<Self>, config: KvsConfig) -> Result<Arc<KvsHandle>> {
        let already_opened = *self.flags.lock() & FHANDLE_ROOT_OPENED != 0;

        if !already_opened {
            let effective_cmp = self.resolve_default_cmp(&config);
            self.directory.set_default_cmp(effective_cmp.clone());
            {
                let mut flags = self.flags.lock();
                *flags |= FHANDLE_ROOT_OPENED | FHANDLE_ROOT_INITIALIZED;
                if effective_cmp.is_some() {
                    *flags |= FHANDLE_ROOT_CUSTOM_CMP;
                }
            }
            if let Err(e) = self.cmp_check() {
                // Undo the speculative root-open entirely (not just the
                // default-comparator fields `cmp_check` itself reverts on a
                // default-specific mismatch) so a later, correctly-configured
                // open can redo it from scratch.
                self.directory.set_default_cmp(None);
                *self.flags.lock() &=
                    !(FHANDLE_ROOT_OPENED | FHANDLE_ROOT_INITIALIZED | FHANDLE_ROOT_CUSTOM_CMP);
                return Err(e);
            }
            let handle = Arc::new(KvsHandle {
                info: KvsInfo { kvs_type: KvsType::Root, id: DEFAULT_KVS_ID },
                config: KvsConfig { custom_cmp: effective_cmp, ..config },
                max_seqnum: None,
                kv_info_offset: Mutex::new(None),
            });
            *self.root.lock() = Some(handle.clone());
            return Ok(handle);
        }

        // Subsequent opens of the default KVS: a fresh handle, sharing the
        // already-resolved comparator, registered as a child.
        let effective_cmp = self.directory.default_cmp();
        let handle = Arc::new(KvsHandle {
            info: KvsInfo { kvs_type: KvsType::Root, id: DEFAULT_KVS_ID },
            config: KvsConfig { custom_cmp: effective_cmp, ..config },
            max_seqnum: None,
            kv_info_offset: Mutex::new(None),
        });
        self.children.lock().push(handle.clone());
        Ok(handle)
    }

    fn open_sub(self: &Arc<Self>, name: &str, config: KvsConfig) -> Result<Arc<KvsHandle>> {
        if self.root.lock().is_none() {
            return Err(Error::InvalidHandle);
        }
        let node = self.kvs_info_create(name, &config)?;
        self.cmp_check()?;
        let handle = Arc::new(KvsHandle {
            info: KvsInfo { kvs_type: KvsType::Sub, id: node.id },
            config: KvsConfig { custom_cmp: node.custom_cmp.clone(), ..config },
            max_seqnum: None,
            kv_info_offset: Mutex::new(None),
        });
        self.children.lock().push(handle.clone());
        Ok(handle)
    }

    /// §4.6 `kvs_info_create`: look the name up; create it on the spot if
    /// `create_if_missing` allows it.
    fn kvs_info_create(&self, name: &str, config: &KvsConfig) -> Result<KvsNode> {
        let _guard = self.file.mutex().lock();
        if let Some(node) = self.directory.find_by_name(name) {
            return Ok(node);
        }
        if !config.create_if_missing {
            return Err(Error::KvStoreNotFound(name.to_string()));
        }
        if config.read_only {
            return Err(Error::RonlyViolation);
        }
        let node = self
            .directory
            .create(name, config.custom_cmp.clone())
            .map_err(to_invalid_name)?;
        self.persist_directory_locked()?;
        Ok(node)
    }

    /// §4.6 `kvs_cmp_check`: bind unset nodes from the cmp list, then check
    /// every node's persisted flag matches whether a comparator is bound
    /// now. Runs the same check for the default KVS via the root flags.
    fn cmp_check(&self) -> Result<()> {
        let cmp_list = self.cmp_list.lock().clone();
        for (name, cmp) in &cmp_list {
            let Some(name) = name else { continue };
            if let Some(node) = self.directory.find_by_name(name) {
                if node.custom_cmp.is_none() {
                    self.directory.set_custom_cmp(node.id, Some(cmp.clone()));
                }
            }
        }

        for node in self.directory.all_nodes() {
            if node.has_custom_cmp_flag() != node.custom_cmp.is_some() {
                log::warn!(
                    "comparator mismatch for KVS {:?} (id {}): persisted flag={}, comparator supplied={}",
                    node.name,
                    node.id,
                    node.has_custom_cmp_flag(),
                    node.custom_cmp.is_some()
                );
                return Err(Error::InvalidCmpFunction(node.id));
            }
        }

        let default_flag = *self.flags.lock() & FHANDLE_ROOT_CUSTOM_CMP != 0;
        let default_provided = self.directory.default_cmp().is_some();
        if default_flag != default_provided {
            // Roll back the speculative mutation `open_root` just made.
            log::warn!("comparator mismatch for the default KVS: persisted flag={default_flag}, comparator supplied={default_provided}");
            self.directory.set_default_cmp(None);
            *self.flags.lock() &= !FHANDLE_ROOT_CUSTOM_CMP;
            return Err(Error::InvalidCmpFunction(DEFAULT_KVS_ID));
        }
        Ok(())
    }

    /// §4.6 `kvs_create`, the explicit top-level create (as opposed to the
    /// implicit create-on-open path in `kvs_info_create`).
    pub fn kvs_create(&self, name: &str, config: &KvsConfig) -> Result<KvsNode> {
        if name == DEFAULT_KVS_NAME {
            return Err(Error::InvalidKvInstanceName(name.to_string()));
        }
        let _guard = self.file.mutex().lock();
        if self.file.is_rollback_on() {
            return Err(Error::FailByRollback);
        }
        match self.file.get_file_status() {
            FileStatus::Normal | FileStatus::CompactNew => {}
            _ => return Err(Error::FailByCompaction),
        }
        let node = self
            .directory
            .create(name, config.custom_cmp.clone())
            .map_err(to_invalid_name)?;
        log::info!("created KVS {name:?} (id {})", node.id);
        self.persist_directory_locked()?;
        Ok(node)
    }

    /// §4.6 `kvs_remove`.
    pub fn kvs_remove(&self, name: &str) -> Result<()> {
        if name == DEFAULT_KVS_NAME {
            return Err(Error::InvalidKvInstanceName(name.to_string()));
        }
        let _guard = self.file.mutex().lock();
        if self.file.is_rollback_on() {
            return Err(Error::FailByRollback);
        }
        match self.file.get_file_status() {
            FileStatus::Normal | FileStatus::CompactNew => {}
            _ => return Err(Error::FailByCompaction),
        }

        let node = self
            .directory
            .find_by_name(name)
            .ok_or_else(|| Error::KvStoreNotFound(name.to_string()))?;

        if self.children.lock().iter().any(|h| h.info.id == node.id) {
            log::warn!("refusing to remove KVS {name:?} (id {}): still open", node.id);
            return Err(Error::KvStoreBusy(name.to_string()));
        }

        self.directory.remove(name).map_err(|e| match e {
            Error::NotFound => Error::KvStoreNotFound(name.to_string()),
            other => other,
        })?;
        self.trie.remove_partial(node.id)?;
        self.persist_directory_locked()?;
        log::info!("removed KVS {name:?} (id {})", node.id);
        Ok(())
    }

    /// §4.6 `kvs_rollback`.
    pub fn kvs_rollback(&self, handle: &Arc<KvsHandle>, seqnum: u64) -> Result<()> {
        if handle.is_snapshot() {
            return Err(Error::InvalidArgs);
        }
        if handle.config.read_only {
            return Err(Error::RonlyViolation);
        }
        let current = self.directory.get_seqnum(handle.info.id, &*self.file);
        if seqnum > current {
            return Err(Error::InvalidArgs);
        }
        if self.wal.txn_exists() {
            return Err(Error::FailByTransaction);
        }
        if self.file.get_file_status() != FileStatus::Normal {
            return Err(Error::FailByCompaction);
        }

        log::info!("rolling back KVS id {} from seqnum {current} to {seqnum}", handle.info.id);
        let _guard = self.file.mutex().lock();
        self.file.set_rollback(true);
        let old_seqnum = current;

        // Read the KVS's sub-trie roots as of `seqnum` and overwrite the
        // current root handle's sub-tries for this KVS ID (spec §4.6): any
        // key inserted into the trie after `seqnum` is undone in place,
        // since `HbTrie` keeps its own undo history rather than this crate
        // opening a separate temporary handle to diff against.
        if let Err(e) = self.trie.rollback_partial(handle.info.id, seqnum) {
            log::warn!("rollback of KVS id {}'s sub-trie failed: {e}", handle.info.id);
            self.file.set_rollback(false);
            return Err(e);
        }

        self.directory.set_seqnum(handle.info.id, seqnum, &*self.file);
        let result = self.persist_directory_locked();
        if result.is_err() {
            log::warn!("rollback commit failed for KVS id {}; restoring seqnum {old_seqnum}", handle.info.id);
            self.directory.set_seqnum(handle.info.id, old_seqnum, &*self.file);
        }
        self.file.set_rollback(false);
        result.map(|_| ())
    }

    /// §4.6 "Closing".
    pub fn kvs_close(&self, handle: &Arc<KvsHandle>) {
        let is_the_root = self
            .root
            .lock()
            .as_ref()
            .map_or(false, |r| Arc::ptr_eq(r, handle));
        if is_the_root {
            *self.flags.lock() &= !FHANDLE_ROOT_OPENED;
        } else {
            self.children.lock().retain(|h| !Arc::ptr_eq(h, handle));
        }
    }

    /// §4.6 `get_kvs_info`.
    pub fn get_kvs_info(&self, handle: &Arc<KvsHandle>) -> Result<KvsInfoView> {
        let (name, stat) = if handle.info.id == DEFAULT_KVS_ID {
            (DEFAULT_KVS_NAME.to_string(), Default::default())
        } else {
            let node = self
                .directory
                .find_by_id(handle.info.id)
                .ok_or(Error::InvalidHandle)?;
            (node.name.clone(), node.stat)
        };
        let seqnum = self.directory.get_seqnum(handle.info.id, &*self.file);
        let doc_count = (stat.ndocs + stat.wal_ndocs).saturating_sub(stat.wal_ndeletes);
        let space_used = stat.datasize + stat.nlivenodes * self.file.block_size() as u64;
        Ok(KvsInfoView {
            id: handle.info.id,
            name,
            seqnum,
            doc_count,
            space_used,
        })
    }

    /// §4.6 `get_kvs_name_list`: `"default"` plus every named KVS.
    pub fn get_kvs_name_list(&self) -> Vec<String> {
        let mut names = vec![DEFAULT_KVS_NAME.to_string()];
        names.extend(self.directory.all_nodes().into_iter().map(|n| n.name));
        names
    }
}

fn to_invalid_name(e: Error) -> Error {
    match e {
        Error::NameExists(n) => Error::InvalidKvInstanceName(n),
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvsInfoView {
    pub id: u64,
    pub name: String,
    pub seqnum: u64,
    pub doc_count: u64,
    pub space_used: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docio::DocioConfig;
    use crate::filemgr::BasicFileMgr;
    use crate::hbtrie::InMemoryHbTrie;
    use crate::wal::NoTransactionsWal;

    fn new_handle() -> Arc<FileHandle<BasicFileMgr, NoTransactionsWal, InMemoryHbTrie>> {
        let dir = tempfile::tempdir().unwrap();
        let file = Arc::new(BasicFileMgr::create(dir.path().join("f"), 4096).unwrap());
        let docio = Arc::new(DocIoHandle::new(file.clone(), DocioConfig::default()));
        Arc::new(FileHandle::new(
            file,
            Arc::new(NoTransactionsWal),
            Arc::new(InMemoryHbTrie::new()),
            docio,
            Arc::new(KvDirectory::new()),
        ))
    }

    #[test]
    fn opening_default_twice_shares_resolved_comparator() {
        let fh = new_handle();
        let root = fh.kvs_open(None, KvsConfig::default()).unwrap();
        assert_eq!(root.info.id, DEFAULT_KVS_ID);
        let second = fh.kvs_open(Some(DEFAULT_KVS_NAME), KvsConfig::default()).unwrap();
        assert_eq!(second.info.id, DEFAULT_KVS_ID);
    }

    #[test]
    fn create_then_remove_then_list() {
        let fh = new_handle();
        fh.kvs_open(None, KvsConfig::default()).unwrap();
        fh.kvs_create("a", &KvsConfig::default()).unwrap();
        assert_eq!(fh.get_kvs_name_list(), vec!["default", "a"]);
        fh.kvs_remove("a").unwrap();
        assert_eq!(fh.get_kvs_name_list(), vec!["default"]);
    }

    #[test]
    fn remove_busy_while_child_open() {
        let fh = new_handle();
        fh.kvs_open(None, KvsConfig::default()).unwrap();
        fh.kvs_create("a", &KvsConfig::default()).unwrap();
        let child = fh
            .kvs_open(
                Some("a"),
                KvsConfig { create_if_missing: false, read_only: false, custom_cmp: None },
            )
            .unwrap();
        assert!(matches!(fh.kvs_remove("a"), Err(Error::KvStoreBusy(_))));
        fh.kvs_close(&child);
        fh.kvs_remove("a").unwrap();
    }

    #[test]
    fn ids_never_reused_across_create_remove() {
        let fh = new_handle();
        fh.kvs_open(None, KvsConfig::default()).unwrap();
        let a = fh.kvs_create("a", &KvsConfig::default()).unwrap();
        fh.kvs_remove("a").unwrap();
        let b = fh.kvs_create("b", &KvsConfig::default()).unwrap();
        assert!(b.id > a.id);
    }

    #[test]
    fn default_name_rejected_on_create() {
        let fh = new_handle();
        fh.kvs_open(None, KvsConfig::default()).unwrap();
        assert!(matches!(
            fh.kvs_create(DEFAULT_KVS_NAME, &KvsConfig::default()),
            Err(Error::InvalidKvInstanceName(_))
        ));
    }
}
