//! `HbTrie`: the HB+trie index collaborator (§1 out of scope, §6 contract).
//!
//! `kvs::handle` calls into this to remove a KVS's sub-trie on `kvs_remove`
//! (`hbtrie_remove_partial(kv_id_prefix)`, spec §4.6) and to restore it on
//! `kvs_rollback` (§4.6: "read the KVS's sub-trie roots ... from the
//! temporary handle and overwrite the current root handle's sub-tries for
//! that KVS ID"). The trie's own block layout, node format, and B-tree
//! backing store are entirely out of scope.

use crate::error::Result;

/// A chunk-keyed partial trie, prefixed by a big-endian-encoded KVS id
/// (spec §6: "a `kv_id` chunk prefix").
pub trait HbTrie: Send + Sync {
    fn find_partial(&self, kv_id: u64, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Insert `key` -> `value` into `kv_id`'s sub-trie, recorded against
    /// `seqnum` so a later `rollback_partial` can undo it.
    fn insert_partial(&self, kv_id: u64, key: &[u8], value: &[u8], seqnum: u64) -> Result<()>;

    fn remove_partial(&self, kv_id: u64) -> Result<()>;

    /// Restore `kv_id`'s sub-trie to the state it held at `seqnum`: every
    /// insert recorded against a later seqnum is undone, restoring whatever
    /// value (or absence of one) it had overwritten (spec §4.6
    /// `kvs_rollback`).
    fn rollback_partial(&self, kv_id: u64, seqnum: u64) -> Result<()>;
}

/// One prior state of a `(kv_id, key)` entry, recorded immediately before an
/// `insert_partial` call overwrote it, so `rollback_partial` can restore it.
struct HistEntry {
    kv_id: u64,
    key: Vec<u8>,
    seqnum: u64,
    prev: Option<Vec<u8>>,
}

/// An in-memory stand-in sufficient to exercise `kvs_create`/`kvs_remove`/
/// `kvs_rollback`'s interaction with the trie without a real B-tree block
/// layer backing it. Keeps a linear undo log per insert so rollback can
/// actually restore prior sub-trie contents rather than only bookkeeping a
/// seqnum counter elsewhere.
#[derive(Default)]
pub struct InMemoryHbTrie {
    entries: parking_lot::Mutex<std::collections::BTreeMap<(u64, Vec<u8>), Vec<u8>>>,
    history: parking_lot::Mutex<Vec<HistEntry>>,
}

impl InMemoryHbTrie {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HbTrie for InMemoryHbTrie {
    fn find_partial(&self, kv_id: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(&(kv_id, key.to_vec())).cloned())
    }

    fn insert_partial(&self, kv_id: u64, key: &[u8], value: &[u8], seqnum: u64) -> Result<()> {
        let mut entries = self.entries.lock();
        let prev = entries.insert((kv_id, key.to_vec()), value.to_vec());
        self.history.lock().push(HistEntry { kv_id, key: key.to_vec(), seqnum, prev });
        Ok(())
    }

    fn remove_partial(&self, kv_id: u64) -> Result<()> {
        self.entries.lock().retain(|(id, _), _| *id != kv_id);
        self.history.lock().retain(|h| h.kv_id != kv_id);
        Ok(())
    }

    fn rollback_partial(&self, kv_id: u64, seqnum: u64) -> Result<()> {
        let mut history = self.history.lock();
        let mut entries = self.entries.lock();
        // Undo the most recent inserts first, in case the same key was
        // written more than once after `seqnum`.
        let mut i = history.len();
        while i > 0 {
            i -= 1;
            let recent = &history[i];
            if recent.kv_id != kv_id || recent.seqnum <= seqnum {
                continue;
            }
            let h = history.remove(i);
            match h.prev {
                Some(prev) => {
                    entries.insert((h.kv_id, h.key), prev);
                }
                None => {
                    entries.remove(&(h.kv_id, h.key));
                }
            }
        }
        Ok(())
    }
}
