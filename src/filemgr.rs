//! `FileMgr`: the block-allocating file manager DocIO and the KV handle
//! manager sit on top of (spec §6). Out of scope per §1 — this module only
//! defines the contract those two subsystems actually call, plus a minimal
//! reference implementation (`BasicFileMgr`) so the crate is runnable and
//! testable without a real compactor wired in.
//!
//! Grounded on the `filemgr_*` call sites in
//! `examples/original_source/src/docio.c` and `kv_instance.cc`, and on the
//! positioned-I/O pattern in the teacher's `engines/kv/writer.rs` /
//! `reader.rs` (`BufWriterWithPos`/`BufReaderWithPos`).

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;

use crate::error::{Error, Result};

/// Where a file currently stands with respect to a background compaction.
/// C6's create/remove/rollback flows restart their retry loop unless the
/// file is in `Normal` or `CompactNew` (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Normal,
    CompactOld,
    CompactNew,
    RemovedPending,
}

/// The contract DocIO (C2/C3) and the KV handle manager (C6) need from the
/// block-allocating file manager. A real implementation additionally owns
/// free-space reclamation, which is entirely out of scope here (§1).
pub trait FileMgr: Send + Sync {
    fn block_size(&self) -> usize;

    /// Allocate one fresh block, returning its id.
    fn alloc(&self) -> Result<u64>;

    /// Allocate `n` consecutive fresh blocks, returning `(begin, end)`
    /// inclusive — callers iterate `begin..=end`.
    fn alloc_multiple(&self, n: u64) -> Result<(u64, u64)>;

    /// The block id the *next* single `alloc()` would hand out, without
    /// allocating it. Used to detect whether another writer interleaved an
    /// allocation since the caller last looked (spec §4.2).
    fn get_next_alloc_block(&self) -> u64;

    /// Whether `bid` is still the open, appendable tail block (false once a
    /// concurrent commit has sealed it).
    fn is_writable(&self, bid: u64) -> bool;

    fn write(&self, bid: u64, buf: &[u8]) -> Result<()>;
    fn write_offset(&self, bid: u64, offset: usize, buf: &[u8]) -> Result<()>;
    fn read(&self, bid: u64, buf: &mut [u8]) -> Result<()>;

    fn get_seqnum(&self) -> u64;
    fn set_seqnum(&self, seqnum: u64);

    fn get_file_status(&self) -> FileStatus;
    fn set_rollback(&self, on: bool);
    fn is_rollback_on(&self) -> bool;

    /// The root block id of whatever dirty index tree a collaborator last
    /// flushed, if any. Consumed only by C6 when persisting the directory
    /// alongside the index roots (§4.6 "syncing dirty index roots").
    fn get_dirty_root(&self) -> Option<u64>;

    /// The file mutex (§5 lock ordering: file mutex -> file-handle lock ->
    /// kv_header lock). Callers take this around any mutation sequence that
    /// touches on-disk state.
    fn mutex(&self) -> &Mutex<()>;
}

struct State {
    next_block: u64,
    seqnum: u64,
    status: FileStatus,
    rollback: bool,
    dirty_root: Option<u64>,
}

/// A single-file, linear-allocation reference `FileMgr`. No compaction, no
/// free-list reuse: every `alloc` extends the file. Sufficient to exercise
/// DocIO and the KV directory/handle manager end to end.
pub struct BasicFileMgr {
    file: Mutex<File>,
    file_mutex: Mutex<()>,
    block_size: usize,
    state: Mutex<State>,
}

impl BasicFileMgr {
    pub fn create(path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(BasicFileMgr {
            file: Mutex::new(file),
            file_mutex: Mutex::new(()),
            block_size,
            state: Mutex::new(State {
                next_block: 0,
                seqnum: 0,
                status: FileStatus::Normal,
                rollback: false,
                dirty_root: None,
            }),
        })
    }

    fn grow_to(&self, file: &mut File, through_block: u64) -> Result<()> {
        let needed = (through_block + 1) * self.block_size as u64;
        if file.metadata()?.len() < needed {
            file.set_len(needed)?;
        }
        Ok(())
    }

    pub fn set_dirty_root(&self, bid: Option<u64>) {
        self.state.lock().dirty_root = bid;
    }

    pub fn set_file_status(&self, status: FileStatus) {
        self.state.lock().status = status;
    }
}

impl FileMgr for BasicFileMgr {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn alloc(&self) -> Result<u64> {
        let (begin, _end) = self.alloc_multiple(1)?;
        Ok(begin)
    }

    fn alloc_multiple(&self, n: u64) -> Result<(u64, u64)> {
        if n == 0 {
            return Err(Error::InvalidArgs);
        }
        let mut state = self.state.lock();
        let begin = state.next_block;
        let end = begin + n - 1;
        state.next_block = end + 1;
        drop(state);

        let mut file = self.file.lock();
        self.grow_to(&mut file, end)?;
        log::debug!("allocated blocks {begin}..={end} ({n} block(s), {} bytes each)", self.block_size);
        Ok((begin, end))
    }

    fn get_next_alloc_block(&self) -> u64 {
        self.state.lock().next_block
    }

    fn is_writable(&self, bid: u64) -> bool {
        bid < self.state.lock().next_block
    }

    fn write(&self, bid: u64, buf: &[u8]) -> Result<()> {
        self.write_offset(bid, 0, buf)
    }

    fn write_offset(&self, bid: u64, offset: usize, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        self.grow_to(&mut file, bid)?;
        file.seek(SeekFrom::Start(bid * self.block_size as u64 + offset as u64))?;
        file.write_all(buf)?;
        Ok(())
    }

    fn read(&self, bid: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(bid * self.block_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn get_seqnum(&self) -> u64 {
        self.state.lock().seqnum
    }

    fn set_seqnum(&self, seqnum: u64) {
        self.state.lock().seqnum = seqnum;
    }

    fn get_file_status(&self) -> FileStatus {
        self.state.lock().status
    }

    fn set_rollback(&self, on: bool) {
        if on {
            log::warn!("rollback flag set; writers will be refused until it clears");
        }
        self.state.lock().rollback = on;
    }

    fn is_rollback_on(&self) -> bool {
        self.state.lock().rollback
    }

    fn get_dirty_root(&self) -> Option<u64> {
        self.state.lock().dirty_root
    }

    fn mutex(&self) -> &Mutex<()> {
        &self.file_mutex
    }
}
