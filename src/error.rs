//! Stable error surface for the DocIO and KV-directory subsystems (spec §6/§7).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the file/KVS handle manager (C6) and the components it
/// sits on. Variants track the stable enum named in §6 one-for-one; a few
/// extra variants (`NameExists`, `NotFound`) are internal to the in-memory
/// directory (C4) and are mapped onto the public ones at the C6 boundary.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid handle")]
    InvalidHandle,

    #[error("invalid arguments")]
    InvalidArgs,

    #[error("invalid configuration")]
    InvalidConfig,

    #[error("invalid KV store instance name: {0:?}")]
    InvalidKvInstanceName(String),

    #[error("invalid comparator function for KVS id {0}")]
    InvalidCmpFunction(u64),

    #[error("KV store busy: {0:?}")]
    KvStoreBusy(String),

    #[error("KV store not found: {0:?}")]
    KvStoreNotFound(String),

    #[error("operation not permitted on a read-only file")]
    RonlyViolation,

    #[error("block allocation failed")]
    AllocFail,

    #[error("failed: rollback is in progress on this file")]
    FailByRollback,

    #[error("failed: compaction is in progress on this file")]
    FailByCompaction,

    #[error("failed: an active transaction exists on this file")]
    FailByTransaction,

    #[error("no database instance is open")]
    NoDbInstance,

    #[error("CRC mismatch reading document at offset {0}")]
    CrcMismatch(u64),

    #[error("offset {0} does not reference a document block")]
    NotADocument(u64),

    /// Internal to `kvs::directory`; C6 turns this into `InvalidKvInstanceName`.
    #[error("a KVS named {0:?} already exists")]
    NameExists(String),

    /// Internal to `kvs::directory`; C6 turns this into `KvStoreNotFound`.
    #[error("not found")]
    NotFound,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
