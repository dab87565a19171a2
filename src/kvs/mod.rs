//! KV-store directory and handle manager (C4 + C5 + C6, spec §4.4–§4.6).

pub mod codec;
pub mod directory;
pub mod handle;

pub use codec::KV_HEADER_KEY;
pub use directory::{Comparator, KvDirectory, KvsNode, KvsStat, DEFAULT_KVS_ID, DEFAULT_KVS_NAME};
pub use handle::{FileHandle, KvsConfig, KvsHandle, KvsInfo, KvsInfoView, KvsType};
