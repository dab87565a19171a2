//! DocIO: the document I/O layer (C2 + C3, spec §4.2–§4.3).
//!
//! Serializes variable-length documents into a fixed block-size file and
//! reads them back at a caller-supplied byte offset, splicing across block
//! boundaries as needed. Grounded on `examples/original_source/src/docio.c`
//! and generalized per `SPEC_FULL.md` §B (runtime config instead of
//! `#ifdef __CRC32` / `_DOC_COMP` / `DOCIO_BLOCK_ALIGN`).

pub mod reader;
pub mod writer;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::block::{self, BlockMarker};
use crate::compress::Codec;
use crate::filemgr::FileMgr;

/// Fixed wire width of the document header: `keylen:u16, metalen:u16,
/// bodylen:u32, flag:u8, seqnum:u64, timestamp:u64` (spec §3).
pub const HEADER_SIZE: usize = 2 + 2 + 4 + 1 + 8 + 8;

/// Width of the trailing CRC word, present iff CRC mode is enabled.
pub const CRC_SIZE: usize = 4;

/// Runtime configuration for a `DocIoHandle`. Stable across reopens of the
/// same file so old documents keep decoding the same way (spec §9 design
/// notes: these were compile-time flags in the original).
#[derive(Clone)]
pub struct DocioConfig {
    pub crc_mode: bool,
    pub compression: Option<Arc<dyn Codec>>,
    pub block_align: bool,
}

impl Default for DocioConfig {
    fn default() -> Self {
        DocioConfig {
            crc_mode: true,
            compression: None,
            block_align: false,
        }
    }
}

/// A fully assembled document, component-wise (spec §3 "Document on disk").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub key: Vec<u8>,
    pub meta: Option<Vec<u8>>,
    pub body: Option<Vec<u8>>,
    pub flag: u8,
    pub seqnum: u64,
    pub timestamp: u64,
}

impl Document {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Document {
            key: key.into(),
            meta: None,
            body: None,
            flag: 0,
            seqnum: 0,
            timestamp: 0,
        }
    }

    pub fn with_meta(mut self, meta: impl Into<Vec<u8>>) -> Self {
        self.meta = Some(meta.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_seqnum(mut self, seqnum: u64) -> Self {
        self.seqnum = seqnum;
        self
    }
}

pub(crate) struct DocHeader {
    pub keylen: u16,
    pub metalen: u16,
    pub bodylen: u32,
    pub flag: u8,
    pub seqnum: u64,
    pub timestamp: u64,
}

/// `curblock`/`curpos`: the block currently being filled and the next free
/// byte within its payload region, or `None` before the first append.
struct Cursor {
    curblock: Option<u64>,
    curpos: usize,
}

/// The one-block read-through cache DocIO reads are funneled through
/// (spec §4.1 `read_block_through_cache`).
struct BlockCache {
    lastbid: Option<u64>,
    buffer: Vec<u8>,
}

/// Per-open-file DocIO handle (spec §3 "DocIO handle").
///
/// Not `Sync` in the sense the caller might hope: the read-through cache is
/// NOT safe to share across threads without external synchronization (spec
/// §5 "Reads through the one-block cache are NOT thread-safe on a shared
/// handle"). Appends, by contrast, are serialized through `FileMgr`'s own
/// mutex and are safe to call from multiple threads.
pub struct DocIoHandle<F: FileMgr> {
    pub(crate) file: Arc<F>,
    pub(crate) config: DocioConfig,
    cursor: Mutex<Cursor>,
    cache: Mutex<BlockCache>,
}

impl<F: FileMgr> DocIoHandle<F> {
    pub fn new(file: Arc<F>, config: DocioConfig) -> Self {
        let block_size = file.block_size();
        DocIoHandle {
            file,
            config,
            cursor: Mutex::new(Cursor {
                curblock: None,
                curpos: 0,
            }),
            cache: Mutex::new(BlockCache {
                lastbid: None,
                buffer: vec![0u8; block_size],
            }),
        }
    }

    fn block_size(&self) -> usize {
        self.file.block_size()
    }

    fn effective_payload(&self) -> usize {
        block::effective_payload(self.block_size(), self.config.crc_mode)
    }

    /// §4.1 `read_block_through_cache`: refill the one-block buffer only
    /// when the requested block isn't already cached.
    fn read_through_cache(&self, bid: u64) -> crate::error::Result<()> {
        let mut cache = self.cache.lock();
        if cache.lastbid != Some(bid) {
            let block_size = self.block_size();
            if cache.buffer.len() != block_size {
                cache.buffer.resize(block_size, 0);
            }
            let buf = std::mem::take(&mut cache.buffer);
            drop(cache);
            let mut buf = buf;
            self.file.read(bid, &mut buf)?;
            let mut cache = self.cache.lock();
            cache.buffer = buf;
            cache.lastbid = Some(bid);
        }
        Ok(())
    }

    fn marker_at(&self, bid: u64) -> crate::error::Result<Option<BlockMarker>> {
        self.read_through_cache(bid)?;
        let cache = self.cache.lock();
        Ok(block::read_marker(&cache.buffer, self.block_size(), self.config.crc_mode))
    }
}

pub(crate) fn encode_header(buf: &mut Vec<u8>, h: &DocHeader) {
    use byteorder::{BigEndian, WriteBytesExt};
    buf.write_u16::<BigEndian>(h.keylen).unwrap();
    buf.write_u16::<BigEndian>(h.metalen).unwrap();
    buf.write_u32::<BigEndian>(h.bodylen).unwrap();
    buf.write_u8(h.flag).unwrap();
    buf.write_u64::<BigEndian>(h.seqnum).unwrap();
    buf.write_u64::<BigEndian>(h.timestamp).unwrap();
}

pub(crate) fn decode_header(buf: &[u8]) -> DocHeader {
    use byteorder::{BigEndian, ByteOrder};
    DocHeader {
        keylen: BigEndian::read_u16(&buf[0..2]),
        metalen: BigEndian::read_u16(&buf[2..4]),
        bodylen: BigEndian::read_u32(&buf[4..8]),
        flag: buf[8],
        seqnum: BigEndian::read_u64(&buf[9..17]),
        timestamp: BigEndian::read_u64(&buf[17..25]),
    }
}
