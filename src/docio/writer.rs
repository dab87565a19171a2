//! DocIO writer (C2, spec §4.2).
//!
//! `append_doc` is the public entry point: compress the body if configured,
//! assemble header + key + meta + body (+ CRC) into one contiguous buffer,
//! then hand it to `append_raw`, which lays the buffer across one or more
//! blocks.
//!
//! SPEC_FULL.md §D (Open Question 1) resolves the original's split between
//! `docio_append_doc_raw` (whole-buffer) and `_docio_append_doc_component`
//! (four separate calls that skip marker-stamping on intermediate
//! components) by always stamping markers and always assembling one
//! buffer first; `append_doc_system` — the per-component writer spec §4.5
//! calls for to build the KV directory document — is implemented in terms
//! of the same `append_raw`, since this crate has no pre-existing on-disk
//! files to stay bug-for-bug compatible with.

use byteorder::{BigEndian, WriteBytesExt};

use crate::block::BlockMarker;
use crate::error::{Error, Result};
use crate::filemgr::FileMgr;

use super::{encode_header, DocHeader, DocIoHandle, Document, CRC_SIZE, HEADER_SIZE};

impl<F: FileMgr> DocIoHandle<F> {
    /// Append a full document (spec §4.2 `append_doc`). Returns the
    /// document's offset: the byte position of its first header byte.
    pub fn append_doc(&self, doc: &Document) -> Result<u64> {
        let buf = self.assemble(doc)?;
        self.append_crc_and_raw(buf, BlockMarker::Document)
    }

    /// Append the KV directory system document (spec §4.5/§4.6): a document
    /// named `"KV_header\0"` with no meta and no body compression.
    pub fn append_doc_system(&self, key: &[u8], body: &[u8]) -> Result<u64> {
        let buf = Self::assemble_system_doc(key, body);
        self.append_crc_and_raw(buf, BlockMarker::SystemDoc)
    }

    /// Same as `append_doc_system`, but assumes the caller already holds
    /// `file.mutex()` (spec §5 lock ordering: file mutex -> file-handle lock
    /// -> kv_header lock). The KV handle manager's create/remove/rollback
    /// paths take the file mutex around the whole directory mutation and
    /// then persist the directory without releasing it; going through the
    /// locking `append_doc_system` from there would re-lock
    /// `parking_lot::Mutex` (not reentrant) and deadlock the thread.
    pub(crate) fn append_doc_system_locked(&self, key: &[u8], body: &[u8]) -> Result<u64> {
        let buf = Self::assemble_system_doc(key, body);
        self.append_crc_and_raw_locked(buf, BlockMarker::SystemDoc)
    }

    fn assemble_system_doc(key: &[u8], body: &[u8]) -> Vec<u8> {
        let header = DocHeader {
            keylen: key.len() as u16,
            metalen: 0,
            bodylen: body.len() as u32,
            flag: 0,
            seqnum: 0,
            timestamp: 0,
        };
        let mut buf = Vec::with_capacity(HEADER_SIZE + key.len() + body.len() + CRC_SIZE);
        encode_header(&mut buf, &header);
        buf.extend_from_slice(key);
        buf.extend_from_slice(body);
        buf
    }

    fn assemble(&self, doc: &Document) -> Result<Vec<u8>> {
        if doc.key.is_empty() || doc.key.len() > u16::MAX as usize {
            return Err(Error::InvalidArgs);
        }
        let meta = doc.meta.clone().unwrap_or_default();
        if meta.len() > u16::MAX as usize {
            return Err(Error::InvalidArgs);
        }

        // §4.2 step 1: compress the body first; bodylen reflects the
        // compressed size on disk.
        let body = match (&self.config.compression, &doc.body) {
            (Some(codec), Some(body)) if !body.is_empty() => codec.compress(body)?,
            (_, Some(body)) => body.clone(),
            (_, None) => Vec::new(),
        };

        let header = DocHeader {
            keylen: doc.key.len() as u16,
            metalen: meta.len() as u16,
            bodylen: body.len() as u32,
            flag: doc.flag,
            seqnum: doc.seqnum,
            timestamp: doc.timestamp,
        };

        let mut buf = Vec::with_capacity(
            HEADER_SIZE + doc.key.len() + meta.len() + body.len() + CRC_SIZE,
        );
        encode_header(&mut buf, &header);
        buf.extend_from_slice(&doc.key);
        buf.extend_from_slice(&meta);
        buf.extend_from_slice(&body);
        Ok(buf)
    }

    fn append_crc_and_raw(&self, buf: Vec<u8>, marker: BlockMarker) -> Result<u64> {
        let _file_guard = self.file.mutex().lock();
        self.append_crc_and_raw_locked(buf, marker)
    }

    /// Same as `append_crc_and_raw`, assuming the caller already holds
    /// `file.mutex()`.
    fn append_crc_and_raw_locked(&self, mut buf: Vec<u8>, marker: BlockMarker) -> Result<u64> {
        if self.config.crc_mode {
            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buf);
            let crc = hasher.finalize();
            buf.write_u32::<BigEndian>(crc).unwrap();
        }
        self.append_raw(&buf, marker)
    }

    /// §4.2 `append_raw`: lay `buf` into the file starting wherever the
    /// cursor currently is, allocating fresh blocks as needed, spanning
    /// multiple blocks if `buf` doesn't fit in what's left of the current
    /// one. Returns the offset of the first byte written. Assumes the
    /// caller already holds `file.mutex()` — both `append_crc_and_raw` and
    /// `append_crc_and_raw_locked` take it (or require it held) before
    /// reaching here, so this never locks it itself.
    fn append_raw(&self, buf: &[u8], marker: BlockMarker) -> Result<u64> {
        let block_size = self.block_size() as u64;
        let payload = self.effective_payload() as u64;
        let size = buf.len() as u64;

        let mut cursor = self.cursor.lock();
        if cursor.curblock.map_or(true, |b| !self.file.is_writable(b)) {
            cursor.curblock = Some(self.file.alloc()?);
            cursor.curpos = 0;
        }
        let curblock = cursor.curblock.unwrap();
        let curpos = cursor.curpos as u64;

        if size <= payload - curpos {
            self.file.write_offset(curblock, curpos as usize, buf)?;
            self.invalidate_cache(curblock);
            self.stamp(curblock, marker)?;
            cursor.curpos += size as usize;
            return Ok(curblock * block_size + curpos);
        }

        let nblock = size / payload;
        let remain = size % payload;
        let tail = payload - curpos;

        // "Continue from current block" unless the allocator moved
        // elsewhere since we last looked, or (with block-align enabled)
        // spanning into the tail would land awkwardly (spec §4.2).
        let continue_here = self.file.get_next_alloc_block() == curblock + 1
            && (!self.config.block_align || remain <= tail);

        let (begin, end, mut written, start_offset);
        if continue_here && tail > 0 {
            let need = nblock + u64::from(remain > tail);
            let (b, e) = self.file.alloc_multiple(need)?;
            begin = b;
            end = e;
            log::debug!(
                "document of {size} bytes spans blocks {curblock}..={end}, continuing from the current block"
            );
            self.file.write_offset(curblock, curpos as usize, &buf[..tail as usize])?;
            self.invalidate_cache(curblock);
            self.stamp(curblock, marker)?;
            written = tail;
            start_offset = curblock * block_size + curpos;
        } else {
            // Either the allocator moved past `curblock` since we last
            // looked, or `curblock` is already exactly full (`tail == 0`,
            // nothing left to write into it) — either way the document
            // starts fresh at the first newly allocated block rather than
            // pointing at or past `curblock`'s payload boundary.
            let need = nblock + u64::from(remain > 0);
            let (b, e) = self.file.alloc_multiple(need)?;
            begin = b;
            end = e;
            written = 0;
            start_offset = begin * block_size;
            log::debug!(
                "document of {size} bytes starts fresh at block {begin}; {} bytes of slack left behind at block {curblock}",
                payload - curpos
            );
        }

        let mut bid = begin;
        let mut new_curpos = 0u64;
        while bid <= end {
            let remainsize = size - written;
            let chunk_len = remainsize.min(payload);
            let chunk = &buf[written as usize..(written + chunk_len) as usize];
            self.file.write_offset(bid, 0, chunk)?;
            self.invalidate_cache(bid);
            self.stamp(bid, marker)?;
            written += chunk_len;
            new_curpos = chunk_len;
            bid += 1;
        }

        cursor.curblock = Some(end);
        cursor.curpos = new_curpos as usize;

        Ok(start_offset)
    }

    fn stamp(&self, bid: u64, marker: BlockMarker) -> Result<()> {
        if self.config.crc_mode {
            let block_size = self.block_size();
            self.file
                .write_offset(bid, block_size - crate::block::BLOCK_MARKER_SIZE, &[marker as u8])?;
            self.invalidate_cache(bid);
        }
        Ok(())
    }

    fn invalidate_cache(&self, bid: u64) {
        let mut cache = self.cache.lock();
        if cache.lastbid == Some(bid) {
            cache.lastbid = None;
        }
    }
}

