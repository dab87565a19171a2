//! Body compression codec (§3, §4.2 step 1; §4.3 step 4).
//!
//! `original_source/src/docio.c`'s `_DOC_COMP` path calls `snappy_compress`/
//! `snappy_uncompress` directly; this crate exposes the same capability
//! through the `snap` crate behind a small `Codec` trait so `DocioConfig`
//! can hold `Option<Box<dyn Codec>>` instead of a compile-time flag
//! (SPEC_FULL.md §B, spec.md §9).

use crate::error::{Error, Result};

/// A body (de)compression scheme. `bodylen` on disk always reflects the
/// *compressed* size; the decoder recovers the uncompressed length from its
/// own framing (snappy's varint length prefix), never from the document
/// header.
pub trait Codec: Send + Sync {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>>;
    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>>;
}

/// Google Snappy, via the pure-Rust `snap` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct Snappy;

impl Codec for Snappy {
    fn compress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = snap::raw::Encoder::new();
        encoder
            .compress_vec(input)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    fn decompress(&self, input: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = snap::raw::Decoder::new();
        decoder
            .decompress_vec(input)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }
}
