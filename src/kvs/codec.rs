//! KV directory codec (C5, spec §4.5): export/import the directory to/from
//! the body of the `"KV_header\0"` system document. Every integer is
//! big-endian; `name_len` includes the NUL terminator, matching
//! `_fdb_kvs_header_export`/`_import` in `original_source/src/kv_instance.cc`.

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{Error, Result};

use super::directory::{KvDirectory, KvsNode, KvsStat};

/// The literal key the directory document is stored under.
pub const KV_HEADER_KEY: &[u8] = b"KV_header\0";

const RECORD_FIXED_LEN: usize = 8 * 6; // id, seqnum, nlivenodes, ndocs, datasize, flags

/// Serialize the directory's current snapshot. Iterates the by-name index
/// for a deterministic byte layout.
pub fn export(dir: &KvDirectory) -> Vec<u8> {
    let (id_counter, nodes) = dir.export_snapshot();
    let mut buf = Vec::new();
    buf.write_u64::<BigEndian>(nodes.len() as u64).unwrap();
    buf.write_u64::<BigEndian>(id_counter).unwrap();
    for node in &nodes {
        encode_node(&mut buf, node);
    }
    buf
}

fn encode_node(buf: &mut Vec<u8>, node: &KvsNode) {
    let mut name = node.name.clone().into_bytes();
    name.push(0);
    buf.write_u16::<BigEndian>(name.len() as u16).unwrap();
    buf.extend_from_slice(&name);
    buf.write_u64::<BigEndian>(node.id).unwrap();
    buf.write_u64::<BigEndian>(node.seqnum).unwrap();
    buf.write_u64::<BigEndian>(node.stat.nlivenodes).unwrap();
    buf.write_u64::<BigEndian>(node.stat.ndocs).unwrap();
    buf.write_u64::<BigEndian>(node.stat.datasize).unwrap();
    buf.write_u64::<BigEndian>(node.flags).unwrap();
}

/// Parse a directory document body into `(id_counter, nodes)`. Comparators
/// are never stored on disk (`custom_cmp` is always `None` here); they are
/// re-bound at handle-open time from the file handle's cmp-func list (spec
/// §4.5).
pub fn import(buf: &[u8]) -> Result<(u64, Vec<KvsNode>)> {
    if buf.len() < 16 {
        return Err(Error::InvalidArgs);
    }
    let n_kvs = BigEndian::read_u64(&buf[0..8]);
    let id_counter = BigEndian::read_u64(&buf[8..16]);
    let mut rest = &buf[16..];

    let mut nodes = Vec::with_capacity(n_kvs as usize);
    for _ in 0..n_kvs {
        if rest.len() < 2 {
            return Err(Error::InvalidArgs);
        }
        let name_len = BigEndian::read_u16(&rest[0..2]) as usize;
        rest = &rest[2..];
        if name_len == 0 || rest.len() < name_len + RECORD_FIXED_LEN {
            return Err(Error::InvalidArgs);
        }
        let name_bytes = &rest[..name_len - 1]; // drop the NUL terminator
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| Error::InvalidArgs)?
            .to_string();
        rest = &rest[name_len..];

        let id = BigEndian::read_u64(&rest[0..8]);
        let seqnum = BigEndian::read_u64(&rest[8..16]);
        let nlivenodes = BigEndian::read_u64(&rest[16..24]);
        let ndocs = BigEndian::read_u64(&rest[24..32]);
        let datasize = BigEndian::read_u64(&rest[32..40]);
        let flags = BigEndian::read_u64(&rest[40..48]);
        rest = &rest[RECORD_FIXED_LEN..];

        nodes.push(KvsNode {
            id,
            name,
            seqnum,
            flags,
            stat: KvsStat {
                nlivenodes,
                ndocs,
                datasize,
                wal_ndocs: 0,
                wal_ndeletes: 0,
            },
            custom_cmp: None,
        });
    }
    Ok((id_counter, nodes))
}

/// Overwrite `dir`'s contents with a freshly parsed buffer.
pub fn import_into(dir: &KvDirectory, buf: &[u8]) -> Result<()> {
    let (id_counter, nodes) = import(buf)?;
    dir.import_snapshot(id_counter, nodes);
    Ok(())
}
