//! Directory-listing buffers.
//!
//! Directory and stream listings cross the metadata cache as flat byte
//! buffers, so one cached blob serves every reader regardless of its
//! pattern or resume marker. The encoding is engine-internal:
//! length-prefixed records, little-endian fixed fields.

use crate::FileAttributes;
use crate::FileInfo;

/// One directory entry as produced by the back-end.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DirEntry {
    /// Child name (no path, no separators).
    pub name: String,
    /// Metadata of the child.
    pub info: FileInfo,
}

/// One named-stream entry as produced by the back-end.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StreamEntry {
    /// Stream name, empty for the unnamed data stream.
    pub name: String,
    /// Stream size in bytes.
    pub size: u64,
    /// Allocated size in bytes.
    pub allocation_size: u64,
}

fn push_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes = buf.get(*pos..*pos + 4)?;
    *pos += 4;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_u64(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let bytes = buf.get(*pos..*pos + 8)?;
    *pos += 8;
    Some(u64::from_le_bytes(bytes.try_into().unwrap()))
}

fn read_name(buf: &[u8], pos: &mut usize) -> Option<String> {
    let len = read_u32(buf, pos)? as usize;
    let bytes = buf.get(*pos..*pos + len)?;
    *pos += len;
    String::from_utf8(bytes.to_vec()).ok()
}

/// Serialize a directory listing.
#[must_use]
pub(crate) fn encode_dir_entries(entries: &[DirEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * 64);
    for entry in entries {
        push_u32(&mut buf, entry.name.len() as u32);
        buf.extend_from_slice(entry.name.as_bytes());
        push_u32(&mut buf, entry.info.attributes.bits());
        push_u32(&mut buf, entry.info.reparse_tag);
        push_u32(&mut buf, entry.info.ea_size);
        push_u64(&mut buf, entry.info.allocation_size);
        push_u64(&mut buf, entry.info.file_size);
        push_u64(&mut buf, entry.info.creation_time);
        push_u64(&mut buf, entry.info.last_access_time);
        push_u64(&mut buf, entry.info.last_write_time);
        push_u64(&mut buf, entry.info.change_time);
        push_u64(&mut buf, entry.info.index_number);
    }
    buf
}

/// Deserialize a directory listing; `None` on a malformed buffer.
#[must_use]
pub(crate) fn decode_dir_entries(buf: &[u8]) -> Option<Vec<DirEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let name = read_name(buf, &mut pos)?;
        let attributes = FileAttributes::from_bits_truncate(read_u32(buf, &mut pos)?);
        let reparse_tag = read_u32(buf, &mut pos)?;
        let ea_size = read_u32(buf, &mut pos)?;
        let allocation_size = read_u64(buf, &mut pos)?;
        let file_size = read_u64(buf, &mut pos)?;
        let creation_time = read_u64(buf, &mut pos)?;
        let last_access_time = read_u64(buf, &mut pos)?;
        let last_write_time = read_u64(buf, &mut pos)?;
        let change_time = read_u64(buf, &mut pos)?;
        let index_number = read_u64(buf, &mut pos)?;
        entries.push(DirEntry {
            name,
            info: FileInfo {
                attributes,
                reparse_tag,
                ea_size,
                allocation_size,
                file_size,
                creation_time,
                last_access_time,
                last_write_time,
                change_time,
                index_number,
            },
        });
    }
    Some(entries)
}

/// Serialize a stream listing.
#[must_use]
pub(crate) fn encode_stream_entries(entries: &[StreamEntry]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(entries.len() * 32);
    for entry in entries {
        push_u32(&mut buf, entry.name.len() as u32);
        buf.extend_from_slice(entry.name.as_bytes());
        push_u64(&mut buf, entry.size);
        push_u64(&mut buf, entry.allocation_size);
    }
    buf
}

/// Deserialize a stream listing; `None` on a malformed buffer.
#[must_use]
pub(crate) fn decode_stream_entries(buf: &[u8]) -> Option<Vec<StreamEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        let name = read_name(buf, &mut pos)?;
        let size = read_u64(buf, &mut pos)?;
        let allocation_size = read_u64(buf, &mut pos)?;
        entries.push(StreamEntry {
            name,
            size,
            allocation_size,
        });
    }
    Some(entries)
}

/// Approximate transport size of one encoded directory entry; the
/// enumeration byte budget is counted in these.
#[must_use]
pub(crate) fn dir_entry_size(entry: &DirEntry) -> usize {
    4 + entry.name.len() + 3 * 4 + 8 * 8
}
