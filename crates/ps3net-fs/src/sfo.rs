//! PARAM.SFO parsing.
//!
//! Only the key lookup needed for PS3-mode images is implemented. See
//! <https://psdevwiki.com/ps3/PARAM.SFO> for the format. All integers are
//! little-endian.

use crate::error::{FsError, Result};

const SFO_MAGIC: [u8; 4] = [0, b'P', b'S', b'F'];
const HEADER_LEN: usize = 20;
const INDEX_ENTRY_LEN: usize = 16;

fn read_u16(data: &[u8], at: usize) -> Result<u16> {
    let raw = data
        .get(at..at + 2)
        .ok_or(FsError::CorruptSfo("truncated"))?;
    Ok(u16::from_le_bytes([raw[0], raw[1]]))
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    let raw = data
        .get(at..at + 4)
        .ok_or(FsError::CorruptSfo("truncated"))?;
    Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Looks up `field` in an in-memory PARAM.SFO and returns its value with the
/// trailing null stripped.
pub fn sfo_field(data: &[u8], field: &'static str) -> Result<String> {
    if data.get(..4) != Some(&SFO_MAGIC[..]) {
        return Err(FsError::CorruptSfo("bad magic"));
    }

    let key_table_start = read_u32(data, 8)? as usize;
    let data_table_start = read_u32(data, 12)? as usize;
    let entry_count = read_u32(data, 16)? as usize;

    for i in 0..entry_count {
        let entry_at = HEADER_LEN + i * INDEX_ENTRY_LEN;
        let key_offset = read_u16(data, entry_at)? as usize;
        let data_len = read_u32(data, entry_at + 4)? as usize;
        let data_offset = read_u32(data, entry_at + 12)? as usize;

        let key_at = key_table_start
            .checked_add(key_offset)
            .ok_or(FsError::CorruptSfo("key offset overflow"))?;
        let key_tail = data.get(key_at..).ok_or(FsError::CorruptSfo("truncated"))?;
        let key_end = key_tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(FsError::CorruptSfo("unterminated key"))?;
        if &key_tail[..key_end] != field.as_bytes() {
            continue;
        }

        // Values are null-terminated; data_len includes the terminator.
        let value_at = data_table_start
            .checked_add(data_offset)
            .ok_or(FsError::CorruptSfo("data offset overflow"))?;
        let value_len = data_len.saturating_sub(1);
        let value = data
            .get(value_at..value_at + value_len)
            .ok_or(FsError::CorruptSfo("truncated value"))?;

        return String::from_utf8(value.to_vec())
            .map_err(|_| FsError::CorruptSfo("value is not UTF-8"));
    }

    Err(FsError::SfoFieldMissing(field))
}

#[cfg(test)]
pub(crate) fn build_sfo(fields: &[(&str, &str)]) -> Vec<u8> {
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let mut entries = Vec::new();

    for (key, value) in fields {
        let key_offset = keys.len() as u16;
        let data_offset = values.len() as u32;
        keys.extend_from_slice(key.as_bytes());
        keys.push(0);
        values.extend_from_slice(value.as_bytes());
        values.push(0);

        let data_len = value.len() as u32 + 1;
        entries.push((key_offset, data_len, data_offset));
    }

    let key_table_start = (HEADER_LEN + fields.len() * INDEX_ENTRY_LEN) as u32;
    let data_table_start = key_table_start + keys.len() as u32;

    let mut out = Vec::new();
    out.extend_from_slice(&SFO_MAGIC);
    out.extend_from_slice(&[1, 1, 0, 0]); // version 1.01
    out.extend_from_slice(&key_table_start.to_le_bytes());
    out.extend_from_slice(&data_table_start.to_le_bytes());
    out.extend_from_slice(&(fields.len() as u32).to_le_bytes());

    for (key_offset, data_len, data_offset) in entries {
        out.extend_from_slice(&key_offset.to_le_bytes());
        out.extend_from_slice(&0x0204u16.to_le_bytes()); // utf-8 format
        out.extend_from_slice(&data_len.to_le_bytes());
        out.extend_from_slice(&data_len.to_le_bytes()); // max len
        out.extend_from_slice(&data_offset.to_le_bytes());
    }

    out.extend_from_slice(&keys);
    out.extend_from_slice(&values);
    out
}
