//! ISO9660 (ECMA-119) on-disk structures and identifier handling.
//!
//! Only what the virtual image synthesizer emits is modeled: volume
//! descriptors, directory records, path-table entries, the two timestamp
//! encodings and the a/d/d1 identifier character sets with the Joliet
//! (UCS-2BE) re-encoding.

use std::time::SystemTime;

use crate::encoder::IsoEncoder;
use crate::error::FsError;
use crate::size::{ByteCount, SectorCount, SECTOR_SIZE};

pub(crate) const STANDARD_IDENTIFIER: &[u8; 5] = b"CD001";

pub(crate) const VOLUME_TYPE_PRIMARY: u8 = 1;
pub(crate) const VOLUME_TYPE_SUPPLEMENTARY: u8 = 2;
pub(crate) const VOLUME_TYPE_TERMINATOR: u8 = 255;

/// Joliet level 3 escape sequence carried by the supplementary descriptor.
pub(crate) const JOLIET_ESCAPE_SEQUENCES: &[u8] = b"%/@";

pub(crate) const DIR_FLAG_DIR: u8 = 1 << 1;
pub(crate) const DIR_FLAG_MULTI_EXTENT: u8 = 1 << 7;

/// Path tables address parents with a 16-bit ordinal.
pub(crate) const PATH_TABLE_MAX_ENTRIES: usize = 0x10000;

/// Identifier of the `.` entry and of the root directory in path tables.
pub(crate) const DOT_IDENTIFIER: &[u8] = &[0x00];
/// Identifier of the `..` entry.
pub(crate) const DOT_DOT_IDENTIFIER: &[u8] = &[0x01];

const A_CHARACTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_!\"%&'()*+,-./:;<=>?";
const D_CHARACTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";
// ECMA-119 7.4.2.2 leaves d1-characters "subject to agreement between the
// originator and the recipient of the volume"; this is the set PS3 discs use.
const D1_CHARACTERS: &str =
    "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_!\"%&'()*+,-./:;<=>?";

/// Directory record, ECMA-119 9.1.
#[derive(Debug, Clone, Default)]
pub(crate) struct DirectoryRecord {
    pub extent_location: SectorCount,
    pub extent_length: ByteCount,
    pub recording_time: [u8; 7],
    pub file_flags: u8,
    pub volume_sequence_number: u16,
    pub identifier: Vec<u8>,
}

impl DirectoryRecord {
    pub fn encoded_len(&self) -> ByteCount {
        let id_len = self.identifier.len();
        let id_pad = (id_len + 1) % 2;
        ByteCount((33 + id_len + id_pad) as u64)
    }

    pub fn encode(&self, enc: &mut IsoEncoder) -> Result<(), FsError> {
        let total = self.encoded_len().0;
        if total > 255 {
            return Err(FsError::IdentifierTooLong(
                String::from_utf8_lossy(&self.identifier).into_owned(),
            ));
        }

        let id_len = self.identifier.len();
        enc.push_u8(total as u8);
        enc.push_u8(0); // extended attribute record length
        enc.push_u32_lsb_msb(self.extent_location.0);
        enc.push_u32_lsb_msb(self.extent_length.0 as u32);
        enc.push_bytes(&self.recording_time);
        enc.push_u8(self.file_flags);
        enc.push_u8(0); // interleave unit size
        enc.push_u8(0); // interleave gap size
        enc.push_u16_lsb_msb(self.volume_sequence_number);
        enc.push_u8(id_len as u8);
        enc.push_bytes(&self.identifier);
        if (id_len + 1) % 2 == 1 {
            enc.push_u8(0);
        }
        Ok(())
    }

    /// The record as the 34-byte field embedded in a volume descriptor.
    fn encode_embedded(&self) -> Result<Vec<u8>, FsError> {
        let mut enc = IsoEncoder::new();
        self.encode(&mut enc)?;
        Ok(enc.into_bytes())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Endian {
    Little,
    Big,
}

/// Path table record, ECMA-119 9.4. The table is emitted twice, once per byte
/// order.
#[derive(Debug, Clone)]
pub(crate) struct PathTableEntry {
    pub dir_location: SectorCount,
    pub parent_number: u16,
    pub identifier: Vec<u8>,
}

impl PathTableEntry {
    pub fn encoded_len(&self) -> ByteCount {
        ByteCount((8 + self.identifier.len() + self.identifier.len() % 2) as u64)
    }

    pub fn encode(&self, enc: &mut IsoEncoder, order: Endian) {
        enc.push_u8(self.identifier.len() as u8);
        enc.push_u8(0); // extended attribute record length
        match order {
            Endian::Little => {
                enc.push_u32_le(self.dir_location.0);
                enc.push_u16_le(self.parent_number);
            }
            Endian::Big => {
                enc.push_u32_be(self.dir_location.0);
                enc.push_u16_be(self.parent_number);
            }
        }
        enc.push_bytes(&self.identifier);
        if self.identifier.len() % 2 == 1 {
            enc.push_u8(0);
        }
    }
}

pub(crate) fn path_table_len(entries: &[PathTableEntry]) -> ByteCount {
    ByteCount(entries.iter().map(|e| e.encoded_len().0).sum())
}

/// Primary or supplementary volume descriptor, ECMA-119 8.4 / 8.5.
#[derive(Debug, Clone)]
pub(crate) struct VolumeDescriptor {
    pub volume_type: u8,
    pub system_identifier: Vec<u8>,
    pub volume_identifier: Vec<u8>,
    pub volume_space_size: SectorCount,
    /// Only set on the Joliet supplementary descriptor.
    pub escape_sequences: &'static [u8],
    pub path_table_size: ByteCount,
    pub type_l_path_table: SectorCount,
    pub type_m_path_table: SectorCount,
    pub root_record: DirectoryRecord,
    pub volume_set_identifier: Vec<u8>,
    pub application_identifier: &'static str,
    pub created_at: [u8; 17],
    pub modified_at: [u8; 17],
}

impl VolumeDescriptor {
    /// Encodes the full 2048-byte descriptor sector.
    pub fn encode(&self, enc: &mut IsoEncoder) -> Result<(), FsError> {
        let mut sector = [0u8; SECTOR_SIZE as usize];

        sector[0] = self.volume_type;
        sector[1..6].copy_from_slice(STANDARD_IDENTIFIER);
        sector[6] = 1; // version

        write_at(&mut sector, 8, &self.system_identifier, 32);
        write_at(&mut sector, 40, &self.volume_identifier, 32);

        sector[80..84].copy_from_slice(&self.volume_space_size.0.to_le_bytes());
        sector[84..88].copy_from_slice(&self.volume_space_size.0.to_be_bytes());
        write_at(&mut sector, 88, self.escape_sequences, 32);

        // Volume set size 1, sequence number 1, logical block size 2048.
        sector[120..122].copy_from_slice(&1u16.to_le_bytes());
        sector[122..124].copy_from_slice(&1u16.to_be_bytes());
        sector[124..126].copy_from_slice(&1u16.to_le_bytes());
        sector[126..128].copy_from_slice(&1u16.to_be_bytes());
        sector[128..130].copy_from_slice(&(SECTOR_SIZE as u16).to_le_bytes());
        sector[130..132].copy_from_slice(&(SECTOR_SIZE as u16).to_be_bytes());

        sector[132..136].copy_from_slice(&(self.path_table_size.0 as u32).to_le_bytes());
        sector[136..140].copy_from_slice(&(self.path_table_size.0 as u32).to_be_bytes());
        sector[140..144].copy_from_slice(&self.type_l_path_table.0.to_le_bytes());
        // Optional type-L table at 144..148 stays zero.
        sector[148..152].copy_from_slice(&self.type_m_path_table.0.to_be_bytes());
        // Optional type-M table at 152..156 stays zero.

        let root = self.root_record.encode_embedded()?;
        write_at(&mut sector, 156, &root, 34);

        write_at(&mut sector, 190, &self.volume_set_identifier, 128);
        // Publisher (318) and data preparer (446) identifiers stay zero.
        write_at(&mut sector, 574, self.application_identifier.as_bytes(), 128);

        sector[813..830].copy_from_slice(&self.created_at);
        sector[830..847].copy_from_slice(&self.modified_at);
        // Expiration (847) and effective (864) timestamps stay zero.

        sector[881] = 1; // file structure version

        enc.push_bytes(&sector);
        Ok(())
    }

    /// Encodes the 2048-byte volume descriptor set terminator.
    pub fn encode_terminator(enc: &mut IsoEncoder) {
        let mut sector = [0u8; SECTOR_SIZE as usize];
        sector[0] = VOLUME_TYPE_TERMINATOR;
        sector[1..6].copy_from_slice(STANDARD_IDENTIFIER);
        enc.push_bytes(&sector);
    }
}

fn write_at(sector: &mut [u8], at: usize, bytes: &[u8], width: usize) {
    let used = bytes.len().min(width);
    sector[at..at + used].copy_from_slice(&bytes[..used]);
}

/// Whole seconds since the unix epoch plus the sub-second nanos, both in
/// UTC. Pre-epoch times round down to whole seconds.
fn unix_parts(t: SystemTime) -> (i64, u32) {
    match t.duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(err) => (-(err.duration().as_secs() as i64), 0),
    }
}

/// Calendar decomposition of a unix timestamp in UTC:
/// `(year, month, day, hour, minute, second)`. Proleptic Gregorian,
/// era-based (an era is the 146097-day cycle of 400 Gregorian years).
fn civil_from_unix(secs: i64) -> (i64, u8, u8, u8, u8, u8) {
    let days = secs.div_euclid(86_400);
    let time = secs.rem_euclid(86_400);

    let z = days + 719_468; // shift epoch from 1970-01-01 to 0000-03-01
    let era = z.div_euclid(146_097);
    let doe = z - era * 146_097; // day of era, [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365; // [0, 399]
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // day of year, March-based
    let mp = (5 * doy + 2) / 153; // month index, [0, 11]
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = yoe + era * 400 + i64::from(month <= 2);

    (
        year,
        month as u8,
        day as u8,
        (time / 3600) as u8,
        (time % 3600 / 60) as u8,
        (time % 60) as u8,
    )
}

/// ECMA-119 9.1.5 directory record timestamp: 7 bytes, offset in quarter
/// hours. Times are recorded in UTC (offset 0).
pub(crate) fn recording_timestamp(t: SystemTime) -> [u8; 7] {
    let (year, month, day, hour, minute, second) = civil_from_unix(unix_parts(t).0);
    [
        (year - 1900).clamp(0, 255) as u8,
        month,
        day,
        hour,
        minute,
        second,
        0,
    ]
}

/// ECMA-119 8.4.26.1 volume descriptor timestamp: `YYYYMMDDHHMMSSHH` digits
/// plus the quarter-hour offset byte.
pub(crate) fn volume_timestamp(t: SystemTime) -> [u8; 17] {
    let (secs, nanos) = unix_parts(t);
    let (year, month, day, hour, minute, second) = civil_from_unix(secs);
    let formatted = format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}{:02}",
        year.clamp(0, 9999),
        month,
        day,
        hour,
        minute,
        second,
        nanos / 10_000_000,
    );
    let mut out = [0u8; 17];
    out[..16].copy_from_slice(formatted.as_bytes());
    out[16] = 0; // UTC
    out
}

fn ucs2_be(s: &str) -> Vec<u8> {
    s.encode_utf16().flat_map(|unit| unit.to_be_bytes()).collect()
}

fn mangle(s: &str, allowed: &str, uppercase_into_set: bool) -> String {
    s.chars()
        .map(|c| {
            if allowed.contains(c) {
                c
            } else if uppercase_into_set {
                let upper = c.to_ascii_uppercase();
                if allowed.contains(upper) {
                    upper
                } else {
                    '_'
                }
            } else {
                '_'
            }
        })
        .collect()
}

/// Maps to a-characters (ECMA-119 7.4.1), UCS-2BE encoded for Joliet.
pub(crate) fn mangle_a(s: &str, joliet: bool) -> Vec<u8> {
    let mangled = mangle(s, A_CHARACTERS, true);
    if joliet {
        ucs2_be(&mangled)
    } else {
        mangled.into_bytes()
    }
}

/// Maps to d-characters (ECMA-119 7.4.1), UCS-2BE encoded for Joliet.
pub(crate) fn mangle_d(s: &str, joliet: bool) -> Vec<u8> {
    let mangled = mangle(s, D_CHARACTERS, true);
    if joliet {
        ucs2_be(&mangled)
    } else {
        mangled.into_bytes()
    }
}

/// Maps to the agreed d1-character set, UCS-2BE encoded for Joliet.
pub(crate) fn mangle_d1(s: &str, joliet: bool) -> Vec<u8> {
    let mangled = mangle(s, D1_CHARACTERS, false);
    if joliet {
        ucs2_be(&mangled)
    } else {
        mangled.into_bytes()
    }
}

/// File and directory identifiers: plain ISO9660 names are uppercased before
/// mangling, Joliet names keep their case.
pub(crate) fn make_identifier(name: &str, joliet: bool) -> Vec<u8> {
    if joliet {
        mangle_d1(name, true)
    } else {
        mangle_d1(&name.to_uppercase(), false)
    }
}
