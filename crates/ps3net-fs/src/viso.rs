//! On-the-fly ISO9660 + Joliet image synthesis.
//!
//! A [`VirtualIso`] is a seekable, read-only byte stream that looks like a
//! mastered disc image of a directory tree. The image address space is:
//!
//! ```text
//! [0, fs_buf)             system area, volume descriptors, path tables and
//!                         directory records, encoded in memory up front
//! [fs_buf, pad_start)     file payloads, streamed from disk on demand; each
//!                         file's span is rounded up to whole sectors
//! [pad_start, total)      zero padding up to a 32-sector boundary plus an
//!                         extra 32 sectors
//! ```
//!
//! In PS3 mode the first two system-area sectors hold the disc-ranges and
//! disc-info records a console expects, with the product id taken from
//! `PS3_GAME/PARAM.SFO`.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use rand::RngCore;

use crate::encoder::IsoEncoder;
use crate::error::{FsError, Result};
use crate::file::read_full_at;
use crate::iso9660::{
    make_identifier, mangle_a, mangle_d, path_table_len, recording_timestamp, volume_timestamp,
    DirectoryRecord, Endian, PathTableEntry, VolumeDescriptor, DIR_FLAG_DIR,
    DIR_FLAG_MULTI_EXTENT, DOT_DOT_IDENTIFIER, DOT_IDENTIFIER, JOLIET_ESCAPE_SEQUENCES,
    PATH_TABLE_MAX_ENTRIES, VOLUME_TYPE_PRIMARY, VOLUME_TYPE_SUPPLEMENTARY,
};
use crate::sfo;
use crate::size::{ByteCount, SectorCount};

/// Path of the SFO consulted for PS3-mode images, relative to the image root.
pub const PARAM_SFO_RELATIVE: &str = "PS3_GAME/PARAM.SFO";

const PS3_VOLUME_NAME: &str = "PS3VOLUME";
const CONSOLE_ID: &str = "PlayStation3";
const APPLICATION_ID: &str = "ps3net";

/// Extent size of all but the last record of a multi-extent file.
const MULTI_EXTENT_PART_SIZE: ByteCount = ByteCount(0xffff_f800);
/// Largest file representable by a single directory record.
const MAX_SINGLE_EXTENT_SIZE: ByteCount = ByteCount(0xffff_ffff);

const SYSTEM_AREA_SECTORS: SectorCount = SectorCount(16);
const BASE_PAD_SECTORS: SectorCount = SectorCount(0x20);

const INFO_SECTOR_RANDOM_LEN: usize = 0x1b0;
const INFO_SECTOR_HASH_LEN: usize = 0x10;

#[derive(Debug, Clone)]
struct FileEntry {
    path: PathBuf,
    name: String,
    size: ByteCount,
    /// Sector address of the file's first byte. Relative to the start of the
    /// file region during the build, absolute after the LBA fixup.
    rlba: SectorCount,
    mtime: SystemTime,
}

/// One directory of the scanned tree. Directories live in a flat arena
/// (`Vec<DirNode>`) in BFS order; `parent` is an index into that arena.
#[derive(Debug)]
struct DirNode {
    name: String,
    mtime: SystemTime,
    parent: Option<usize>,
    files: Vec<FileEntry>,
    records: Vec<DirectoryRecord>,
    records_joliet: Vec<DirectoryRecord>,
}

impl DirNode {
    fn records(&self, joliet: bool) -> &[DirectoryRecord] {
        if joliet {
            &self.records_joliet
        } else {
            &self.records
        }
    }

    fn records_mut(&mut self, joliet: bool) -> &mut Vec<DirectoryRecord> {
        if joliet {
            &mut self.records_joliet
        } else {
            &mut self.records
        }
    }
}

/// A file to serve, addressed by its absolute sector span in the image.
/// Handles open lazily on first read and stay open until the image is
/// dropped.
#[derive(Debug)]
struct FileSlot {
    path: PathBuf,
    size: ByteCount,
    rlba: SectorCount,
    handle: Option<File>,
}

impl FileSlot {
    /// End of the file's sector-padded span, in bytes.
    fn span_end(&self) -> ByteCount {
        ByteCount(self.rlba.bytes().0 + self.size.sectors().bytes().0)
    }

    fn open_on_demand(&mut self) -> io::Result<&File> {
        if self.handle.is_none() {
            self.handle = Some(File::open(&self.path)?);
        }
        Ok(self.handle.as_ref().expect("just opened"))
    }
}

/// A synthesized, read-only ISO9660+Joliet disc image over a directory tree.
#[derive(Debug)]
pub struct VirtualIso {
    backing_root: PathBuf,
    created_at: SystemTime,
    total_size: ByteCount,
    pad_start: ByteCount,
    fs_buf: Vec<u8>,
    files: Vec<FileSlot>,
}

impl VirtualIso {
    /// Scans the tree under `root` and lays out the full image. File contents
    /// are not touched until they are read.
    pub fn build(root: &Path, ps3_mode: bool) -> Result<Self> {
        let root_meta = fs::metadata(root)?;
        if !root_meta.is_dir() {
            return Err(FsError::NotDirectory);
        }

        let (volume_name, product_id) = if ps3_mode {
            let raw = fs::read(root.join(PARAM_SFO_RELATIVE))?;
            let title_id = sfo::sfo_field(&raw, "TITLE_ID")?;
            (
                PS3_VOLUME_NAME.to_string(),
                Some(product_id_from_title(&title_id)?),
            )
        } else {
            let name = root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            (name, None)
        };

        let now = SystemTime::now();
        let (mut dirs, files_size) = scan_tree(root)?;

        let iso_dir_sectors = make_dir_records(&mut dirs, false)?;
        let joliet_dir_sectors = make_dir_records(&mut dirs, true)?;

        let mut path_table = make_path_table(&dirs, false);
        let mut path_table_joliet = make_path_table(&dirs, true);

        let pt_sectors = path_table_len(&path_table).sectors();
        let ptj_sectors = path_table_len(&path_table_joliet).sectors();

        // Image layout in sectors: system area, descriptors, one reserved
        // sector, the four path tables, then the two directory regions.
        let iso_dir_lba = SYSTEM_AREA_SECTORS
            + SectorCount(3) // volume descriptors, one per sector
            + SectorCount(1) // reserved sector after the terminator
            + pt_sectors
            + pt_sectors
            + ptj_sectors
            + ptj_sectors;
        let joliet_dir_lba = iso_dir_lba + iso_dir_sectors;
        let files_lba = joliet_dir_lba + joliet_dir_sectors;

        // Whole image size: file region end rounded up to a 32-sector
        // boundary, plus 32 more pad sectors.
        let volume_sectors = files_lba + files_size;
        let mut pad = BASE_PAD_SECTORS;
        let extra = SectorCount(volume_sectors.0 % BASE_PAD_SECTORS.0);
        if extra.0 > 0 {
            pad += BASE_PAD_SECTORS - extra;
        }
        let total_sectors = volume_sectors + pad;

        fix_lba(&mut dirs, iso_dir_lba, joliet_dir_lba, files_lba);
        for entry in &mut path_table {
            entry.dir_location += iso_dir_lba;
        }
        for entry in &mut path_table_joliet {
            entry.dir_location += joliet_dir_lba;
        }

        let pt_l = SYSTEM_AREA_SECTORS + SectorCount(3) + SectorCount(1);
        let pt_m = pt_l + pt_sectors;
        let ptj_l = pt_m + pt_sectors;
        let ptj_m = ptj_l + ptj_sectors;

        let pvd = VolumeDescriptor {
            volume_type: VOLUME_TYPE_PRIMARY,
            system_identifier: mangle_a(std::env::consts::OS, false),
            volume_identifier: mangle_d(&volume_name, false),
            volume_space_size: total_sectors,
            escape_sequences: b"",
            path_table_size: path_table_len(&path_table),
            type_l_path_table: pt_l,
            type_m_path_table: pt_m,
            root_record: dirs[0].records[0].clone(),
            volume_set_identifier: mangle_d(&volume_name, false),
            application_identifier: APPLICATION_ID,
            created_at: volume_timestamp(now),
            modified_at: volume_timestamp(now),
        };
        let svd = VolumeDescriptor {
            volume_type: VOLUME_TYPE_SUPPLEMENTARY,
            system_identifier: mangle_a(std::env::consts::OS, true),
            volume_identifier: mangle_d(&volume_name, true),
            volume_space_size: total_sectors,
            escape_sequences: JOLIET_ESCAPE_SEQUENCES,
            path_table_size: path_table_len(&path_table_joliet),
            type_l_path_table: ptj_l,
            type_m_path_table: ptj_m,
            root_record: dirs[0].records_joliet[0].clone(),
            volume_set_identifier: mangle_d(&volume_name, true),
            application_identifier: APPLICATION_ID,
            created_at: volume_timestamp(now),
            modified_at: volume_timestamp(now),
        };

        let fs_buf = encode_fs_structures(
            &dirs,
            &path_table,
            &path_table_joliet,
            &pvd,
            &svd,
            product_id.as_deref(),
            total_sectors,
        )?;
        debug_assert_eq!(fs_buf.len() as u64, files_lba.bytes().0);

        // Flat file list ordered by location for binary search during reads.
        let mut files: Vec<FileSlot> = dirs
            .iter()
            .flat_map(|dir| dir.files.iter())
            .map(|f| FileSlot {
                path: f.path.clone(),
                size: f.size,
                rlba: f.rlba,
                handle: None,
            })
            .collect();
        files.sort_by_key(|f| f.rlba);

        tracing::debug!(
            root = %root.display(),
            ps3_mode,
            dirs = dirs.len(),
            files = files.len(),
            total_sectors = total_sectors.0,
            "virtual iso built"
        );

        Ok(Self {
            backing_root: root.to_path_buf(),
            created_at: now,
            total_size: total_sectors.bytes(),
            pad_start: volume_sectors.bytes(),
            fs_buf,
            files,
        })
    }

    /// Total image size in bytes; always a multiple of 32 sectors.
    pub fn len(&self) -> u64 {
        self.total_size.0
    }

    pub fn is_empty(&self) -> bool {
        self.total_size.0 == 0
    }

    /// Build time; reported as the image's modification time.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// The directory tree this image was synthesized from.
    pub fn backing_root(&self) -> &Path {
        &self.backing_root
    }

    /// Reads up to `buf.len()` bytes at `offset`. Short only at end of image.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let total = self.total_size.0;
        if offset >= total || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(total - offset) as usize;
        let buf = &mut buf[..want];

        let mut off = offset;
        let mut written = 0;

        // In-memory descriptor prefix.
        let fs_buf_len = self.fs_buf.len() as u64;
        if off < fs_buf_len {
            let n = ((fs_buf_len - off) as usize).min(buf.len() - written);
            buf[written..written + n]
                .copy_from_slice(&self.fs_buf[off as usize..off as usize + n]);
            written += n;
            off += n as u64;
        }

        // File payload region. Files are contiguous sector spans, so the
        // slot covering the current offset is found by binary search.
        while written < buf.len() && off < self.pad_start.0 {
            let idx = self.files.partition_point(|f| f.span_end().0 <= off);
            if idx >= self.files.len() {
                break;
            }
            let slot = &mut self.files[idx];
            let file_start = slot.rlba.bytes().0;
            if off < file_start {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "offset {off} falls before file {} at {file_start}",
                        slot.path.display()
                    ),
                ));
            }

            let file_off = off - file_start;
            if file_off < slot.size.0 {
                let n = ((slot.size.0 - file_off) as usize).min(buf.len() - written);
                let file = slot.open_on_demand()?;
                let got = read_full_at(file, file_off, &mut buf[written..written + n])?;
                if got < n {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        format!("file {} shrank while being served", slot.path.display()),
                    ));
                }
                written += n;
                off += n as u64;
            }

            // Zero fill from the end of file data to the end of its sector
            // span.
            let span_end = slot.span_end().0;
            if written < buf.len() && off < span_end {
                let n = ((span_end - off) as usize).min(buf.len() - written);
                buf[written..written + n].fill(0);
                written += n;
                off += n as u64;
            }
        }

        // Trailing pad area.
        if written < buf.len() && off >= self.pad_start.0 {
            let n = ((total - off) as usize).min(buf.len() - written);
            buf[written..written + n].fill(0);
            written += n;
        }

        Ok(written)
    }
}

fn product_id_from_title(title_id: &str) -> Result<String> {
    if title_id.len() <= 4 || !title_id.is_ascii() {
        return Err(FsError::BadTitleId(title_id.to_string()));
    }
    // "BLUS12345" -> "BLUS-12345"
    Ok(format!("{}-{}", &title_id[..4], &title_id[4..]))
}

/// Scans the tree breadth-first so files end up at sequential sector
/// addresses in directory order. Entries within a directory are laid out
/// sorted by name. Returns the arena and the total file payload size.
fn scan_tree(root: &Path) -> Result<(Vec<DirNode>, SectorCount)> {
    let mut dirs: Vec<DirNode> = Vec::new();
    let mut files_size = SectorCount(0);

    let mut queue: VecDeque<(PathBuf, Option<usize>)> = VecDeque::new();
    queue.push_back((root.to_path_buf(), None));

    while let Some((path, parent)) = queue.pop_front() {
        let meta = fs::metadata(&path)?;
        if !meta.is_dir() {
            return Err(FsError::NotDirectory);
        }

        let index = dirs.len();
        let mut node = DirNode {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            parent,
            files: Vec::new(),
            records: Vec::new(),
            records_joliet: Vec::new(),
        };

        let mut entries: Vec<fs::DirEntry> =
            fs::read_dir(&path)?.collect::<io::Result<Vec<_>>>()?;
        entries.sort_by_key(|e| e.file_name());

        for entry in entries {
            let full = entry.path();
            // Stat (not lstat): symlinked content is served by value.
            let meta = fs::metadata(&full)?;
            if meta.is_dir() {
                queue.push_back((full, Some(index)));
                continue;
            }

            let size = ByteCount(meta.len());
            node.files.push(FileEntry {
                path: full,
                name: entry.file_name().to_string_lossy().into_owned(),
                size,
                rlba: files_size,
                mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
            files_size += size.sectors();
        }

        dirs.push(node);
    }

    Ok((dirs, files_size))
}

/// Builds one namespace's directory records for every directory, in arena
/// order: `.`, `..`, files, then child directories. Extent locations are
/// relative to the start of the namespace's directory region; parents get
/// their child-record location patched when the child is processed (parents
/// always precede children in BFS order). Returns the region size.
fn make_dir_records(dirs: &mut Vec<DirNode>, joliet: bool) -> Result<SectorCount> {
    let mut region = SectorCount(0);

    for i in 0..dirs.len() {
        let self_lba = region;
        let parent = dirs[i].parent;

        let (dot_dot_mtime, dot_dot_location) = match parent {
            Some(p) => (dirs[p].mtime, dirs[p].records(joliet)[0].extent_location),
            None => (dirs[i].mtime, SectorCount(0)),
        };

        let mut records = Vec::new();
        let mut total = ByteCount(0);

        let dot = DirectoryRecord {
            extent_location: self_lba,
            recording_time: recording_timestamp(dirs[i].mtime),
            file_flags: DIR_FLAG_DIR,
            volume_sequence_number: 1,
            identifier: DOT_IDENTIFIER.to_vec(),
            ..Default::default()
        };
        let dot_dot = DirectoryRecord {
            extent_location: dot_dot_location,
            recording_time: recording_timestamp(dot_dot_mtime),
            file_flags: DIR_FLAG_DIR,
            volume_sequence_number: 1,
            identifier: DOT_DOT_IDENTIFIER.to_vec(),
            ..Default::default()
        };
        total += dot.encoded_len();
        total += dot_dot.encoded_len();
        records.push(dot);
        records.push(dot_dot);

        for file in &dirs[i].files {
            push_file_records(&mut records, &mut total, file, joliet);
        }

        for j in 1..dirs.len() {
            if dirs[j].parent != Some(i) {
                continue;
            }
            let record = DirectoryRecord {
                recording_time: recording_timestamp(dirs[j].mtime),
                file_flags: DIR_FLAG_DIR,
                volume_sequence_number: 1,
                identifier: make_identifier(&dirs[j].name, joliet),
                // Location and length are patched when the child builds its
                // own block.
                ..Default::default()
            };
            total += record.encoded_len();
            records.push(record);
        }

        // A directory's record block occupies whole sectors.
        let block_len = total.sectors().bytes();
        records[0].extent_length = block_len;
        if parent.is_none() {
            records[1].extent_location = records[0].extent_location;
            records[1].extent_length = block_len;
        }

        *dirs[i].records_mut(joliet) = records;

        if let Some(p) = parent {
            let identifier = make_identifier(&dirs[i].name, joliet);
            let parent_records = dirs[p].records_mut(joliet);
            let child_record = parent_records
                .iter_mut()
                .find(|r| r.file_flags & DIR_FLAG_DIR != 0 && r.identifier == identifier)
                .expect("parent holds a record for each child directory");
            child_record.extent_location = self_lba;
            child_record.extent_length = block_len;
        }

        region += block_len.sectors();
    }

    Ok(region)
}

/// Appends the directory record(s) for one file. Files above 4 GiB split
/// into multiple extents of [`MULTI_EXTENT_PART_SIZE`] bytes; every record
/// but the last carries the multi-extent flag.
fn push_file_records(
    records: &mut Vec<DirectoryRecord>,
    total: &mut ByteCount,
    file: &FileEntry,
    joliet: bool,
) {
    let mut parts = 1;
    if file.size > MAX_SINGLE_EXTENT_SIZE {
        parts = file.size.0 / MULTI_EXTENT_PART_SIZE.0;
        if file.size.0 % MULTI_EXTENT_PART_SIZE.0 > 0 {
            parts += 1;
        }
    }

    let mut lba = file.rlba;
    for part in 0..parts {
        let mut record = DirectoryRecord {
            extent_location: lba,
            recording_time: recording_timestamp(file.mtime),
            volume_sequence_number: 1,
            identifier: make_identifier(&file.name, joliet),
            ..Default::default()
        };

        if parts == 1 {
            record.extent_length = file.size;
        } else if part == parts - 1 {
            record.extent_length = ByteCount(file.size.0 - part * MULTI_EXTENT_PART_SIZE.0);
        } else {
            record.extent_length = MULTI_EXTENT_PART_SIZE;
            record.file_flags = DIR_FLAG_MULTI_EXTENT;
            lba += MULTI_EXTENT_PART_SIZE.sectors();
        }

        *total += record.encoded_len();
        records.push(record);
    }
}

/// Path table entries in arena order; entry 0 is the root. Parent numbers are
/// 1-indexed. Tables cap at [`PATH_TABLE_MAX_ENTRIES`] because parents are
/// 16-bit ordinals.
fn make_path_table(dirs: &[DirNode], joliet: bool) -> Vec<PathTableEntry> {
    if dirs.len() > PATH_TABLE_MAX_ENTRIES {
        tracing::warn!(
            dirs = dirs.len(),
            limit = PATH_TABLE_MAX_ENTRIES,
            "directory count exceeds path table limit; table truncated"
        );
    }

    dirs.iter()
        .take(PATH_TABLE_MAX_ENTRIES)
        .enumerate()
        .map(|(i, dir)| PathTableEntry {
            dir_location: dir.records(joliet)[0].extent_location,
            parent_number: match dir.parent {
                None => 1,
                Some(p) => p as u16 + 1,
            },
            identifier: if i == 0 {
                DOT_IDENTIFIER.to_vec()
            } else {
                make_identifier(&dir.name, joliet)
            },
        })
        .collect()
}

/// Shifts every relative extent location by the region base it belongs to:
/// directory records by their namespace's directory region, file records and
/// file spans by the file region.
fn fix_lba(
    dirs: &mut [DirNode],
    iso_dir_lba: SectorCount,
    joliet_dir_lba: SectorCount,
    files_lba: SectorCount,
) {
    for dir in dirs.iter_mut() {
        for record in &mut dir.records {
            if record.file_flags & DIR_FLAG_DIR != 0 {
                record.extent_location += iso_dir_lba;
            } else {
                record.extent_location += files_lba;
            }
        }
        for record in &mut dir.records_joliet {
            if record.file_flags & DIR_FLAG_DIR != 0 {
                record.extent_location += joliet_dir_lba;
            } else {
                record.extent_location += files_lba;
            }
        }
        for file in &mut dir.files {
            file.rlba += files_lba;
        }
    }
}

fn encode_fs_structures(
    dirs: &[DirNode],
    path_table: &[PathTableEntry],
    path_table_joliet: &[PathTableEntry],
    pvd: &VolumeDescriptor,
    svd: &VolumeDescriptor,
    product_id: Option<&str>,
    total_sectors: SectorCount,
) -> Result<Vec<u8>> {
    let mut enc = IsoEncoder::new();

    // System area. PS3 mode fills sectors 0 and 1 with the disc-ranges and
    // disc-info records; the rest stays zero.
    match product_id {
        Some(product_id) => {
            // Sector 0: one range spanning the whole disc.
            enc.push_u32_be(1);
            enc.push_zeros(4);
            enc.push_u32_be(0);
            enc.push_u32_be(total_sectors.0 - 1);
            enc.pad_to_sector();

            // Sector 1: disc info.
            enc.push_padded(CONSOLE_ID.as_bytes(), 16, b' ');
            enc.push_padded(product_id.as_bytes(), 32, b' ');
            enc.push_zeros(16);
            let mut rng = rand::thread_rng();
            let mut info = [0u8; INFO_SECTOR_RANDOM_LEN];
            rng.fill_bytes(&mut info);
            enc.push_bytes(&info);
            let mut hash = [0u8; INFO_SECTOR_HASH_LEN];
            rng.fill_bytes(&mut hash);
            enc.push_bytes(&hash);
            enc.pad_to_sector();

            enc.push_zero_sectors(SYSTEM_AREA_SECTORS - SectorCount(2));
        }
        None => enc.push_zero_sectors(SYSTEM_AREA_SECTORS),
    }

    pvd.encode(&mut enc)?;
    svd.encode(&mut enc)?;
    VolumeDescriptor::encode_terminator(&mut enc);
    enc.push_zero_sectors(SectorCount(1));

    for (table, order) in [
        (path_table, Endian::Little),
        (path_table, Endian::Big),
        (path_table_joliet, Endian::Little),
        (path_table_joliet, Endian::Big),
    ] {
        for entry in table {
            entry.encode(&mut enc, order);
        }
        enc.pad_to_sector();
    }

    for dir in dirs {
        for record in &dir.records {
            record.encode(&mut enc)?;
        }
        enc.pad_to_sector();
    }
    for dir in dirs {
        for record in &dir.records_joliet {
            record.encode(&mut enc)?;
        }
        enc.pad_to_sector();
    }

    Ok(enc.into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size::SECTOR_SIZE;
    use std::io::Write;

    fn file_entry(size: u64) -> FileEntry {
        FileEntry {
            path: PathBuf::from("big.bin"),
            name: "big.bin".to_string(),
            size: ByteCount(size),
            rlba: SectorCount(100),
            mtime: SystemTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn single_record_at_exact_limit() {
        let mut records = Vec::new();
        let mut total = ByteCount(0);
        push_file_records(&mut records, &mut total, &file_entry(0xffff_ffff), false);

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].extent_length, ByteCount(0xffff_ffff));
        assert_eq!(records[0].file_flags, 0);
        assert_eq!(records[0].extent_location, SectorCount(100));
    }

    #[test]
    fn two_records_one_byte_past_limit() {
        let mut records = Vec::new();
        let mut total = ByteCount(0);
        push_file_records(&mut records, &mut total, &file_entry(0x1_0000_0000), false);

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].extent_length, MULTI_EXTENT_PART_SIZE);
        assert_eq!(records[0].file_flags, DIR_FLAG_MULTI_EXTENT);
        assert_eq!(records[0].extent_location, SectorCount(100));
        assert_eq!(
            records[1].extent_length,
            ByteCount(0x1_0000_0000 - MULTI_EXTENT_PART_SIZE.0)
        );
        assert_eq!(records[1].file_flags, 0);
        assert_eq!(
            records[1].extent_location,
            SectorCount(100) + MULTI_EXTENT_PART_SIZE.sectors()
        );
    }

    #[test]
    fn multi_extent_part_lengths_sum_to_file_size() {
        let size = 3 * MULTI_EXTENT_PART_SIZE.0 + 12345;
        let mut records = Vec::new();
        let mut total = ByteCount(0);
        push_file_records(&mut records, &mut total, &file_entry(size), false);

        assert_eq!(records.len(), 4);
        let sum: u64 = records.iter().map(|r| r.extent_length.0).sum();
        assert_eq!(sum, size);
        assert!(records[..3]
            .iter()
            .all(|r| r.file_flags == DIR_FLAG_MULTI_EXTENT));
        assert_eq!(records[3].file_flags, 0);
    }

    #[test]
    fn product_id_formatting() {
        assert_eq!(product_id_from_title("BLUS12345").unwrap(), "BLUS-12345");
        assert_eq!(product_id_from_title("BCES00104").unwrap(), "BCES-00104");
        assert!(product_id_from_title("BLU").is_err());
        assert!(product_id_from_title("").is_err());
    }

    fn sample_tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("test.txt"), b"hello world").unwrap();
        std::fs::create_dir(root.join("dir1")).unwrap();
        std::fs::write(root.join("dir1/A.TXT"), b"a content").unwrap();
        std::fs::write(root.join("dir1/c.txt"), b"c content").unwrap();
        std::fs::create_dir(root.join("dir1/DIR2")).unwrap();
        std::fs::write(root.join("dir1/DIR2/b.txt"), b"b content").unwrap();
        dir
    }

    #[test]
    fn scan_is_breadth_first_with_sequential_lbas() {
        let tree = sample_tree();
        let (dirs, files_size) = scan_tree(tree.path()).unwrap();

        // root, dir1, DIR2 in BFS order.
        assert_eq!(dirs.len(), 3);
        assert_eq!(dirs[0].parent, None);
        assert_eq!(dirs[1].name, "dir1");
        assert_eq!(dirs[1].parent, Some(0));
        assert_eq!(dirs[2].name, "DIR2");
        assert_eq!(dirs[2].parent, Some(1));

        // Files gain contiguous relative LBAs in scan order.
        assert_eq!(dirs[0].files.len(), 1);
        assert_eq!(dirs[0].files[0].rlba, SectorCount(0));
        assert_eq!(dirs[1].files[0].name, "A.TXT");
        assert_eq!(dirs[1].files[0].rlba, SectorCount(1));
        assert_eq!(dirs[1].files[1].name, "c.txt");
        assert_eq!(dirs[1].files[1].rlba, SectorCount(2));
        assert_eq!(dirs[2].files[0].rlba, SectorCount(3));
        assert_eq!(files_size, SectorCount(4));
    }

    #[test]
    fn image_size_is_padded_to_32_sectors() {
        let tree = sample_tree();
        let iso = VirtualIso::build(tree.path(), false).unwrap();
        assert_eq!(iso.len() % (32 * SECTOR_SIZE), 0);
        assert!(iso.len() > 0);
    }

    #[test]
    fn sequential_chunked_reads_cover_whole_image() {
        let tree = sample_tree();
        let mut iso = VirtualIso::build(tree.path(), false).unwrap();

        let mut total = 0u64;
        let mut buf = vec![0u8; 1000]; // deliberately not sector aligned
        loop {
            let n = iso.read_at(total, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            total += n as u64;
        }
        assert_eq!(total, iso.len());

        // Reading past the end yields EOF immediately.
        let mut byte = [0u8; 1];
        assert_eq!(iso.read_at(iso.len(), &mut byte).unwrap(), 0);
        assert_eq!(iso.read_at(iso.len() + 5000, &mut byte).unwrap(), 0);
    }

    #[test]
    fn build_rejects_files() {
        let tree = sample_tree();
        assert!(matches!(
            VirtualIso::build(&tree.path().join("test.txt"), false),
            Err(FsError::NotDirectory)
        ));
    }

    #[test]
    fn ps3_mode_needs_param_sfo() {
        let tree = sample_tree();
        assert!(VirtualIso::build(tree.path(), true).is_err());
    }

    #[test]
    fn file_contents_round_trip_with_sector_padding() {
        let tree = sample_tree();
        let mut iso = VirtualIso::build(tree.path(), false).unwrap();

        // The first file payload sector holds test.txt followed by zeros.
        let file_region = iso.fs_buf.len() as u64;
        let mut sector = vec![0u8; SECTOR_SIZE as usize];
        assert_eq!(
            iso.read_at(file_region, &mut sector).unwrap(),
            SECTOR_SIZE as usize
        );
        assert_eq!(&sector[..11], b"hello world");
        assert!(sector[11..].iter().all(|&b| b == 0));
    }

    #[test]
    fn unaligned_reads_match_aligned_reads() {
        let tree = sample_tree();
        let mut iso = VirtualIso::build(tree.path(), false).unwrap();

        let mut whole = vec![0u8; iso.len() as usize];
        assert_eq!(iso.read_at(0, &mut whole).unwrap(), whole.len());

        let mut pieced = Vec::new();
        let mut off = 0u64;
        for chunk in [1usize, 7, 100, 2047, 2049, 4096, 65536].iter().cycle() {
            let mut buf = vec![0u8; *chunk];
            let n = iso.read_at(off, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            pieced.extend_from_slice(&buf[..n]);
            off += n as u64;
        }
        assert_eq!(pieced, whole);
    }

    #[test]
    fn writes_to_backing_files_do_not_change_layout() {
        // The layout is fixed at build time; file sizes are captured then.
        let tree = sample_tree();
        let iso = VirtualIso::build(tree.path(), false).unwrap();
        let before = iso.len();
        std::fs::File::create(tree.path().join("late.bin"))
            .unwrap()
            .write_all(&[0u8; 4096])
            .unwrap();
        assert_eq!(iso.len(), before);
    }
}
