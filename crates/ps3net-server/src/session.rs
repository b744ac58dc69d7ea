//! Per-connection protocol session.
//!
//! A session owns at most one directory handle, one read-only file and one
//! write-only file at a time; opening a new one closes the previous. The
//! command loop is strictly sequential: the next command is read only after
//! the previous reply has been written in full.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;

use anyhow::{bail, Context as _};

use ps3net_fs::{file_times, unix_seconds, DirHandle, OpenFile, Vfs};
use ps3net_proto::{self as proto, Command, COMMAND_LEN};

/// Assumed raw sector size of CD images until detection says otherwise.
const DEFAULT_CD_SECTOR_SIZE: u32 = 2352;

/// Sync/header bytes preceding the 2048 data bytes of a raw PSX sector.
const PSX_PREFIX_SIZE: u64 = 24;

/// Candidate raw sector sizes, sorted.
const CD_SECTOR_SIZES: [u32; 7] = [2048, 2328, 2336, 2340, 2352, 2368, 2448];
const CD_MAGIC1: &[u8] = b"\x01CD001";
const CD_MAGIC2: &[u8] = b"PLAYSTATION ";
/// Gap between the two magics in a raw sector.
const CD_MAGIC_GAP: usize = 2;

/// Only files in this size window are probed for a CD sector size.
const CD_PROBE_MIN_SIZE: u64 = 0x0020_0000; // 2 MiB
const CD_PROBE_MAX_SIZE: u64 = 0x3500_0000; // 848 MiB

/// The magic OPEN_FILE basename that closes the read-only slot.
const CLOSE_FILE_NAME: &str = "CLOSEFILE";

pub(crate) struct Session {
    vfs: Arc<Vfs>,
    allow_write: bool,
    buffer_size: usize,

    cwd: Option<DirHandle>,
    ro_file: Option<OpenFile>,
    wo_file: Option<std::fs::File>,
    cd_sector_size: u32,
}

impl Session {
    pub fn new(vfs: Arc<Vfs>, allow_write: bool, buffer_size: usize) -> Self {
        Self {
            vfs,
            allow_write,
            buffer_size: buffer_size.max(512),
            cwd: None,
            ro_file: None,
            wo_file: None,
            cd_sector_size: DEFAULT_CD_SECTOR_SIZE,
        }
    }

    /// Runs the command loop until the client disconnects or the connection
    /// must be torn down. All session handles close when the session drops.
    pub fn run(mut self, mut conn: TcpStream) -> anyhow::Result<()> {
        loop {
            let mut frame = [0u8; COMMAND_LEN];
            match conn.read_exact(&mut frame) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(err) => return Err(err).context("read command"),
            }

            // An unknown opcode means the stream is not trustworthy anymore.
            let command = proto::decode_command(&frame).context("decode command")?;
            tracing::trace!(opcode = %command.opcode(), "received command");
            self.handle_command(&mut conn, command)?;
        }
    }

    fn handle_command(&mut self, conn: &mut TcpStream, command: Command) -> anyhow::Result<()> {
        match command {
            Command::OpenDir { path_len } => {
                let path = read_path(conn, path_len)?;
                let ok = self.open_dir(&path);
                conn.write_all(&proto::encode_result(if ok { 0 } else { -1 }))?;
            }
            Command::ReadDir => self.read_dir(conn)?,
            Command::ReadDirEntry => self.read_dir_entry(conn, false)?,
            Command::ReadDirEntryV2 => self.read_dir_entry(conn, true)?,
            Command::StatFile { path_len } => {
                let path = read_path(conn, path_len)?;
                conn.write_all(&self.stat_file(&path))?;
            }
            Command::OpenFile { path_len } => {
                let path = read_path(conn, path_len)?;
                conn.write_all(&self.open_file(&path))?;
            }
            Command::ReadFile { len, offset } => {
                match self.read_ro_file(len, offset) {
                    Ok(data) => {
                        conn.write_all(&proto::encode_read_file_header(data.len() as i32))?;
                        conn.write_all(&data)?;
                    }
                    Err(err) => {
                        tracing::warn!(len, offset, error = %err, "read file failed");
                        conn.write_all(&proto::encode_read_file_header(-1))?;
                    }
                }
            }
            Command::ReadFileCritical { len, offset } => {
                // Raw stream with no header: any failure aborts the
                // connection, the client expects exactly `len` bytes.
                self.read_file_critical(conn, len, offset)?;
            }
            Command::ReadCd2048Critical {
                sectors,
                start_sector,
            } => {
                self.read_cd_2048_critical(conn, sectors, start_sector)?;
            }
            Command::CreateFile { path_len } => {
                let path = read_path(conn, path_len)?;
                let ok = self.create_file(&path);
                conn.write_all(&proto::encode_result(if ok { 0 } else { -1 }))?;
            }
            Command::WriteFile { len } => {
                let written = self.write_file(conn, len)?;
                conn.write_all(&proto::encode_write_file_result(written))?;
            }
            Command::DeleteFile { path_len } => {
                let path = read_path(conn, path_len)?;
                let ok = self.modifying_op(&path, "delete", |vfs, p| vfs.root().remove_file(p));
                conn.write_all(&proto::encode_result(if ok { 0 } else { -1 }))?;
            }
            Command::Mkdir { path_len } => {
                let path = read_path(conn, path_len)?;
                let ok = self.modifying_op(&path, "mkdir", |vfs, p| vfs.root().mkdir(p));
                conn.write_all(&proto::encode_result(if ok { 0 } else { -1 }))?;
            }
            Command::Rmdir { path_len } => {
                let path = read_path(conn, path_len)?;
                let ok = self.modifying_op(&path, "rmdir", |vfs, p| vfs.root().remove_dir(p));
                conn.write_all(&proto::encode_result(if ok { 0 } else { -1 }))?;
            }
            Command::GetDirSize { path_len } => {
                let path = read_path(conn, path_len)?;
                let total = match self.vfs.root().dir_size(&path) {
                    Ok(total) => total as i64,
                    Err(err) => {
                        tracing::warn!(path, error = %err, "dir size failed");
                        -1
                    }
                };
                conn.write_all(&proto::encode_dir_size_result(total))?;
            }
        }
        Ok(())
    }

    fn open_dir(&mut self, path: &str) -> bool {
        tracing::info!(path, "open dir");
        self.cwd = None;
        match self.vfs.open_dir(path) {
            Ok(handle) => {
                self.cwd = Some(handle);
                true
            }
            Err(err) => {
                tracing::warn!(path, error = %err, "open dir failed");
                false
            }
        }
    }

    fn read_dir(&mut self, conn: &mut TcpStream) -> anyhow::Result<()> {
        let entries = match &mut self.cwd {
            Some(dir) => dir.read_all(),
            None => {
                tracing::warn!("read dir without an open dir");
                Vec::new()
            }
        };

        conn.write_all(&proto::encode_read_dir_header(entries.len() as i64))?;
        for entry in entries {
            conn.write_all(&proto::encode_dir_entry(
                entry.size as i64,
                entry.mtime,
                entry.is_dir,
                &entry.name,
            ))?;
        }
        Ok(())
    }

    fn read_dir_entry(&mut self, conn: &mut TcpStream, v2: bool) -> anyhow::Result<()> {
        let entry = self.cwd.as_mut().and_then(|dir| dir.next_entry());

        let reply = match entry {
            Some(e) if v2 => {
                proto::encode_read_dir_entry_v2(e.size as i64, e.mtime, e.atime, e.ctime, e.is_dir, &e.name)
            }
            Some(e) => proto::encode_read_dir_entry(e.size as i64, e.is_dir, &e.name),
            None => {
                // End of directory (or none open): the handle auto-closes.
                self.cwd = None;
                if v2 {
                    proto::encode_read_dir_entry_v2_end()
                } else {
                    proto::encode_read_dir_entry_end()
                }
            }
        };
        conn.write_all(&reply)?;
        Ok(())
    }

    fn stat_file(&self, path: &str) -> [u8; 33] {
        tracing::info!(path, "stat file");
        match self.vfs.stat(path) {
            Ok(meta) => {
                let (mtime, atime, ctime) = file_times(&meta);
                let size = if meta.is_dir() { 0 } else { meta.len() as i64 };
                proto::encode_stat_result(size, mtime, atime, ctime, meta.is_dir())
            }
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path, error = %err, "stat failed");
                }
                proto::encode_stat_error()
            }
        }
    }

    fn open_file(&mut self, path: &str) -> [u8; 16] {
        if basename(path) == CLOSE_FILE_NAME {
            tracing::debug!("close r/o file");
            self.ro_file = None;
            self.cd_sector_size = DEFAULT_CD_SECTOR_SIZE;
            return proto::encode_open_file_closed();
        }

        tracing::info!(path, "open r/o file");
        self.ro_file = None;
        self.cd_sector_size = DEFAULT_CD_SECTOR_SIZE;

        match self.vfs.open_file(path) {
            Ok(mut file) => {
                if (CD_PROBE_MIN_SIZE..CD_PROBE_MAX_SIZE).contains(&file.len()) {
                    if let Some(size) = detect_cd_sector_size(&mut file) {
                        tracing::info!(path, size, "detected cd sector size");
                        self.cd_sector_size = size;
                    }
                }

                let reply = proto::encode_open_file_result(
                    file.len() as i64,
                    unix_seconds(file.modified()),
                );
                self.ro_file = Some(file);
                reply
            }
            Err(err) => {
                tracing::warn!(path, error = %err, "open r/o file failed");
                proto::encode_open_file_error()
            }
        }
    }

    fn read_ro_file(&mut self, limit: u32, offset: u64) -> anyhow::Result<Vec<u8>> {
        let file = self.ro_file.as_mut().context("no file opened")?;

        // The batch reply carries a length header, so the data is buffered
        // up front; the allocation is bounded by what the file can provide.
        let want = (limit as u64).min(file.len().saturating_sub(offset)) as usize;
        let mut buf = vec![0u8; want];
        let n = file.read_at(offset, &mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }

    fn read_file_critical(
        &mut self,
        conn: &mut TcpStream,
        limit: u32,
        offset: u64,
    ) -> anyhow::Result<()> {
        tracing::debug!(limit, offset, "read file critical");
        let buffer_size = self.buffer_size;
        let file = self.ro_file.as_mut().context("no file opened")?;

        let mut buf = vec![0u8; buffer_size.min(limit.max(1) as usize)];
        let mut off = offset;
        let mut remaining = limit as u64;
        while remaining > 0 {
            let n = (buf.len() as u64).min(remaining) as usize;
            let got = file.read_at(off, &mut buf[..n])?;
            if got == 0 {
                bail!("file ended {remaining} bytes short of a critical read");
            }
            conn.write_all(&buf[..got])?;
            off += got as u64;
            remaining -= got as u64;
        }
        Ok(())
    }

    fn read_cd_2048_critical(
        &mut self,
        conn: &mut TcpStream,
        sectors: u32,
        start_sector: u32,
    ) -> anyhow::Result<()> {
        tracing::debug!(
            sectors,
            start_sector,
            sector_size = self.cd_sector_size,
            "read cd 2048 critical"
        );
        let sector_size = self.cd_sector_size as u64;
        let file = self.ro_file.as_mut().context("no file opened")?;

        // The client addresses 2048-byte payloads; raw sectors carry a
        // sync/header prefix and trailing metadata we skip over.
        let mut offset = PSX_PREFIX_SIZE + start_sector as u64 * sector_size;
        let mut buf = [0u8; 2048];
        for _ in 0..sectors {
            let got = file.read_at(offset, &mut buf)?;
            if got < buf.len() {
                bail!("short read of cd sector at offset {offset}");
            }
            conn.write_all(&buf)?;
            offset += sector_size;
        }
        Ok(())
    }

    fn create_file(&mut self, path: &str) -> bool {
        tracing::debug!(path, "create file");
        if !self.allow_write {
            tracing::warn!(path, op = "create", "modifying operation forbidden");
            return false;
        }

        self.wo_file = None;

        // An existing directory path means "close the write slot".
        if let Ok(meta) = self.vfs.stat(path) {
            if meta.is_dir() {
                return true;
            }
        }

        match self.vfs.root().create(path) {
            Ok(file) => {
                self.wo_file = Some(file);
                true
            }
            Err(err) => {
                tracing::warn!(path, error = %err, "create file failed");
                false
            }
        }
    }

    /// Copies the declared payload into the write-only file. The payload is
    /// always drained from the socket, even when writing is refused, so the
    /// command stream stays in sync.
    fn write_file(&mut self, conn: &mut TcpStream, len: u32) -> anyhow::Result<i32> {
        tracing::debug!(len, "write file");
        let mut failed = if !self.allow_write {
            tracing::warn!(op = "write", "modifying operation forbidden");
            true
        } else if self.wo_file.is_none() {
            tracing::warn!("no file opened for writing");
            true
        } else {
            false
        };

        let buffer_size = self.buffer_size;
        let mut buf = vec![0u8; buffer_size.min(len.max(1) as usize)];
        let mut remaining = len as usize;
        let mut written = 0u64;
        while remaining > 0 {
            let n = buf.len().min(remaining);
            conn.read_exact(&mut buf[..n]).context("read write payload")?;
            remaining -= n;

            if !failed {
                let file = self.wo_file.as_mut().expect("checked above");
                match file.write_all(&buf[..n]) {
                    Ok(()) => written += n as u64,
                    Err(err) => {
                        tracing::warn!(error = %err, "write data failed");
                        failed = true;
                    }
                }
            }
        }

        Ok(if failed { -1 } else { written as i32 })
    }

    fn modifying_op(
        &self,
        path: &str,
        op: &'static str,
        f: impl FnOnce(&Vfs, &str) -> std::io::Result<()>,
    ) -> bool {
        tracing::debug!(path, op, "modifying operation");
        if !self.allow_write {
            tracing::warn!(path, op, "modifying operation forbidden");
            return false;
        }
        match f(&self.vfs, path) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!(path, op, error = %err, "operation failed");
                false
            }
        }
    }
}

fn read_path(conn: &mut TcpStream, len: u16) -> anyhow::Result<String> {
    let mut buf = vec![0u8; len as usize];
    conn.read_exact(&mut buf).context("read path payload")?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// Probes a file for its raw CD sector size with a single read.
///
/// The probe covers the spread between the smallest and largest candidate
/// sizes starting at the system-area boundary for the smallest one; each
/// candidate is then checked by looking for the ISO9660 volume magic (and,
/// two bytes further, the PSX magic) at its relative offset.
fn detect_cd_sector_size(file: &mut OpenFile) -> Option<u32> {
    let min = CD_SECTOR_SIZES[0];
    let max = CD_SECTOR_SIZES[CD_SECTOR_SIZES.len() - 1];

    let probe_len =
        (max - min) as usize + CD_MAGIC1.len() + CD_MAGIC_GAP + CD_MAGIC2.len();
    let mut buf = vec![0u8; probe_len];
    let probe_at = PSX_PREFIX_SIZE + 16 * min as u64;

    match file.read_at(probe_at, &mut buf) {
        Ok(n) if n == probe_len => {}
        Ok(_) => return None,
        Err(err) => {
            tracing::warn!(error = %err, "cd sector size probe failed");
            return None;
        }
    }

    for &size in &CD_SECTOR_SIZES {
        let at1 = (size - min) as usize;
        if &buf[at1..at1 + CD_MAGIC1.len()] == CD_MAGIC1 {
            return Some(size);
        }
        let at2 = at1 + CD_MAGIC1.len() + CD_MAGIC_GAP;
        if &buf[at2..at2 + CD_MAGIC2.len()] == CD_MAGIC2 {
            return Some(size);
        }
    }

    None
}
