#![forbid(unsafe_code)]

//! ps3netsrv wire protocol codec.
//!
//! This crate provides the canonical encoding of the request/reply protocol
//! spoken by WebMAN MOD / IrisMAN clients. The protocol is request-response
//! over a single TCP connection and stateful per connection.
//!
//! Every command is a fixed 16-byte frame (all integer fields big-endian):
//!
//! ```text
//! 0               2                               16
//! +---------------+-------------------------------+
//! | opcode (u16)  | body (14 bytes, per opcode)   |
//! +---------------+-------------------------------+
//! ```
//!
//! Commands carrying a path (or write data) declare a payload length inside
//! the body; the payload follows the frame on the stream. Replies have no
//! framing beyond their declared structure, and the "critical" read replies
//! are raw bytes with no header at all.

use core::fmt;

pub const COMMAND_LEN: usize = 16;

/// Maximum file name length in a [`encode_dir_entry`] batch record. Longer
/// names are truncated on the wire.
pub const MAX_DIR_ENTRY_NAME: usize = 512;

/// Operation codes. Numeric values are fixed for wire compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpCode {
    /// Close the active r/o file (if any) and open/stat a new one.
    OpenFile = 0x1224,
    /// Read the active r/o file; raw bytes only, errors abort the connection.
    ReadFileCritical = 0x1225,
    /// Read 2048-byte payloads of CD sectors from a raw-sector image.
    ReadCd2048Critical = 0x1226,
    /// Read the active r/o file; a byte-count header precedes the data.
    ReadFile = 0x1227,
    /// Close the active w/o file (if any) and create/truncate a new one.
    CreateFile = 0x1228,
    /// Write to the active w/o file.
    WriteFile = 0x1229,
    /// Close the active directory (if any) and open a new one.
    OpenDir = 0x122a,
    /// Read one directory entry; the directory auto-closes on EOF or error.
    ReadDirEntry = 0x122b,
    DeleteFile = 0x122c,
    Mkdir = 0x122d,
    Rmdir = 0x122e,
    /// Like [`OpCode::ReadDirEntry`] with mtime/atime/ctime in the reply.
    ReadDirEntryV2 = 0x122f,
    StatFile = 0x1230,
    GetDirSize = 0x1231,
    /// Read complete directory contents in one batch reply.
    ReadDir = 0x1232,
}

impl OpCode {
    pub const fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for OpCode {
    type Error = DecodeError;

    fn try_from(value: u16) -> Result<Self, DecodeError> {
        Ok(match value {
            0x1224 => OpCode::OpenFile,
            0x1225 => OpCode::ReadFileCritical,
            0x1226 => OpCode::ReadCd2048Critical,
            0x1227 => OpCode::ReadFile,
            0x1228 => OpCode::CreateFile,
            0x1229 => OpCode::WriteFile,
            0x122a => OpCode::OpenDir,
            0x122b => OpCode::ReadDirEntry,
            0x122c => OpCode::DeleteFile,
            0x122d => OpCode::Mkdir,
            0x122e => OpCode::Rmdir,
            0x122f => OpCode::ReadDirEntryV2,
            0x1230 => OpCode::StatFile,
            0x1231 => OpCode::GetDirSize,
            0x1232 => OpCode::ReadDir,
            other => return Err(DecodeError::UnknownOpCode { opcode: other }),
        })
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::OpenFile => "OPEN_FILE",
            OpCode::ReadFileCritical => "READ_FILE_CRITICAL",
            OpCode::ReadCd2048Critical => "READ_CD_2048_CRITICAL",
            OpCode::ReadFile => "READ_FILE",
            OpCode::CreateFile => "CREATE_FILE",
            OpCode::WriteFile => "WRITE_FILE",
            OpCode::OpenDir => "OPEN_DIR",
            OpCode::ReadDirEntry => "READ_DIR_ENTRY",
            OpCode::DeleteFile => "DELETE_FILE",
            OpCode::Mkdir => "MKDIR",
            OpCode::Rmdir => "RMDIR",
            OpCode::ReadDirEntryV2 => "READ_DIR_ENTRY_V2",
            OpCode::StatFile => "STAT_FILE",
            OpCode::GetDirSize => "GET_DIR_SIZE",
            OpCode::ReadDir => "READ_DIR",
        };
        f.write_str(name)
    }
}

/// A decoded command frame.
///
/// `path_len` fields declare a UTF-8 path payload that follows the frame on
/// the stream; [`Command::WriteFile`] declares a raw data payload the same
/// way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    OpenFile { path_len: u16 },
    ReadFileCritical { len: u32, offset: u64 },
    ReadCd2048Critical { sectors: u32, start_sector: u32 },
    ReadFile { len: u32, offset: u64 },
    CreateFile { path_len: u16 },
    WriteFile { len: u32 },
    OpenDir { path_len: u16 },
    ReadDirEntry,
    DeleteFile { path_len: u16 },
    Mkdir { path_len: u16 },
    Rmdir { path_len: u16 },
    ReadDirEntryV2,
    StatFile { path_len: u16 },
    GetDirSize { path_len: u16 },
    ReadDir,
}

impl Command {
    pub fn opcode(&self) -> OpCode {
        match self {
            Command::OpenFile { .. } => OpCode::OpenFile,
            Command::ReadFileCritical { .. } => OpCode::ReadFileCritical,
            Command::ReadCd2048Critical { .. } => OpCode::ReadCd2048Critical,
            Command::ReadFile { .. } => OpCode::ReadFile,
            Command::CreateFile { .. } => OpCode::CreateFile,
            Command::WriteFile { .. } => OpCode::WriteFile,
            Command::OpenDir { .. } => OpCode::OpenDir,
            Command::ReadDirEntry => OpCode::ReadDirEntry,
            Command::DeleteFile { .. } => OpCode::DeleteFile,
            Command::Mkdir { .. } => OpCode::Mkdir,
            Command::Rmdir { .. } => OpCode::Rmdir,
            Command::ReadDirEntryV2 => OpCode::ReadDirEntryV2,
            Command::StatFile { .. } => OpCode::StatFile,
            Command::GetDirSize { .. } => OpCode::GetDirSize,
            Command::ReadDir => OpCode::ReadDir,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    UnknownOpCode { opcode: u16 },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::UnknownOpCode { opcode } => {
                write!(f, "unknown opcode: 0x{opcode:04x}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

fn body_u16(frame: &[u8; COMMAND_LEN], at: usize) -> u16 {
    u16::from_be_bytes([frame[at], frame[at + 1]])
}

fn body_u32(frame: &[u8; COMMAND_LEN], at: usize) -> u32 {
    u32::from_be_bytes([frame[at], frame[at + 1], frame[at + 2], frame[at + 3]])
}

fn body_u64(frame: &[u8; COMMAND_LEN], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&frame[at..at + 8]);
    u64::from_be_bytes(raw)
}

/// Decodes one 16-byte command frame.
pub fn decode_command(frame: &[u8; COMMAND_LEN]) -> Result<Command, DecodeError> {
    let opcode = OpCode::try_from(body_u16(frame, 0))?;

    // Body layouts (offsets are into the whole frame, so the body starts
    // at byte 2):
    // - path commands:        u16 path_len
    // - READ_FILE[_CRITICAL]: u16 pad, u32 bytes_to_read, u64 offset
    // - READ_CD_2048:         u16 pad, u32 sectors_to_read, u32 start_sector
    // - WRITE_FILE:           u16 pad, u32 bytes_to_write
    Ok(match opcode {
        OpCode::OpenFile => Command::OpenFile {
            path_len: body_u16(frame, 2),
        },
        OpCode::ReadFileCritical => Command::ReadFileCritical {
            len: body_u32(frame, 4),
            offset: body_u64(frame, 8),
        },
        OpCode::ReadCd2048Critical => Command::ReadCd2048Critical {
            sectors: body_u32(frame, 4),
            start_sector: body_u32(frame, 8),
        },
        OpCode::ReadFile => Command::ReadFile {
            len: body_u32(frame, 4),
            offset: body_u64(frame, 8),
        },
        OpCode::CreateFile => Command::CreateFile {
            path_len: body_u16(frame, 2),
        },
        OpCode::WriteFile => Command::WriteFile {
            len: body_u32(frame, 4),
        },
        OpCode::OpenDir => Command::OpenDir {
            path_len: body_u16(frame, 2),
        },
        OpCode::ReadDirEntry => Command::ReadDirEntry,
        OpCode::DeleteFile => Command::DeleteFile {
            path_len: body_u16(frame, 2),
        },
        OpCode::Mkdir => Command::Mkdir {
            path_len: body_u16(frame, 2),
        },
        OpCode::Rmdir => Command::Rmdir {
            path_len: body_u16(frame, 2),
        },
        OpCode::ReadDirEntryV2 => Command::ReadDirEntryV2,
        OpCode::StatFile => Command::StatFile {
            path_len: body_u16(frame, 2),
        },
        OpCode::GetDirSize => Command::GetDirSize {
            path_len: body_u16(frame, 2),
        },
        OpCode::ReadDir => Command::ReadDir,
    })
}

/// Encodes a command frame. The server never sends these; clients and tests do.
pub fn encode_command(cmd: &Command) -> [u8; COMMAND_LEN] {
    let mut frame = [0u8; COMMAND_LEN];
    frame[0..2].copy_from_slice(&cmd.opcode().as_u16().to_be_bytes());

    match *cmd {
        Command::OpenFile { path_len }
        | Command::CreateFile { path_len }
        | Command::OpenDir { path_len }
        | Command::DeleteFile { path_len }
        | Command::Mkdir { path_len }
        | Command::Rmdir { path_len }
        | Command::StatFile { path_len }
        | Command::GetDirSize { path_len } => {
            frame[2..4].copy_from_slice(&path_len.to_be_bytes());
        }
        Command::ReadFile { len, offset } | Command::ReadFileCritical { len, offset } => {
            frame[4..8].copy_from_slice(&len.to_be_bytes());
            frame[8..16].copy_from_slice(&offset.to_be_bytes());
        }
        Command::ReadCd2048Critical {
            sectors,
            start_sector,
        } => {
            frame[4..8].copy_from_slice(&sectors.to_be_bytes());
            frame[8..12].copy_from_slice(&start_sector.to_be_bytes());
        }
        Command::WriteFile { len } => {
            frame[4..8].copy_from_slice(&len.to_be_bytes());
        }
        Command::ReadDirEntry | Command::ReadDirEntryV2 | Command::ReadDir => {}
    }

    frame
}

/// Reply for OPEN_DIR / CREATE_FILE / DELETE_FILE / MKDIR / RMDIR:
/// `0` on success, `-1` on failure.
pub fn encode_result(result: i32) -> [u8; 4] {
    result.to_be_bytes()
}

/// Reply for OPEN_FILE: `i64 size; u64 mtime`.
pub fn encode_open_file_result(size: i64, mtime: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[0..8].copy_from_slice(&size.to_be_bytes());
    out[8..16].copy_from_slice(&mtime.to_be_bytes());
    out
}

/// OPEN_FILE error reply (`size = -1`).
pub fn encode_open_file_error() -> [u8; 16] {
    encode_open_file_result(-1, 0)
}

/// OPEN_FILE reply for the CLOSEFILE magic basename: all zeroes.
pub fn encode_open_file_closed() -> [u8; 16] {
    [0u8; 16]
}

/// Reply for STAT_FILE: `i64 size; u64 mtime; u64 atime; u64 ctime; u8 is_dir`.
/// Directories report `size = 0`.
pub fn encode_stat_result(size: i64, mtime: u64, atime: u64, ctime: u64, is_dir: bool) -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0..8].copy_from_slice(&size.to_be_bytes());
    out[8..16].copy_from_slice(&mtime.to_be_bytes());
    out[16..24].copy_from_slice(&atime.to_be_bytes());
    out[24..32].copy_from_slice(&ctime.to_be_bytes());
    out[32] = is_dir as u8;
    out
}

/// STAT_FILE error reply (`size = -1`, remaining fields zero).
pub fn encode_stat_error() -> [u8; 33] {
    let mut out = [0u8; 33];
    out[0..8].copy_from_slice(&(-1i64).to_be_bytes());
    out
}

/// Header preceding READ_FILE data: `i32 bytes_read`, negative on error.
pub fn encode_read_file_header(bytes_read: i32) -> [u8; 4] {
    bytes_read.to_be_bytes()
}

/// Header preceding a READ_DIR batch: `i64 count`.
pub fn encode_read_dir_header(count: i64) -> [u8; 8] {
    count.to_be_bytes()
}

/// One READ_DIR batch record: `i64 size; u64 mtime; u8 is_dir` followed by
/// the name null-padded to [`MAX_DIR_ENTRY_NAME`] bytes. Directories report
/// `size = 0`; over-long names are truncated.
pub fn encode_dir_entry(size: i64, mtime: u64, is_dir: bool, name: &str) -> Vec<u8> {
    let size = if is_dir { 0 } else { size };
    let mut out = Vec::with_capacity(8 + 8 + 1 + MAX_DIR_ENTRY_NAME);
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&mtime.to_be_bytes());
    out.push(is_dir as u8);

    let name = name.as_bytes();
    let used = name.len().min(MAX_DIR_ENTRY_NAME);
    out.extend_from_slice(&name[..used]);
    out.resize(out.len() + (MAX_DIR_ENTRY_NAME - used), 0);
    out
}

/// Streamed READ_DIR_ENTRY reply: `i64 size; u16 filename_len; u8 is_dir`
/// followed by the name bytes. Directories report `size = 0`.
pub fn encode_read_dir_entry(size: i64, is_dir: bool, name: &str) -> Vec<u8> {
    let size = if is_dir { 0 } else { size };
    let name = name.as_bytes();
    let mut out = Vec::with_capacity(11 + name.len());
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.push(is_dir as u8);
    out.extend_from_slice(name);
    out
}

/// READ_DIR_ENTRY end-of-directory sentinel: `size = -1, filename_len = 0`.
pub fn encode_read_dir_entry_end() -> Vec<u8> {
    let mut out = Vec::with_capacity(11);
    out.extend_from_slice(&(-1i64).to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    out.push(0);
    out
}

/// Streamed READ_DIR_ENTRY_V2 reply: the v1 fields plus
/// `u64 mtime; u64 atime; u64 ctime` preceding `is_dir`.
pub fn encode_read_dir_entry_v2(
    size: i64,
    mtime: u64,
    atime: u64,
    ctime: u64,
    is_dir: bool,
    name: &str,
) -> Vec<u8> {
    let size = if is_dir { 0 } else { size };
    let name = name.as_bytes();
    let mut out = Vec::with_capacity(35 + name.len());
    out.extend_from_slice(&size.to_be_bytes());
    out.extend_from_slice(&(name.len() as u16).to_be_bytes());
    out.extend_from_slice(&mtime.to_be_bytes());
    out.extend_from_slice(&atime.to_be_bytes());
    out.extend_from_slice(&ctime.to_be_bytes());
    out.push(is_dir as u8);
    out.extend_from_slice(name);
    out
}

/// READ_DIR_ENTRY_V2 end-of-directory sentinel.
pub fn encode_read_dir_entry_v2_end() -> Vec<u8> {
    let mut out = Vec::with_capacity(35);
    out.extend_from_slice(&(-1i64).to_be_bytes());
    out.resize(35, 0);
    out
}

/// Reply for WRITE_FILE: `i32 bytes_written`, `-1` on error.
pub fn encode_write_file_result(bytes_written: i32) -> [u8; 4] {
    bytes_written.to_be_bytes()
}

/// Reply for GET_DIR_SIZE: `i64 total`, `-1` on error.
pub fn encode_dir_size_result(total: i64) -> [u8; 8] {
    total.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_round_trip() {
        for raw in 0x1224u16..=0x1232 {
            let op = OpCode::try_from(raw).expect("known opcode");
            assert_eq!(op.as_u16(), raw);
        }
        assert!(OpCode::try_from(0x1233).is_err());
        assert!(OpCode::try_from(0).is_err());
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let mut frame = [0u8; COMMAND_LEN];
        frame[0..2].copy_from_slice(&0x2412u16.to_be_bytes());
        assert_eq!(
            decode_command(&frame),
            Err(DecodeError::UnknownOpCode { opcode: 0x2412 })
        );
    }

    #[test]
    fn command_encode_decode_round_trip() {
        let commands = [
            Command::OpenFile { path_len: 21 },
            Command::ReadFileCritical {
                len: 0x10000,
                offset: 0x1_0000_0000,
            },
            Command::ReadCd2048Critical {
                sectors: 2,
                start_sector: 16,
            },
            Command::ReadFile { len: 11, offset: 0 },
            Command::CreateFile { path_len: 8 },
            Command::WriteFile { len: 3 },
            Command::OpenDir { path_len: 5 },
            Command::ReadDirEntry,
            Command::DeleteFile { path_len: 9 },
            Command::Mkdir { path_len: 4 },
            Command::Rmdir { path_len: 4 },
            Command::ReadDirEntryV2,
            Command::StatFile { path_len: 16 },
            Command::GetDirSize { path_len: 6 },
            Command::ReadDir,
        ];

        for cmd in commands {
            let frame = encode_command(&cmd);
            assert_eq!(decode_command(&frame), Ok(cmd));
        }
    }
}
