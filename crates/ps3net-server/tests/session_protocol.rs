//! Drives a real server over TCP through the wire protocol.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::time::Duration;

use ps3net_proto::{encode_command, Command};
use ps3net_server::{start_server, ServerConfig, ServerHandle};

struct TestServer {
    rt: tokio::runtime::Runtime,
    handle: Option<ServerHandle>,
    addr: SocketAddr,
}

impl TestServer {
    fn start(root: &Path, configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let mut cfg = ServerConfig {
            root: root.to_path_buf(),
            listen_addr: "127.0.0.1:0".parse().unwrap(),
            ..Default::default()
        };
        configure(&mut cfg);

        let handle = rt.block_on(start_server(cfg)).unwrap();
        let addr = handle.local_addr();
        Self {
            rt,
            handle: Some(handle),
            addr,
        }
    }

    fn connect(&self) -> Client {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        Client { stream }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.rt.block_on(handle.shutdown());
        }
    }
}

struct Client {
    stream: TcpStream,
}

impl Client {
    fn send(&mut self, cmd: Command, payload: &[u8]) {
        self.stream.write_all(&encode_command(&cmd)).unwrap();
        if !payload.is_empty() {
            self.stream.write_all(payload).unwrap();
        }
    }

    fn send_path(&mut self, opcode: fn(u16) -> Command, path: &str) {
        self.send(opcode(path.len() as u16), path.as_bytes());
    }

    fn read_exact(&mut self, n: usize) -> Vec<u8> {
        let mut buf = vec![0u8; n];
        self.stream.read_exact(&mut buf).unwrap();
        buf
    }

    fn read_i32(&mut self) -> i32 {
        i32::from_be_bytes(self.read_exact(4).try_into().unwrap())
    }

    fn read_i64(&mut self) -> i64 {
        i64::from_be_bytes(self.read_exact(8).try_into().unwrap())
    }

    fn read_u64(&mut self) -> u64 {
        u64::from_be_bytes(self.read_exact(8).try_into().unwrap())
    }

    fn read_u16(&mut self) -> u16 {
        u16::from_be_bytes(self.read_exact(2).try_into().unwrap())
    }

    /// True when the server has torn the connection down.
    fn at_eof(&mut self) -> bool {
        let mut byte = [0u8; 1];
        matches!(self.stream.read(&mut byte), Ok(0) | Err(_))
    }

    fn open_dir(&mut self, path: &str) -> i32 {
        self.send_path(|path_len| Command::OpenDir { path_len }, path);
        self.read_i32()
    }

    fn open_file(&mut self, path: &str) -> (i64, u64) {
        self.send_path(|path_len| Command::OpenFile { path_len }, path);
        (self.read_i64(), self.read_u64())
    }

    fn read_file(&mut self, len: u32, offset: u64) -> (i32, Vec<u8>) {
        self.send(Command::ReadFile { len, offset }, &[]);
        let n = self.read_i32();
        let data = if n > 0 { self.read_exact(n as usize) } else { Vec::new() };
        (n, data)
    }

    fn read_file_critical(&mut self, len: u32, offset: u64) {
        self.send(Command::ReadFileCritical { len, offset }, &[]);
    }

    /// One streamed v1 entry, or `None` on the end-of-directory sentinel.
    fn read_dir_entry(&mut self) -> Option<(i64, bool, String)> {
        self.send(Command::ReadDirEntry, &[]);
        let size = self.read_i64();
        let name_len = self.read_u16();
        let is_dir = self.read_exact(1)[0] != 0;
        if size == -1 && name_len == 0 {
            return None;
        }
        let name = String::from_utf8(self.read_exact(name_len as usize)).unwrap();
        Some((size, is_dir, name))
    }

    /// One streamed v2 entry, or `None` on the sentinel.
    fn read_dir_entry_v2(&mut self) -> Option<(i64, u64, u64, u64, bool, String)> {
        self.send(Command::ReadDirEntryV2, &[]);
        let size = self.read_i64();
        let name_len = self.read_u16();
        let mtime = self.read_u64();
        let atime = self.read_u64();
        let ctime = self.read_u64();
        let is_dir = self.read_exact(1)[0] != 0;
        if size == -1 && name_len == 0 {
            return None;
        }
        let name = String::from_utf8(self.read_exact(name_len as usize)).unwrap();
        Some((size, mtime, atime, ctime, is_dir, name))
    }

    fn read_dir(&mut self) -> Vec<(i64, u64, bool, String)> {
        self.send(Command::ReadDir, &[]);
        let count = self.read_i64();
        (0..count)
            .map(|_| {
                let size = self.read_i64();
                let mtime = self.read_u64();
                let is_dir = self.read_exact(1)[0] != 0;
                let raw_name = self.read_exact(512);
                let end = raw_name.iter().position(|&b| b == 0).unwrap_or(512);
                let name = String::from_utf8(raw_name[..end].to_vec()).unwrap();
                (size, mtime, is_dir, name)
            })
            .collect()
    }

    fn stat(&mut self, path: &str) -> (i64, u64, u64, u64, bool) {
        self.send_path(|path_len| Command::StatFile { path_len }, path);
        (
            self.read_i64(),
            self.read_u64(),
            self.read_u64(),
            self.read_u64(),
            self.read_exact(1)[0] != 0,
        )
    }

    fn create_file(&mut self, path: &str) -> i32 {
        self.send_path(|path_len| Command::CreateFile { path_len }, path);
        self.read_i32()
    }

    fn write_file(&mut self, data: &[u8]) -> i32 {
        self.send(
            Command::WriteFile {
                len: data.len() as u32,
            },
            data,
        );
        self.read_i32()
    }

    fn delete_file(&mut self, path: &str) -> i32 {
        self.send_path(|path_len| Command::DeleteFile { path_len }, path);
        self.read_i32()
    }

    fn mkdir(&mut self, path: &str) -> i32 {
        self.send_path(|path_len| Command::Mkdir { path_len }, path);
        self.read_i32()
    }

    fn rmdir(&mut self, path: &str) -> i32 {
        self.send_path(|path_len| Command::Rmdir { path_len }, path);
        self.read_i32()
    }

    fn get_dir_size(&mut self, path: &str) -> i64 {
        self.send_path(|path_len| Command::GetDirSize { path_len }, path);
        self.read_i64()
    }
}

fn sample_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    std::fs::create_dir(root.join("GAMES")).unwrap();
    std::fs::write(root.join("GAMES/hello.txt"), b"hello world").unwrap();
    std::fs::create_dir(root.join("dir1")).unwrap();
    std::fs::write(root.join("dir1/A.TXT"), b"a content").unwrap();
    std::fs::write(root.join("dir1/c.txt"), b"c content").unwrap();
    std::fs::create_dir(root.join("dir1/DIR2")).unwrap();
    std::fs::write(root.join("dir1/DIR2/b.txt"), b"b content").unwrap();
    dir
}

#[test]
fn plain_file_read() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    let (size, mtime) = client.open_file("/GAMES/hello.txt");
    assert_eq!(size, 11);
    assert!(mtime > 0);

    let (n, data) = client.read_file(11, 0);
    assert_eq!(n, 11);
    assert_eq!(data, b"hello world");

    let (n, data) = client.read_file(5, 6);
    assert_eq!(n, 5);
    assert_eq!(data, b"world");

    // A limit past EOF returns what the file has.
    let (n, data) = client.read_file(100, 6);
    assert_eq!(n, 5);
    assert_eq!(data, b"world");

    // CLOSEFILE closes the slot and replies all zeroes.
    let (size, mtime) = client.open_file("/CLOSEFILE");
    assert_eq!((size, mtime), (0, 0));

    // With no file open, reads report an error but the session continues.
    let (n, _) = client.read_file(4, 0);
    assert_eq!(n, -1);

    let (size, _) = client.open_file("/GAMES/missing.bin");
    assert_eq!(size, -1);
}

#[test]
fn open_file_followed_by_full_read_round_trips() {
    let root = sample_root();
    let payload: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.path().join("GAMES/blob.bin"), &payload).unwrap();

    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    let (size, _) = client.open_file("/GAMES/blob.bin");
    assert_eq!(size, payload.len() as i64);
    let (n, data) = client.read_file(size as u32, 0);
    assert_eq!(n as usize, payload.len());
    assert_eq!(data, payload);
}

#[test]
fn directory_enumeration_streamed() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    assert_eq!(client.open_dir("/dir1"), 0);

    let mut entries = Vec::new();
    while let Some(entry) = client.read_dir_entry() {
        entries.push(entry);
    }
    entries.sort_by(|a, b| a.2.cmp(&b.2));
    assert_eq!(
        entries,
        vec![
            (9, false, "A.TXT".to_string()),
            (0, true, "DIR2".to_string()),
            (9, false, "c.txt".to_string()),
        ]
    );

    // The handle auto-closed at EOD; the next read is the sentinel again.
    assert_eq!(client.read_dir_entry(), None);
}

#[test]
fn directory_enumeration_v2_carries_times() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    assert_eq!(client.open_dir("/dir1"), 0);
    let mut seen = 0;
    while let Some((size, mtime, _atime, _ctime, is_dir, name)) = client.read_dir_entry_v2() {
        assert!(mtime > 0, "entry {name} has no mtime");
        if !is_dir {
            assert_eq!(size, 9);
        }
        seen += 1;
    }
    assert_eq!(seen, 3);
}

#[test]
fn directory_batch_read() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    assert_eq!(client.open_dir("/dir1"), 0);
    let mut entries = client.read_dir();
    entries.sort_by(|a, b| a.3.cmp(&b.3));

    let names: Vec<&str> = entries.iter().map(|e| e.3.as_str()).collect();
    assert_eq!(names, ["A.TXT", "DIR2", "c.txt"]);
    assert!(entries.iter().all(|e| e.1 > 0), "all entries carry mtimes");
    assert_eq!(entries[1].0, 0); // directories report size 0
    assert!(entries[1].2);

    // Without an open dir the batch is empty.
    let mut fresh = server.connect();
    assert!(fresh.read_dir().is_empty());
}

#[test]
fn open_dir_on_file_or_missing_path_fails() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    assert_eq!(client.open_dir("/GAMES/hello.txt"), -1);
    assert_eq!(client.open_dir("/nope"), -1);
    assert_eq!(client.open_dir("/GAMES"), 0);
}

#[test]
fn stat_file_dir_and_missing() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    let (size, mtime, atime, ctime, is_dir) = client.stat("/GAMES/hello.txt");
    assert_eq!(size, 11);
    assert!(!is_dir);
    assert!(mtime > 0 && atime > 0 && ctime > 0);

    let (size, _, _, _, is_dir) = client.stat("/GAMES");
    assert_eq!(size, 0);
    assert!(is_dir);

    let (size, mtime, atime, ctime, is_dir) = client.stat("/missing");
    assert_eq!(size, -1);
    assert_eq!((mtime, atime, ctime, is_dir), (0, 0, 0, false));
}

#[test]
fn path_escapes_are_not_found() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    assert_eq!(client.stat("/../secret").0, -1);
    assert_eq!(client.open_file("/../../etc/passwd").0, -1);
    assert_eq!(client.open_dir("/.."), -1);
}

#[test]
fn writes_gated_off_by_default() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    assert_eq!(client.create_file("/new.bin"), -1);
    assert!(!root.path().join("new.bin").exists());

    // The refused write still drains its payload; the session stays usable.
    assert_eq!(client.write_file(b"ABC"), -1);
    assert_eq!(client.mkdir("/sub"), -1);
    assert_eq!(client.delete_file("/GAMES/hello.txt"), -1);
    assert_eq!(client.rmdir("/dir1"), -1);
    assert!(root.path().join("GAMES/hello.txt").exists());

    assert_eq!(client.stat("/GAMES/hello.txt").0, 11);
}

#[test]
fn write_cycle_with_writes_enabled() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |cfg| cfg.allow_write = true);
    let mut client = server.connect();

    assert_eq!(client.create_file("/new.bin"), 0);
    assert_eq!(client.write_file(b"ABC"), 3);
    // Passing a directory path closes the write slot.
    assert_eq!(client.create_file("/"), 0);
    assert_eq!(
        std::fs::read(root.path().join("new.bin")).unwrap(),
        b"ABC"
    );

    // Writing without an open slot fails but keeps the session alive.
    assert_eq!(client.write_file(b"XYZ"), -1);
    assert_eq!(
        std::fs::read(root.path().join("new.bin")).unwrap(),
        b"ABC"
    );

    assert_eq!(client.mkdir("/sub"), 0);
    assert!(root.path().join("sub").is_dir());
    assert_eq!(client.rmdir("/sub"), 0);
    assert_eq!(client.delete_file("/new.bin"), 0);
    assert!(!root.path().join("new.bin").exists());
    assert_eq!(client.delete_file("/new.bin"), -1);
}

#[test]
fn dir_size_sums_recursively() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    assert_eq!(client.get_dir_size("/dir1"), 27);
    assert_eq!(client.get_dir_size("/"), 27 + 11);
    assert_eq!(client.get_dir_size("/missing"), -1);
}

#[test]
fn unknown_opcode_tears_down_the_connection() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    let mut frame = [0u8; 16];
    frame[0..2].copy_from_slice(&0x9999u16.to_be_bytes());
    client.stream.write_all(&frame).unwrap();

    assert!(client.at_eof());
}

#[test]
fn critical_read_streams_raw_bytes() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    client.open_file("/GAMES/hello.txt");
    client.read_file_critical(11, 0);
    assert_eq!(client.read_exact(11), b"hello world");

    // The session is still alive.
    assert_eq!(client.stat("/GAMES/hello.txt").0, 11);
}

#[test]
fn short_critical_read_aborts_the_connection() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    client.open_file("/GAMES/hello.txt");
    client.read_file_critical(100, 0);

    // The file only has 11 bytes; the server sends what it can and drops
    // the connection with no further reply.
    let mut partial = Vec::new();
    let n = client.stream.read_to_end(&mut partial).unwrap();
    assert_eq!(&partial[..11], b"hello world");
    assert_eq!(n, 11);
}

#[test]
fn cd_sector_size_detection_and_2048_reads() {
    let root = sample_root();

    // A raw 2352-byte-per-sector image: the probe finds the ISO9660 magic at
    // its candidate offset, and the 2048-byte payload reads skip the 24-byte
    // sync prefix of every raw sector.
    let sector_size = 2352usize;
    let mut image = vec![0u8; 0x0020_0000];
    let probe_at = 24 + 16 * 2048 + (sector_size - 2048);
    image[probe_at..probe_at + 6].copy_from_slice(b"\x01CD001");
    let s16 = 24 + 16 * sector_size;
    image[s16..s16 + 2048].fill(0xa1);
    let s17 = s16 + sector_size;
    image[s17..s17 + 2048].fill(0xa2);
    std::fs::write(root.path().join("GAMES/disc.bin"), &image).unwrap();

    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    let (size, _) = client.open_file("/GAMES/disc.bin");
    assert_eq!(size, image.len() as i64);

    client.send(
        Command::ReadCd2048Critical {
            sectors: 2,
            start_sector: 16,
        },
        &[],
    );
    let data = client.read_exact(2 * 2048);
    assert!(data[..2048].iter().all(|&b| b == 0xa1));
    assert!(data[2048..].iter().all(|&b| b == 0xa2));
}

#[test]
fn virtual_iso_over_the_protocol() {
    let root = sample_root();
    std::fs::create_dir_all(root.path().join("GAME1/PS3_GAME")).unwrap();
    std::fs::write(
        root.path().join("GAME1/PS3_GAME/PARAM.SFO"),
        build_sfo("TITLE_ID", "BLUS12345"),
    )
    .unwrap();
    std::fs::create_dir_all(root.path().join("GAME1/PS3_GAME/USRDIR")).unwrap();
    std::fs::write(root.path().join("GAME1/PS3_GAME/USRDIR/EBOOT.BIN"), [1u8; 64]).unwrap();

    let server = TestServer::start(root.path(), |_| {});
    let mut client = server.connect();

    // Browsing the virtual path lists the backing tree.
    assert_eq!(client.open_dir("/***PS3***/GAME1"), 0);
    let entries = client.read_dir();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].3, "PS3_GAME");

    // Opening it as a file streams the synthesized image.
    let (size, mtime) = client.open_file("/***PS3***/GAME1");
    assert!(size > 0);
    assert_eq!(size % (32 * 2048), 0);
    assert!(mtime > 0);

    // Sector 1 carries the disc-info record.
    let (n, sector1) = client.read_file(2048, 2048);
    assert_eq!(n, 2048);
    assert_eq!(&sector1[..16], b"PlayStation3    ");
    assert_eq!(&sector1[16..26], b"BLUS-12345");

    // Sector 16 is the primary volume descriptor.
    let (_, pvd) = client.read_file(2048, 16 * 2048);
    assert_eq!(pvd[0], 1);
    assert_eq!(&pvd[1..6], b"CD001");

    // The non-PS3 flavor works on any directory and has an empty system
    // area.
    let (size, _) = client.open_file("/***DVD***/dir1");
    assert!(size > 0);
    let (_, sector0) = client.read_file(2048, 0);
    assert!(sector0.iter().all(|&b| b == 0));

    // PS3 mode on a tree without PARAM.SFO fails the open.
    let (size, _) = client.open_file("/***PS3***/dir1");
    assert_eq!(size, -1);
}

#[test]
fn max_clients_cap_drops_excess_connections() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |cfg| cfg.max_clients = 1);

    let mut first = server.connect();
    assert_eq!(first.stat("/GAMES/hello.txt").0, 11);

    // The second connection is accepted and immediately dropped.
    let mut second = server.connect();
    second
        .stream
        .write_all(&encode_command(&Command::ReadDir))
        .unwrap();
    assert!(second.at_eof());

    // The first session keeps working.
    assert_eq!(first.stat("/GAMES/hello.txt").0, 11);
}

#[test]
fn read_deadline_tears_down_idle_connections() {
    let root = sample_root();
    let server = TestServer::start(root.path(), |cfg| {
        cfg.read_timeout = Duration::from_millis(200);
    });

    let mut client = server.connect();
    assert_eq!(client.stat("/GAMES/hello.txt").0, 11);

    std::thread::sleep(Duration::from_millis(600));
    assert!(client.at_eof());
}

/// Minimal single-field PARAM.SFO (little-endian).
fn build_sfo(key: &str, value: &str) -> Vec<u8> {
    let key_table_start = 20 + 16u32;
    let data_table_start = key_table_start + key.len() as u32 + 1;

    let mut out = Vec::new();
    out.extend_from_slice(&[0, b'P', b'S', b'F']);
    out.extend_from_slice(&[1, 1, 0, 0]);
    out.extend_from_slice(&key_table_start.to_le_bytes());
    out.extend_from_slice(&data_table_start.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());

    out.extend_from_slice(&0u16.to_le_bytes()); // key offset
    out.extend_from_slice(&0x0204u16.to_le_bytes());
    out.extend_from_slice(&(value.len() as u32 + 1).to_le_bytes());
    out.extend_from_slice(&(value.len() as u32 + 1).to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // data offset

    out.extend_from_slice(key.as_bytes());
    out.push(0);
    out.extend_from_slice(value.as_bytes());
    out.push(0);
    out
}
