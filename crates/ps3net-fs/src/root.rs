//! Confined filesystem access.
//!
//! All client-supplied paths are interpreted under a single configured root.
//! Confinement is lexical: paths are normalized and any traversal that would
//! climb out of the root fails as "not found", indistinguishable from a
//! missing path.

use std::fs::{self, File, Metadata, OpenOptions, ReadDir};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug)]
pub struct RootFs {
    root: PathBuf,
}

impl RootFs {
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let meta = fs::metadata(&root)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("root {} is not a directory", root.display()),
            ));
        }
        Ok(Self { root })
    }

    pub fn base(&self) -> &Path {
        &self.root
    }

    /// Maps a client path onto the real filesystem. Escapes fail as not
    /// found.
    pub fn resolve(&self, client_path: &str) -> io::Result<PathBuf> {
        Ok(self.root.join(normalize_client_path(client_path)?))
    }

    /// Stats a path, following symlinks.
    pub fn metadata(&self, client_path: &str) -> io::Result<Metadata> {
        fs::metadata(self.resolve(client_path)?)
    }

    pub fn read(&self, client_path: &str) -> io::Result<Vec<u8>> {
        fs::read(self.resolve(client_path)?)
    }

    pub fn open_dir(&self, client_path: &str) -> io::Result<DirHandle> {
        DirHandle::open(self.resolve(client_path)?)
    }

    /// Opens a file for writing, creating or truncating it.
    pub fn create(&self, client_path: &str) -> io::Result<File> {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.resolve(client_path)?)
    }

    pub fn remove_file(&self, client_path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(client_path)?)
    }

    pub fn remove_dir(&self, client_path: &str) -> io::Result<()> {
        fs::remove_dir(self.resolve(client_path)?)
    }

    pub fn mkdir(&self, client_path: &str) -> io::Result<()> {
        fs::create_dir(self.resolve(client_path)?)
    }

    /// Sum of file sizes under a path. Symlinks are followed; entries that
    /// fail to stat are skipped.
    pub fn dir_size(&self, client_path: &str) -> io::Result<u64> {
        let real = self.resolve(client_path)?;
        fs::metadata(&real)?;

        let mut total = 0u64;
        for entry in walkdir::WalkDir::new(&real).follow_links(true) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unreadable entry in dir size walk");
                    continue;
                }
            };
            if entry.file_type().is_dir() {
                continue;
            }
            if let Ok(meta) = entry.metadata() {
                total += meta.len();
            }
        }
        Ok(total)
    }
}

/// Normalizes a client path to a relative path with no `.`/`..` components.
/// Clients may send either separator; leading slashes are ignored (all client
/// paths are "absolute" within the share).
pub(crate) fn normalize_client_path(path: &str) -> io::Result<PathBuf> {
    let slashed = path.replace('\\', "/");
    let mut out = PathBuf::new();
    for part in slashed.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                if !out.pop() {
                    return Err(io::Error::from(io::ErrorKind::NotFound));
                }
            }
            part => out.push(part),
        }
    }
    Ok(out)
}

/// An open directory being enumerated. Entries come back stat-resolved
/// (symlink targets, not links); entries whose stat fails are skipped, which
/// drops broken symlinks.
#[derive(Debug)]
pub struct DirHandle {
    path: PathBuf,
    iter: ReadDir,
}

impl DirHandle {
    fn open(path: PathBuf) -> io::Result<Self> {
        let meta = fs::metadata(&path)?;
        if !meta.is_dir() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not a directory", path.display()),
            ));
        }
        Ok(Self {
            iter: fs::read_dir(&path)?,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The next readable entry, or `None` at end of directory (or on an
    /// enumeration error, which ends the stream like the original server).
    pub fn next_entry(&mut self) -> Option<DirEntryInfo> {
        loop {
            let entry = match self.iter.next()? {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(path = %self.path.display(), error = %err, "read_dir failed");
                    return None;
                }
            };

            // Stat to resolve symlinks; skip anything that fails (deleted
            // concurrently, broken symlink, unreadable target).
            let meta = match fs::metadata(entry.path()) {
                Ok(meta) => meta,
                Err(_) => continue,
            };

            return Some(DirEntryInfo::from_metadata(
                entry.file_name().to_string_lossy().into_owned(),
                &meta,
            ));
        }
    }

    pub fn read_all(&mut self) -> Vec<DirEntryInfo> {
        std::iter::from_fn(|| self.next_entry()).collect()
    }
}

/// A stat-resolved directory entry, times in unix-UTC seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
    pub mtime: u64,
    pub atime: u64,
    pub ctime: u64,
}

impl DirEntryInfo {
    pub fn from_metadata(name: String, meta: &Metadata) -> Self {
        let (mtime, atime, ctime) = file_times(meta);
        Self {
            name,
            size: meta.len(),
            is_dir: meta.is_dir(),
            mtime,
            atime,
            ctime,
        }
    }
}

/// Seconds since the unix epoch, clamped at zero for pre-epoch times.
pub fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// (mtime, atime, ctime) in unix-UTC seconds.
#[cfg(unix)]
pub fn file_times(meta: &Metadata) -> (u64, u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (
        meta.mtime().max(0) as u64,
        meta.atime().max(0) as u64,
        meta.ctime().max(0) as u64,
    )
}

/// (mtime, atime, ctime) in unix-UTC seconds. Change time is not portably
/// available, so it mirrors mtime.
#[cfg(not(unix))]
pub fn file_times(meta: &Metadata) -> (u64, u64, u64) {
    let mtime = meta
        .modified()
        .map(unix_seconds)
        .unwrap_or(0);
    let atime = meta.accessed().map(unix_seconds).unwrap_or(mtime);
    (mtime, atime, mtime)
}
