//! Path virtualization over the confined root.
//!
//! Two magic prefixes let clients open images that do not exist on disk:
//! `/***DVD***/<dir>` synthesizes a plain ISO9660+Joliet image of `<dir>`,
//! `/***PS3***/<dir>` a PS3-mode one. Everything else opens a real file,
//! transparently wrapped in the Redump/3k3y decryption overlays when the
//! image calls for them.

use std::fs::Metadata;
use std::io;
use std::time::SystemTime;

use crate::encrypted_iso::{decode_key_file, EncryptedIso, ENCRYPTION_KEY_SIZE};
use crate::error::Result;
use crate::file::PlainFile;
use crate::root::{DirHandle, RootFs};
use crate::threek3y::{probe_3k3y, ThreeK3yIso, ThreeK3yProbe};
use crate::viso::VirtualIso;

const DVD_PREFIX: &str = "/***DVD***/";
const PS3_PREFIX: &str = "/***PS3***/";

const ISO_EXT: &str = ".iso";
const DKEY_EXT: &str = ".dkey";
const PS3_ISO_DIR: &str = "PS3ISO";
const REDKEY_DIR: &str = "REDKEY";

/// The result of opening a path for reading. Overlays forward `len`,
/// `modified` and `read_at` to the layer below; callers stay oblivious to
/// what they are actually reading.
#[derive(Debug)]
pub enum OpenFile {
    Plain(PlainFile),
    Encrypted(EncryptedIso),
    ThreeK3y(ThreeK3yIso),
    Viso(VirtualIso),
}

impl OpenFile {
    pub fn len(&self) -> u64 {
        match self {
            OpenFile::Plain(f) => f.len(),
            OpenFile::Encrypted(f) => f.len(),
            OpenFile::ThreeK3y(f) => f.len(),
            OpenFile::Viso(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn modified(&self) -> SystemTime {
        match self {
            OpenFile::Plain(f) => f.modified(),
            OpenFile::Encrypted(f) => f.modified(),
            OpenFile::ThreeK3y(f) => f.modified(),
            OpenFile::Viso(f) => f.created_at(),
        }
    }

    /// Reads up to `buf.len()` bytes at `offset`; short only at end of file.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            OpenFile::Plain(f) => f.read_at(offset, buf),
            OpenFile::Encrypted(f) => f.read_at(offset, buf),
            OpenFile::ThreeK3y(f) => f.read_at(offset, buf),
            OpenFile::Viso(f) => f.read_at(offset, buf),
        }
    }
}

fn split_virtual(client_path: &str) -> (String, Option<bool>) {
    let slashed = client_path.replace('\\', "/");
    if let Some(rest) = slashed.strip_prefix(PS3_PREFIX) {
        return (rest.to_string(), Some(true));
    }
    if let Some(rest) = slashed.strip_prefix(DVD_PREFIX) {
        return (rest.to_string(), Some(false));
    }
    (slashed, None)
}

/// The filesystem the protocol session talks to.
#[derive(Debug)]
pub struct Vfs {
    root: RootFs,
}

impl Vfs {
    pub fn new(root: RootFs) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &RootFs {
        &self.root
    }

    /// Opens a directory for enumeration. Virtual-ISO paths enumerate the
    /// backing tree, so clients can browse what an image will contain.
    pub fn open_dir(&self, client_path: &str) -> io::Result<DirHandle> {
        let (sub, _) = split_virtual(client_path);
        self.root.open_dir(&sub)
    }

    /// Stats a real path. Virtual prefixes are not recognized here.
    pub fn stat(&self, client_path: &str) -> io::Result<Metadata> {
        self.root.metadata(client_path)
    }

    /// Opens a path for reading, applying virtualization:
    /// virtual-ISO prefixes synthesize an image, plain `.iso` files under a
    /// `PS3ISO` directory get Redump key lookup, and everything carrying a
    /// 3k3y fingerprint gets the masking (and, if needed, decryption)
    /// overlays.
    pub fn open_file(&self, client_path: &str) -> Result<OpenFile> {
        let (sub, viso_mode) = split_virtual(client_path);

        if let Some(ps3_mode) = viso_mode {
            let real = self.root.resolve(&sub)?;
            return Ok(OpenFile::Viso(VirtualIso::build(&real, ps3_mode)?));
        }

        let real = self.root.resolve(&sub)?;
        let plain = PlainFile::open(&real)?;

        if let Some(data1) = self.redump_key(&sub)? {
            tracing::debug!(path = %sub, "serving image with redump key");
            return Ok(OpenFile::Encrypted(EncryptedIso::new(plain, &data1, false)?));
        }

        match probe_3k3y(&plain)? {
            ThreeK3yProbe::Encrypted { data1 } => {
                tracing::debug!(path = %sub, "serving encrypted 3k3y image");
                Ok(OpenFile::ThreeK3y(ThreeK3yIso::over_encrypted(
                    EncryptedIso::new(plain, &data1, false)?,
                )))
            }
            ThreeK3yProbe::MaskedOnly => {
                tracing::debug!(path = %sub, "serving decrypted 3k3y image");
                Ok(OpenFile::ThreeK3y(ThreeK3yIso::over_plain(plain)))
            }
            ThreeK3yProbe::NotThreeK3y => Ok(OpenFile::Plain(plain)),
        }
    }

    /// Looks for a Redump `data1` key next to an `.iso` under a `PS3ISO`
    /// directory: first `<base>.dkey` beside the image, then the same path
    /// with the `PS3ISO` component swapped for `REDKEY`. A missing key means
    /// the image is served as-is; a malformed key file is an error.
    fn redump_key(&self, sub: &str) -> Result<Option<[u8; ENCRYPTION_KEY_SIZE]>> {
        let parts: Vec<&str> = sub.split('/').filter(|p| !p.is_empty()).collect();
        let Some(&file_name) = parts.last() else {
            return Ok(None);
        };
        let Some(dot) = file_name.rfind('.') else {
            return Ok(None);
        };
        if !file_name[dot..].eq_ignore_ascii_case(ISO_EXT) {
            return Ok(None);
        }
        let Some(ps3iso_idx) = parts
            .iter()
            .position(|p| p.eq_ignore_ascii_case(PS3_ISO_DIR))
        else {
            return Ok(None);
        };

        let dkey_name = format!("{}{}", &file_name[..dot], DKEY_EXT);

        let mut beside: Vec<String> = parts.iter().map(|p| p.to_string()).collect();
        *beside.last_mut().expect("parts is non-empty") = dkey_name.clone();
        if let Some(key) = self.read_key_file(&beside.join("/"))? {
            return Ok(Some(key));
        }

        let mut redkey = beside;
        redkey[ps3iso_idx] = REDKEY_DIR.to_string();
        self.read_key_file(&redkey.join("/"))
    }

    fn read_key_file(&self, client_path: &str) -> Result<Option<[u8; ENCRYPTION_KEY_SIZE]>> {
        match self.root.read(client_path) {
            Ok(raw) => decode_key_file(&raw).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
