#![forbid(unsafe_code)]

//! Filesystem core of the ps3net file service.
//!
//! This crate provides:
//!
//! - [`RootFs`]: byte-for-byte confined access under a served root directory
//! - [`Vfs`]: path virtualization (`/***DVD***/`, `/***PS3***/` synthesize
//!   images on the fly) and transparent decryption overlays for Redump/3k3y
//!   disc dumps
//! - [`VirtualIso`]: a seekable, read-only ISO9660+Joliet image synthesized
//!   from a directory tree, with the PS3-specific metadata sectors
//! - [`EncryptedIso`] / [`ThreeK3yIso`]: byte-addressed decryption and
//!   fingerprint-masking overlays over disc images
//!
//! The network protocol layer lives in `ps3net-server`; nothing in this crate
//! touches a socket.

mod encoder;
mod encrypted_iso;
mod error;
mod file;
mod iso9660;
mod root;
mod sfo;
mod size;
mod threek3y;
mod vfs;
mod viso;

pub use encrypted_iso::{
    decode_key_file, derive_iso_key, encrypt_sector, EncryptedIso, ENCRYPTION_KEY_SIZE,
};
pub use error::{FsError, Result};
pub use file::PlainFile;
pub use root::{file_times, unix_seconds, DirEntryInfo, DirHandle, RootFs};
pub use sfo::sfo_field;
pub use size::{ByteCount, SectorCount, SECTOR_SIZE};
pub use threek3y::{probe_3k3y, ThreeK3yIso, ThreeK3yProbe};
pub use vfs::{OpenFile, Vfs};
pub use viso::{VirtualIso, PARAM_SFO_RELATIVE};
