//! 3k3y fingerprint handling.
//!
//! 3k3y rips carry a 256-byte fingerprint block at image offset 0xF70
//! (watermark, embedded key, random padding). The overlay zeroes that block
//! during reads; the probe decides whether an image is a 3k3y rip and whether
//! it is still encrypted.

use std::io;
use std::time::SystemTime;

use crate::encrypted_iso::{EncryptedIso, ENCRYPTION_KEY_SIZE};
use crate::file::PlainFile;

const MASKED_DATA_START: u64 = 0xf70;
const MASKED_DATA_SIZE: usize = 256;
const MASKED_DATA_END: u64 = MASKED_DATA_START + MASKED_DATA_SIZE as u64;

const WATERMARK_SIZE: usize = 16;
// The watermark is followed by the 16-byte data1 key on encrypted rips.
const KEY_OFFSET: usize = 0x10;

const ENCRYPTED_WATERMARK: &[u8; WATERMARK_SIZE] = b"Encrypted 3K BLD";
const DECRYPTED_WATERMARK: &[u8; WATERMARK_SIZE] = b"Dncrypted 3K BLD";

/// Result of probing a file for the 3k3y fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreeK3yProbe {
    /// Encrypted rip; `data1` was embedded next to the watermark.
    Encrypted {
        data1: [u8; ENCRYPTION_KEY_SIZE],
    },
    /// Already-decrypted rip; only the fingerprint needs masking.
    MaskedOnly,
    NotThreeK3y,
}

/// Reads the fingerprint block and classifies the image. Files too short to
/// hold the block are not 3k3y images.
pub fn probe_3k3y(file: &PlainFile) -> io::Result<ThreeK3yProbe> {
    let mut block = [0u8; MASKED_DATA_SIZE];
    let n = file.read_at(MASKED_DATA_START, &mut block)?;
    if n < MASKED_DATA_SIZE {
        return Ok(ThreeK3yProbe::NotThreeK3y);
    }

    let watermark = &block[..WATERMARK_SIZE];
    if watermark == ENCRYPTED_WATERMARK {
        let mut data1 = [0u8; ENCRYPTION_KEY_SIZE];
        data1.copy_from_slice(&block[KEY_OFFSET..KEY_OFFSET + ENCRYPTION_KEY_SIZE]);
        Ok(ThreeK3yProbe::Encrypted { data1 })
    } else if watermark == DECRYPTED_WATERMARK {
        Ok(ThreeK3yProbe::MaskedOnly)
    } else {
        Ok(ThreeK3yProbe::NotThreeK3y)
    }
}

#[derive(Debug)]
enum Inner {
    Plain(PlainFile),
    Encrypted(EncryptedIso),
}

/// Overlay zeroing the 3k3y fingerprint block during reads. Wraps either a
/// plain file (decrypted rip) or an [`EncryptedIso`] (encrypted rip).
#[derive(Debug)]
pub struct ThreeK3yIso {
    inner: Inner,
}

impl ThreeK3yIso {
    pub fn over_plain(inner: PlainFile) -> Self {
        Self {
            inner: Inner::Plain(inner),
        }
    }

    pub fn over_encrypted(inner: EncryptedIso) -> Self {
        Self {
            inner: Inner::Encrypted(inner),
        }
    }

    pub fn len(&self) -> u64 {
        match &self.inner {
            Inner::Plain(f) => f.len(),
            Inner::Encrypted(f) => f.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn modified(&self) -> SystemTime {
        match &self.inner {
            Inner::Plain(f) => f.modified(),
            Inner::Encrypted(f) => f.modified(),
        }
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let n = match &self.inner {
            Inner::Plain(f) => f.read_at(offset, buf)?,
            Inner::Encrypted(f) => f.read_at(offset, buf)?,
        };
        mask_fingerprint(offset, &mut buf[..n]);
        Ok(n)
    }
}

fn mask_fingerprint(start: u64, data: &mut [u8]) {
    let end = start + data.len() as u64;
    if start >= MASKED_DATA_END || end <= MASKED_DATA_START {
        return;
    }

    let from = MASKED_DATA_START.saturating_sub(start) as usize;
    let to = (MASKED_DATA_END.min(end) - start) as usize;
    data[from..to].fill(0);
}
