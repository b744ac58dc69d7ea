//! Transparent decryption of Redump / 3k3y PS3 disc images.
//!
//! These dumps are not encrypted end to end: the image starts with a map of
//! *unencrypted* sector regions, and the gaps between them are AES-128-CBC
//! encrypted per 2048-byte sector. See
//! <https://www.psdevwiki.com/ps3/Bluray_disc#Encryption>.

use std::io;
use std::time::SystemTime;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use aes::Aes128;

use crate::error::{FsError, Result};
use crate::file::PlainFile;
use crate::size::{ByteCount, SectorCount, SECTOR_SIZE};

pub const ENCRYPTION_KEY_SIZE: usize = 16;

// Base key/IV pair for images: the per-image sector key is data1 encrypted
// with these constants in CBC mode.
const KEY_DATA1: [u8; ENCRYPTION_KEY_SIZE] = [
    0x38, 0x0b, 0xcf, 0x0b, 0x53, 0x45, 0x5b, 0x3c, 0x78, 0x17, 0xab, 0x4f, 0xa3, 0xba, 0x90,
    0xed,
];
const IV_DATA1: [u8; ENCRYPTION_KEY_SIZE] = [
    0x69, 0x47, 0x47, 0x72, 0xaf, 0x6f, 0xda, 0xb3, 0x42, 0x74, 0x3a, 0xef, 0xaa, 0x18, 0x62,
    0x87,
];

// Guard against absurd allocations from untrusted images.
const MAX_REGION_COUNT: u32 = 4096;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Half-open encrypted sector range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Region {
    start: SectorCount,
    end: SectorCount,
}

/// Read-only overlay decrypting the encrypted regions of an image on the fly.
///
/// Reads may come in at arbitrary byte offsets; they are widened internally
/// to whole sectors so edge sectors decrypt correctly, and every sector gets
/// a fresh CBC context, so `read_at` has no shared cipher state.
#[derive(Debug)]
pub struct EncryptedIso {
    inner: PlainFile,
    clear_regions: bool,
    regions_header_size: u64,
    encrypted_regions: Vec<Region>,
    key: [u8; ENCRYPTION_KEY_SIZE],
}

impl EncryptedIso {
    /// Wraps `inner` using the 16-byte `data1` key. `clear_regions` zeroes
    /// the region map header during reads; the live server passes `false`,
    /// the batch decrypt tool `true`.
    pub fn new(
        inner: PlainFile,
        data1: &[u8; ENCRYPTION_KEY_SIZE],
        clear_regions: bool,
    ) -> Result<Self> {
        let mut header = [0u8; 8];
        inner.read_exact_at(0, &mut header)?;
        let count = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);

        // At least one unencrypted region on each side of an encrypted one.
        if count < 2 {
            return Err(FsError::CorruptEncryptedImage(
                "fewer than two unencrypted regions",
            ));
        }
        if count > MAX_REGION_COUNT {
            return Err(FsError::CorruptEncryptedImage("region map too large"));
        }

        let mut raw = vec![0u8; count as usize * 8];
        inner.read_exact_at(8, &mut raw)?;

        let mut unencrypted = Vec::with_capacity(count as usize);
        for pair in raw.chunks_exact(8) {
            let start = u32::from_be_bytes([pair[0], pair[1], pair[2], pair[3]]);
            let end = u32::from_be_bytes([pair[4], pair[5], pair[6], pair[7]]);
            unencrypted.push((SectorCount(start), SectorCount(end)));
        }

        if unencrypted[0].0 != SectorCount(0) {
            return Err(FsError::CorruptEncryptedImage(
                "region 0 does not start at sector 0",
            ));
        }

        // Region borders must increase monotonically; encrypted regions are
        // the gaps between consecutive unencrypted ones.
        let mut encrypted_regions = Vec::with_capacity(count as usize - 1);
        let mut prev_end = SectorCount(0);
        for (i, &(start, end)) in unencrypted.iter().enumerate() {
            if end <= start {
                return Err(FsError::CorruptEncryptedImage("region end before start"));
            }
            if start < prev_end {
                return Err(FsError::CorruptEncryptedImage(
                    "region starts before previous region ends",
                ));
            }
            prev_end = end;

            if i > 0 {
                encrypted_regions.push(Region {
                    start: unencrypted[i - 1].1,
                    end: start,
                });
            }
        }

        Ok(Self {
            inner,
            clear_regions,
            regions_header_size: 8 + count as u64 * 8,
            encrypted_regions,
            key: derive_iso_key(data1),
        })
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn modified(&self) -> SystemTime {
        self.inner.modified()
    }

    /// Reads up to `buf.len()` bytes at `offset`, decrypted. Short only at
    /// end of file.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = self.inner.len();
        if offset >= len || buf.is_empty() {
            return Ok(0);
        }
        let want = (buf.len() as u64).min(len - offset) as usize;

        // Widen to sector boundaries so edge sectors decrypt correctly.
        let aligned_start = ByteCount(offset).floor_sectors();
        let aligned_end = ByteCount(offset + want as u64).sectors();
        let mut scratch = vec![0u8; (aligned_end - aligned_start).bytes().0 as usize];
        let got = self.inner.read_at(aligned_start.bytes().0, &mut scratch)?;
        scratch.truncate(got);

        // Only whole sectors present in the scratch buffer can be decrypted;
        // a trailing partial sector (truncated image) stays as read.
        let whole_sectors = SectorCount((got as u64 / SECTOR_SIZE) as u32);
        for region in &self.encrypted_regions {
            let lo = region.start.max(aligned_start);
            let hi = region.end.min(aligned_start + whole_sectors);
            let mut sector = lo;
            while sector < hi {
                let at = (sector - aligned_start).bytes().0 as usize;
                decrypt_sector(&self.key, sector.0, &mut scratch[at..at + SECTOR_SIZE as usize]);
                sector = sector.next();
            }
        }

        if self.clear_regions && aligned_start.bytes().0 < self.regions_header_size {
            let n = (self.regions_header_size - aligned_start.bytes().0).min(got as u64) as usize;
            scratch[..n].fill(0);
        }

        let skip = (offset - aligned_start.bytes().0) as usize;
        let avail = got.saturating_sub(skip).min(want);
        buf[..avail].copy_from_slice(&scratch[skip..skip + avail]);
        Ok(avail)
    }
}

/// Derives the per-image sector key: `data1` encrypted with the fixed
/// key/IV constants in CBC mode.
pub fn derive_iso_key(data1: &[u8; ENCRYPTION_KEY_SIZE]) -> [u8; ENCRYPTION_KEY_SIZE] {
    let mut block = *data1;
    let mut enc = Aes128CbcEnc::new(&KEY_DATA1.into(), &IV_DATA1.into());
    enc.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
    block
}

/// Per-sector IV: zero except the sector number big-endian in the last four
/// bytes.
fn sector_iv(sector: u32) -> [u8; ENCRYPTION_KEY_SIZE] {
    let mut iv = [0u8; ENCRYPTION_KEY_SIZE];
    iv[ENCRYPTION_KEY_SIZE - 4..].copy_from_slice(&sector.to_be_bytes());
    iv
}

fn decrypt_sector(key: &[u8; ENCRYPTION_KEY_SIZE], sector: u32, data: &mut [u8]) {
    let iv = sector_iv(sector);
    let mut dec = Aes128CbcDec::new(key.into(), &iv.into());
    for block in data.chunks_exact_mut(16) {
        dec.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Encrypts one sector in place. The inverse of what [`EncryptedIso`] does
/// during reads; used by tests and image tooling.
pub fn encrypt_sector(key: &[u8; ENCRYPTION_KEY_SIZE], sector: u32, data: &mut [u8]) {
    let iv = sector_iv(sector);
    let mut enc = Aes128CbcEnc::new(key.into(), &iv.into());
    for block in data.chunks_exact_mut(16) {
        enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Decodes a Redump key file: 32 ASCII hex characters for 16 bytes of
/// `data1`. Trailing whitespace is tolerated.
pub fn decode_key_file(raw: &[u8]) -> Result<[u8; ENCRYPTION_KEY_SIZE]> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| FsError::InvalidKeyFile)?
        .trim_end();
    let hex_chars = text.get(..ENCRYPTION_KEY_SIZE * 2).ok_or(FsError::InvalidKeyFile)?;
    let decoded = hex::decode(hex_chars).map_err(|_| FsError::InvalidKeyFile)?;
    let mut key = [0u8; ENCRYPTION_KEY_SIZE];
    key.copy_from_slice(&decoded);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(dir: &tempfile::TempDir, name: &str, data: &[u8]) -> PlainFile {
        let path = dir.path().join(name);
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        PlainFile::open(&path).unwrap()
    }

    fn region_header(regions: &[(u32, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(regions.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0u8; 4]);
        for &(start, end) in regions {
            out.extend_from_slice(&start.to_be_bytes());
            out.extend_from_slice(&end.to_be_bytes());
        }
        out
    }

    fn image_with_header(regions: &[(u32, u32)], sectors: u32) -> Vec<u8> {
        let mut image = vec![0u8; (sectors as u64 * SECTOR_SIZE) as usize];
        let header = region_header(regions);
        image[..header.len()].copy_from_slice(&header);
        image
    }

    #[test]
    fn parses_region_map() {
        let dir = tempfile::tempdir().unwrap();
        let f = write_temp(&dir, "ok.iso", &image_with_header(&[(0, 2), (5, 8)], 8));
        let iso = EncryptedIso::new(f, &[7u8; 16], false).unwrap();
        assert_eq!(
            iso.encrypted_regions,
            vec![Region {
                start: SectorCount(2),
                end: SectorCount(5),
            }]
        );
        assert_eq!(iso.regions_header_size, 8 + 2 * 8);
    }

    #[test]
    fn rejects_bad_region_maps() {
        let dir = tempfile::tempdir().unwrap();

        let one_region = write_temp(&dir, "one.iso", &image_with_header(&[(0, 2)], 4));
        assert!(EncryptedIso::new(one_region, &[0u8; 16], false).is_err());

        let nonzero_start = write_temp(&dir, "nz.iso", &image_with_header(&[(1, 2), (5, 8)], 8));
        assert!(EncryptedIso::new(nonzero_start, &[0u8; 16], false).is_err());

        let inverted = write_temp(&dir, "inv.iso", &image_with_header(&[(0, 2), (8, 5)], 8));
        assert!(EncryptedIso::new(inverted, &[0u8; 16], false).is_err());

        let overlapping = write_temp(&dir, "ov.iso", &image_with_header(&[(0, 5), (3, 8)], 8));
        assert!(EncryptedIso::new(overlapping, &[0u8; 16], false).is_err());
    }

    #[test]
    fn key_derivation_is_deterministic() {
        let data1 = [0x42u8; 16];
        let key = derive_iso_key(&data1);
        assert_eq!(key, derive_iso_key(&data1));
        assert_ne!(key, data1);
        assert_ne!(key, derive_iso_key(&[0x43u8; 16]));
    }

    #[test]
    fn sector_crypto_round_trips() {
        let key = derive_iso_key(&[9u8; 16]);
        let mut data = vec![0xabu8; SECTOR_SIZE as usize];
        let original = data.clone();

        encrypt_sector(&key, 77, &mut data);
        assert_ne!(data, original);
        decrypt_sector(&key, 77, &mut data);
        assert_eq!(data, original);

        // A different sector number produces different ciphertext.
        let mut other = original.clone();
        encrypt_sector(&key, 78, &mut other);
        let mut this = original.clone();
        encrypt_sector(&key, 77, &mut this);
        assert_ne!(this, other);
    }

    #[test]
    fn key_file_decoding() {
        assert_eq!(
            decode_key_file(b"000102030405060708090a0b0c0d0e0f\n").unwrap(),
            [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15]
        );
        assert!(decode_key_file(b"not hex at all").is_err());
        assert!(decode_key_file(b"0001").is_err());
        assert!(decode_key_file(&[0xff; 32]).is_err());
    }
}
