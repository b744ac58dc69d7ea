use crate::size::{ByteCount, SectorCount, SECTOR_SIZE};

/// Appending encoder for ISO9660 on-disk structures.
///
/// All multi-byte helpers are explicit about byte order because ECMA-119
/// stores most integers in *both* orders side by side (7.2.3 / 7.3.3).
#[derive(Default)]
pub(crate) struct IsoEncoder {
    buf: Vec<u8>,
}

impl IsoEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> ByteCount {
        ByteCount(self.buf.len() as u64)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn push_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn push_u16_le(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_u16_be(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// ECMA-119 7.2.3 both-byte-order 16-bit field.
    pub fn push_u16_lsb_msb(&mut self, v: u16) {
        self.push_u16_le(v);
        self.push_u16_be(v);
    }

    pub fn push_u32_le(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn push_u32_be(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// ECMA-119 7.3.3 both-byte-order 32-bit field.
    pub fn push_u32_lsb_msb(&mut self, v: u32) {
        self.push_u32_le(v);
        self.push_u32_be(v);
    }

    pub fn push_zeros(&mut self, count: usize) {
        self.buf.resize(self.buf.len() + count, 0);
    }

    pub fn push_zero_sectors(&mut self, count: SectorCount) {
        self.push_zeros(count.bytes().0 as usize);
    }

    /// Pads the buffer with zeros up to the next sector boundary.
    pub fn pad_to_sector(&mut self) {
        let extra = self.buf.len() % SECTOR_SIZE as usize;
        if extra > 0 {
            self.push_zeros(SECTOR_SIZE as usize - extra);
        }
    }

    /// Appends `bytes` into a fixed-width field, filling the remainder with
    /// `pad`. Truncates over-long input; identifier lengths are validated by
    /// the callers that build them.
    pub fn push_padded(&mut self, bytes: &[u8], width: usize, pad: u8) {
        let used = bytes.len().min(width);
        self.buf.extend_from_slice(&bytes[..used]);
        self.buf.resize(self.buf.len() + (width - used), pad);
    }
}
