use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Logical block size of an ISO9660 image, in bytes.
pub const SECTOR_SIZE: u64 = 2048;

/// A size or address expressed in whole sectors.
///
/// Sector and byte quantities are deliberately separate types; converting
/// between them is always explicit ([`SectorCount::bytes`],
/// [`ByteCount::sectors`], [`ByteCount::floor_sectors`]). Mixing the two is a
/// reliable source of off-by-one-sector bugs in image layout code.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SectorCount(pub u32);

/// A size or address expressed in bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteCount(pub u64);

impl SectorCount {
    pub const fn bytes(self) -> ByteCount {
        ByteCount(self.0 as u64 * SECTOR_SIZE)
    }

    pub const fn next(self) -> SectorCount {
        SectorCount(self.0 + 1)
    }
}

impl ByteCount {
    /// Sectors needed to hold this many bytes (rounds up).
    pub const fn sectors(self) -> SectorCount {
        SectorCount(((self.0 + SECTOR_SIZE - 1) / SECTOR_SIZE) as u32)
    }

    /// Sector containing the byte at this offset (rounds down).
    pub const fn floor_sectors(self) -> SectorCount {
        SectorCount((self.0 / SECTOR_SIZE) as u32)
    }

    pub const fn is_sector_aligned(self) -> bool {
        self.0 % SECTOR_SIZE == 0
    }
}

impl Add for SectorCount {
    type Output = SectorCount;
    fn add(self, rhs: SectorCount) -> SectorCount {
        SectorCount(self.0 + rhs.0)
    }
}

impl AddAssign for SectorCount {
    fn add_assign(&mut self, rhs: SectorCount) {
        self.0 += rhs.0;
    }
}

impl Sub for SectorCount {
    type Output = SectorCount;
    fn sub(self, rhs: SectorCount) -> SectorCount {
        SectorCount(self.0 - rhs.0)
    }
}

impl SubAssign for SectorCount {
    fn sub_assign(&mut self, rhs: SectorCount) {
        self.0 -= rhs.0;
    }
}

impl Add for ByteCount {
    type Output = ByteCount;
    fn add(self, rhs: ByteCount) -> ByteCount {
        ByteCount(self.0 + rhs.0)
    }
}

impl AddAssign for ByteCount {
    fn add_assign(&mut self, rhs: ByteCount) {
        self.0 += rhs.0;
    }
}

impl Sub for ByteCount {
    type Output = ByteCount;
    fn sub(self, rhs: ByteCount) -> ByteCount {
        ByteCount(self.0 - rhs.0)
    }
}

impl SubAssign for ByteCount {
    fn sub_assign(&mut self, rhs: ByteCount) {
        self.0 -= rhs.0;
    }
}
