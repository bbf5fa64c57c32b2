//! On-disk data types for the blockfs storage core.
//!
//! The only persistent structure this core defines is the inode sector:
//!
//! | field             | size      | content                                |
//! |-------------------|-----------|----------------------------------------|
//! | `length`          | 4 bytes   | file size in bytes (signed, `>= 0`)    |
//! | `is_dir`          | 4 bytes   | directory flag, stored as a 32-bit word|
//! | `direct`          | 492 bytes | 123 direct sector numbers              |
//! | `indirect`        | 4 bytes   | sector of one [`IndirectBlock`]        |
//! | `doubly_indirect` | 4 bytes   | sector of an [`IndirectBlock`] of indirect blocks |
//! | `magic`           | 4 bytes   | [`DiskInode::MAGIC`]                   |
//!
//! Indirect and doubly-indirect sectors are raw arrays of 128 little-endian
//! 32-bit sector numbers ([`IndirectBlock`]). Data sectors are opaque.
//! A sector number of 0 denotes "unallocated" at every level.

#![cfg_attr(not(test), no_std)]

use core::fmt;

use dataview::{Pod, PodMethods as _};

/// Sector size of the block device in bytes, the only granularity of I/O.
pub const SECTOR_SIZE: usize = 512;

/// Number of sectors referenced directly by an inode.
pub const NUM_DIRECT_REFS: usize = 123;

/// Number of sector numbers held by one indirect sector.
pub const NUM_INDIRECT_REFS: usize = SECTOR_SIZE / size_of::<u32>();

/// Largest number of data sectors a single inode can address.
pub const MAX_FILE_SECTORS: usize =
    NUM_DIRECT_REFS + NUM_INDIRECT_REFS + NUM_INDIRECT_REFS * NUM_INDIRECT_REFS;

/// Largest file size in bytes.
pub const MAX_FILE_SIZE: usize = MAX_FILE_SECTORS * SECTOR_SIZE;

/// Block device sector number.
///
/// Sector 0 never backs file data or metadata; a raw value of 0 in a
/// pointer slot means the slot is unallocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Pod)]
#[repr(transparent)]
pub struct SectorNo(u32);

impl fmt::Display for SectorNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SectorNo {
    #[must_use]
    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    #[must_use]
    pub const fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn as_index(self) -> usize {
        usize::try_from(self.0).unwrap()
    }
}

fn decode(raw: u32) -> Option<SectorNo> {
    if raw == 0 { None } else { Some(SectorNo(raw)) }
}

fn encode(slot: Option<SectorNo>) -> u32 {
    slot.map_or(0, |sn| {
        assert_ne!(sn.0, 0);
        sn.0
    })
}

/// On-disk inode. Occupies exactly one sector.
#[derive(Pod)]
#[repr(C)]
pub struct DiskInode {
    /// File size in bytes.
    length: i32,
    /// Directory flag, 32 bits wide on disk.
    is_dir: u32,
    /// Direct sector numbers.
    direct: [u32; NUM_DIRECT_REFS],
    /// Indirect sector number.
    indirect: u32,
    /// Doubly-indirect sector number.
    doubly_indirect: u32,
    /// Must be [`Self::MAGIC`].
    magic: u32,
}
const _: () = const { assert!(size_of::<DiskInode>() == SECTOR_SIZE) };

impl DiskInode {
    /// Identifies an inode sector.
    pub const MAGIC: u32 = 0x494E_4F44;

    /// A fresh file inode with no sectors allocated yet.
    #[must_use]
    pub fn new(length: i32) -> Self {
        let mut inode = Self::zeroed();
        inode.length = length;
        inode.magic = Self::MAGIC;
        inode
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC
    }

    #[must_use]
    pub fn length(&self) -> i32 {
        self.length
    }

    pub fn set_length(&mut self, length: i32) {
        assert!(length >= 0);
        self.length = length;
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn set_is_dir(&mut self, is_dir: bool) {
        self.is_dir = u32::from(is_dir);
    }

    #[must_use]
    pub fn direct(&self, i: usize) -> Option<SectorNo> {
        decode(self.direct[i])
    }

    pub fn set_direct(&mut self, i: usize, slot: Option<SectorNo>) {
        self.direct[i] = encode(slot);
    }

    #[must_use]
    pub fn indirect(&self) -> Option<SectorNo> {
        decode(self.indirect)
    }

    pub fn set_indirect(&mut self, slot: Option<SectorNo>) {
        self.indirect = encode(slot);
    }

    #[must_use]
    pub fn doubly_indirect(&self) -> Option<SectorNo> {
        decode(self.doubly_indirect)
    }

    pub fn set_doubly_indirect(&mut self, slot: Option<SectorNo>) {
        self.doubly_indirect = encode(slot);
    }
}

/// A sector interpreted as 128 sector numbers.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndirectBlock([u32; NUM_INDIRECT_REFS]);
const _: () = const { assert!(size_of::<IndirectBlock>() == SECTOR_SIZE) };

impl IndirectBlock {
    #[must_use]
    pub fn get(&self, i: usize) -> Option<SectorNo> {
        decode(self.0[i])
    }

    pub fn set(&mut self, i: usize, slot: Option<SectorNo>) {
        self.0[i] = encode(slot);
    }
}

#[cfg(test)]
mod tests {
    use dataview::PodMethods as _;

    use super::*;

    #[test]
    fn test_disk_inode_layout() {
        let inode = DiskInode::new(42);
        let bytes = inode.as_bytes();
        assert_eq!(bytes.len(), SECTOR_SIZE);
        // length, then is_dir, little-endian.
        assert_eq!(&bytes[0..4], &42i32.to_le_bytes());
        assert_eq!(&bytes[4..8], &0u32.to_le_bytes());
        // magic sits in the last four bytes.
        assert_eq!(&bytes[SECTOR_SIZE - 4..], &DiskInode::MAGIC.to_le_bytes());
    }

    #[test]
    fn test_disk_inode_slots() {
        let mut inode = DiskInode::new(0);
        assert!(inode.is_valid());
        assert_eq!(inode.direct(0), None);
        inode.set_direct(7, Some(SectorNo::new(99)));
        assert_eq!(inode.direct(7), Some(SectorNo::new(99)));
        inode.set_direct(7, None);
        assert_eq!(inode.direct(7), None);

        assert_eq!(inode.indirect(), None);
        inode.set_indirect(Some(SectorNo::new(3)));
        assert_eq!(inode.indirect(), Some(SectorNo::new(3)));
        inode.set_doubly_indirect(Some(SectorNo::new(4)));
        assert_eq!(inode.doubly_indirect(), Some(SectorNo::new(4)));
    }

    #[test]
    fn test_indirect_block_roundtrip() {
        let mut blk = IndirectBlock::zeroed();
        for i in 0..NUM_INDIRECT_REFS {
            assert_eq!(blk.get(i), None);
        }
        blk.set(0, Some(SectorNo::new(1)));
        blk.set(NUM_INDIRECT_REFS - 1, Some(SectorNo::new(2)));
        assert_eq!(blk.get(0), Some(SectorNo::new(1)));
        assert_eq!(blk.get(NUM_INDIRECT_REFS - 1), Some(SectorNo::new(2)));
    }

    #[test]
    fn test_addressing_limit() {
        assert_eq!(MAX_FILE_SECTORS, 123 + 128 + 128 * 128);
        assert_eq!(MAX_FILE_SIZE, 8_459_264);
    }
}
