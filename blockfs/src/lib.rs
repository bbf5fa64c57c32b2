//! blockfs: a small on-disk file system storage core.
//!
//! The crate provides the two tightly coupled pieces at the bottom of the
//! file system: the inode layer, which maps file bytes to device sectors
//! through a direct / indirect / doubly-indirect pointer tree and grows or
//! shrinks files on demand, and the buffer cache (crate [`block_cache`]),
//! which mediates every sector access with LRU replacement, pinning, and
//! write-back.
//!
//! Layers, bottom up:
//!
//! * a [`block_cache::BlockDevice`]: fixed-size sector I/O. [`MemDisk`]
//!   is the bundled RAM-backed implementation.
//! * a [`SectorAllocator`]: reserves and releases individual sectors.
//!   [`FreeMap`] is the bundled bitmap implementation.
//! * the [`FileSystem`] aggregate: owns the cache and the table of open
//!   inodes, creates files, and hands out [`Inode`] handles.
//! * [`Inode`]: an open handle. Cloning a handle reopens the inode,
//!   dropping it closes; the last close of a removed inode returns all of
//!   its sectors to the allocator.
//!
//! Locks are ordered: the open-inodes table, then a handle's own lock,
//! then the cache mutex. A holder of one may take the next, never an
//! earlier one.
//!
//! Not provided here: directories and path lookup, crash consistency,
//! and checksums. The on-disk inode format is fixed (see
//! [`blockfs_types`]); callers that need forward compatibility must
//! preserve it.

pub mod alloc;
pub mod device;
mod error;
mod fs;
mod inode;

#[cfg(test)]
mod helpers;

pub use blockfs_types::{
    MAX_FILE_SECTORS, MAX_FILE_SIZE, NUM_DIRECT_REFS, NUM_INDIRECT_REFS, SECTOR_SIZE, SectorNo,
};

pub use self::{
    alloc::{FreeMap, SectorAllocator},
    device::MemDisk,
    error::Error,
    fs::{Device, FileSystem},
    inode::Inode,
};
