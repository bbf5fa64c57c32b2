//! Shared test fixtures.

use std::sync::Arc;

use block_cache::BlockDevice;
use blockfs_types::SECTOR_SIZE;

use crate::{
    alloc::{FreeMap, SectorAllocator},
    device::MemDisk,
    fs::FileSystem,
};

pub(crate) struct TestFs {
    pub(crate) fs: Arc<FileSystem>,
    pub(crate) disk: Arc<MemDisk>,
    pub(crate) freemap: Arc<FreeMap>,
}

/// A file system over a fresh in-memory disk of `num_sectors` sectors.
pub(crate) fn fs_with(num_sectors: usize) -> TestFs {
    let disk = Arc::new(MemDisk::new(num_sectors));
    let freemap = Arc::new(FreeMap::new(num_sectors));
    let device = Arc::clone(&disk) as Arc<dyn BlockDevice<SECTOR_SIZE>>;
    let alloc = Arc::clone(&freemap) as Arc<dyn SectorAllocator>;
    let fs = FileSystem::new(device, alloc);
    TestFs { fs, disk, freemap }
}
