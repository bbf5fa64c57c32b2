//! In-memory block device.

use std::sync::{
    Mutex,
    atomic::{AtomicU64, Ordering},
};

use block_cache::BlockDevice;
use blockfs_types::SECTOR_SIZE;

/// A RAM-backed sector device.
///
/// Serves as the device under the cache in tests and embedded setups.
/// Reads and writes are counted; the write counter is what the cache
/// coalescing tests compare against.
pub struct MemDisk {
    sectors: Mutex<Vec<[u8; SECTOR_SIZE]>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDisk {
    /// Creates a zero-filled disk of `num_sectors` sectors.
    #[must_use]
    pub fn new(num_sectors: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0; SECTOR_SIZE]; num_sectors]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }

    /// Number of sectors on the disk.
    #[must_use]
    pub fn num_sectors(&self) -> usize {
        self.sectors.lock().unwrap().len()
    }

    /// Total sector reads issued to the device.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    /// Total sector writes issued to the device.
    #[must_use]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }
}

impl BlockDevice<SECTOR_SIZE> for MemDisk {
    fn read(&self, index: usize, data: &mut [u8; SECTOR_SIZE]) {
        self.reads.fetch_add(1, Ordering::SeqCst);
        data.copy_from_slice(&self.sectors.lock().unwrap()[index]);
    }

    fn write(&self, index: usize, data: &[u8; SECTOR_SIZE]) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.sectors.lock().unwrap()[index].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_disk_roundtrip() {
        let disk = MemDisk::new(4);
        let mut sector = [0xAB; SECTOR_SIZE];
        disk.write(2, &sector);
        sector.fill(0);
        disk.read(2, &mut sector);
        assert_eq!(sector, [0xAB; SECTOR_SIZE]);
        assert_eq!(disk.reads(), 1);
        assert_eq!(disk.writes(), 1);
    }

    #[test]
    #[should_panic]
    fn test_mem_disk_out_of_range() {
        let disk = MemDisk::new(1);
        let mut sector = [0; SECTOR_SIZE];
        disk.read(1, &mut sector);
    }
}
