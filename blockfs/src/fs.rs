//! The file system aggregate.

use std::sync::Arc;

use block_cache::{BlockDevice, BufferCache};
use blockfs_types::{DiskInode, MAX_FILE_SIZE, SECTOR_SIZE, SectorNo};
use dataview::PodMethods as _;
use log::error;

use crate::{
    alloc::SectorAllocator,
    error::Error,
    inode::{self, Inode, table::OpenTable},
};

/// The block device the file system drives.
pub type Device = Arc<dyn BlockDevice<SECTOR_SIZE>>;

type Cache = BufferCache<Device, SECTOR_SIZE>;

/// A mounted file system core: the buffer cache over one device, the
/// sector allocator, and the table of open inodes.
pub struct FileSystem {
    cache: Cache,
    alloc: Arc<dyn SectorAllocator>,
    open_inodes: OpenTable,
}

impl FileSystem {
    pub fn new(device: Device, alloc: Arc<dyn SectorAllocator>) -> Arc<Self> {
        Arc::new(Self {
            cache: BufferCache::new(device),
            alloc,
            open_inodes: OpenTable::new(),
        })
    }

    /// Initializes an on-disk inode of `length` bytes at `sector`.
    ///
    /// The sector itself must already be reserved by the caller. All data
    /// and pointer sectors the length needs are allocated and zeroed; on
    /// allocator exhaustion the partial growth is rolled back and the
    /// caller keeps ownership of `sector`.
    pub fn create(&self, sector: SectorNo, length: usize) -> Result<(), Error> {
        if length > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge(length));
        }
        let mut staging = DiskInode::new(i32::try_from(length).unwrap());
        match inode::resize(self, &mut staging, length) {
            Ok(()) => {
                self.write_inode(sector, &staging);
                Ok(())
            }
            Err(err) => {
                if let Err(rollback) = inode::resize(self, &mut staging, 0) {
                    error!("rollback of failed create at sector {sector} failed: {rollback}");
                }
                Err(err)
            }
        }
    }

    /// Opens the inode stored at `sector`.
    ///
    /// Two opens of the same sector share one in-memory handle state; the
    /// returned handle bumps its open count.
    pub fn open(self: &Arc<Self>, sector: SectorNo) -> Inode {
        Inode::open(self, sector)
    }

    /// Writes every dirty cached sector back to the device.
    pub fn flush(&self) {
        self.cache.flush();
    }

    /// Flushes and empties the cache, zeroing the hit statistics.
    pub fn reset_cache(&self) {
        self.cache.reset();
    }

    /// Fraction of cache accesses served without device I/O.
    pub fn cache_hit_rate(&self) -> f64 {
        self.cache.hit_rate()
    }

    pub(crate) fn cache(&self) -> &Cache {
        &self.cache
    }

    pub(crate) fn allocator(&self) -> &dyn SectorAllocator {
        &*self.alloc
    }

    pub(crate) fn open_inodes(&self) -> &OpenTable {
        &self.open_inodes
    }

    /// Runs `f` on the on-disk inode at `sector`, read through the cache.
    pub(crate) fn with_inode<R>(&self, sector: SectorNo, f: impl FnOnce(&DiskInode) -> R) -> R {
        self.cache.acquire(sector.as_index(), false).read_as(f)
    }

    /// Copies the on-disk inode at `sector` into a staging image.
    pub(crate) fn read_inode(&self, sector: SectorNo) -> DiskInode {
        let mut staging = DiskInode::zeroed();
        self.cache
            .acquire(sector.as_index(), false)
            .with_bytes(|bytes| staging.as_bytes_mut().copy_from_slice(bytes));
        staging
    }

    /// Writes a staging image back to `sector` through the cache.
    pub(crate) fn write_inode(&self, sector: SectorNo, staging: &DiskInode) {
        self.cache
            .acquire(sector.as_index(), true)
            .with_bytes_mut(|bytes| bytes.copy_from_slice(staging.as_bytes()));
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        self.cache.flush();
    }
}

#[cfg(test)]
mod tests {
    use crate::{alloc::SectorAllocator, helpers};

    #[test]
    fn test_create_then_read_zeroes() {
        let t = helpers::fs_with(64);
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 1000).unwrap();

        let file = t.fs.open(sector);
        assert_eq!(file.length(), 1000);
        let mut buf = [0xFF; 1000];
        assert_eq!(file.read_at(&mut buf, 0), 1000);
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_read_your_writes() {
        let t = helpers::fs_with(64);
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 0).unwrap();

        let file = t.fs.open(sector);
        let data: Vec<u8> = (0..2000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(file.write_at(&data, 300), data.len());
        assert_eq!(file.length(), 2300);

        let mut back = vec![0; data.len()];
        assert_eq!(file.read_at(&mut back, 300), data.len());
        assert_eq!(back, data);
    }

    #[test]
    fn test_flush_persists_through_cold_cache() {
        let t = helpers::fs_with(64);
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 0).unwrap();

        {
            let file = t.fs.open(sector);
            assert_eq!(file.write_at(b"persisted", 0), 9);
        }
        t.fs.reset_cache();

        let file = t.fs.open(sector);
        let mut buf = [0; 9];
        assert_eq!(file.read_at(&mut buf, 0), 9);
        assert_eq!(&buf, b"persisted");
    }

    /// Cold-cache versus warm-cache hit rate over a sequential scan.
    #[test]
    fn test_hit_rate_improves_on_second_scan() {
        let t = helpers::fs_with(128);
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 10240).unwrap();
        t.fs.reset_cache();

        let file = t.fs.open(sector);
        let mut buf = [0; 256];
        let mut total = 0;
        let mut offset = 0;
        loop {
            let n = file.read_at(&mut buf, offset);
            if n == 0 {
                break;
            }
            offset += n;
            total += n;
        }
        assert_eq!(total, 10240);
        let cold = t.fs.cache_hit_rate();

        drop(file);
        let file = t.fs.open(sector);
        let mut offset = 0;
        loop {
            let n = file.read_at(&mut buf, offset);
            if n == 0 {
                break;
            }
            offset += n;
        }
        let warm = t.fs.cache_hit_rate();
        assert!(cold < warm, "expected {cold} < {warm}");
    }

    /// Byte-by-byte writes to the same sectors must coalesce in the
    /// cache: a 64 KiB file is 128 sectors, so on the order of 128
    /// device writes should happen over the whole run.
    #[test]
    fn test_write_coalescing() {
        const FILE_SIZE: usize = 65536;

        let t = helpers::fs_with(256);
        let initial_writes = t.disk.writes();
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 0).unwrap();

        let file = t.fs.open(sector);
        for i in 0..FILE_SIZE {
            assert_eq!(file.write_at(&[i as u8], i), 1);
        }
        assert_eq!(file.length(), FILE_SIZE);

        t.fs.reset_cache();

        let mut byte = [0];
        let mut total = 0;
        for _ in 0..FILE_SIZE {
            total += file.read_at(&mut byte, 0);
        }
        assert_eq!(total, FILE_SIZE);

        let writes = t.disk.writes() - initial_writes;
        assert!(writes >= 128, "file data is 128 sectors, saw {writes} writes");
        assert!(writes <= 160, "expected on the order of 128 writes, saw {writes}");
    }
}
