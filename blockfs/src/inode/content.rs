//! Positioned reads and writes of inode data.
//!
//! Byte offsets translate to device sectors through the three-level
//! pointer tree: 123 direct slots in the inode sector, then one indirect
//! sector of 128 slots, then one doubly-indirect sector of 128 indirect
//! sectors. The translation is a pure index walk through the cache; an
//! unallocated slot inside the file's length is a hole and reads as
//! zeroes.

use blockfs_types::{IndirectBlock, NUM_DIRECT_REFS, NUM_INDIRECT_REFS, SECTOR_SIZE, SectorNo};
use log::error;

use crate::fs::FileSystem;

use super::{Inode, resize};

/// Device sector backing byte `pos` of the inode at `inode_sector`, or
/// `None` if no sector is allocated there.
fn sector_for_offset(fs: &FileSystem, inode_sector: SectorNo, pos: usize) -> Option<SectorNo> {
    let index = pos / SECTOR_SIZE;
    if index < NUM_DIRECT_REFS {
        return fs.with_inode(inode_sector, |d| d.direct(index));
    }

    let index = index - NUM_DIRECT_REFS;
    if index < NUM_INDIRECT_REFS {
        let ip = fs.with_inode(inode_sector, |d| d.indirect())?;
        return fs
            .cache()
            .acquire(ip.as_index(), false)
            .read_as(|blk: &IndirectBlock| blk.get(index));
    }

    let index = index - NUM_INDIRECT_REFS;
    if index < NUM_INDIRECT_REFS * NUM_INDIRECT_REFS {
        let dip = fs.with_inode(inode_sector, |d| d.doubly_indirect())?;
        let inner = fs
            .cache()
            .acquire(dip.as_index(), false)
            .read_as(|blk: &IndirectBlock| blk.get(index / NUM_INDIRECT_REFS))?;
        return fs
            .cache()
            .acquire(inner.as_index(), false)
            .read_as(|blk: &IndirectBlock| blk.get(index % NUM_INDIRECT_REFS));
    }

    None
}

impl Inode {
    /// Reads up to `buf.len()` bytes starting at byte `offset`.
    ///
    /// Returns the number of bytes read, which is short exactly when the
    /// range crosses the end of the file; an offset at or past the end
    /// reads nothing.
    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> usize {
        let length = self.length();
        if offset > length {
            return 0;
        }
        let size = usize::min(buf.len(), length - offset);

        let mut read = 0;
        while read < size {
            let pos = offset + read;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = usize::min(size - read, SECTOR_SIZE - sector_ofs);
            match sector_for_offset(self.fs(), self.inumber(), pos) {
                Some(sector) => {
                    self.fs()
                        .cache()
                        .acquire(sector.as_index(), false)
                        .with_bytes(|bytes| {
                            buf[read..read + chunk]
                                .copy_from_slice(&bytes[sector_ofs..sector_ofs + chunk]);
                        });
                }
                // A hole: allocated length without an allocated sector.
                None => buf[read..read + chunk].fill(0),
            }
            read += chunk;
        }
        read
    }

    /// Writes `buf` starting at byte `offset`, extending the file if the
    /// range ends past the current length.
    ///
    /// Returns the number of bytes written: 0 when writes are denied or
    /// when the extension cannot be allocated, in which case the file is
    /// unchanged. Extension is serialized on the handle lock; the data
    /// copies of concurrent writers interleave at sector granularity.
    pub fn write_at(&self, buf: &[u8], offset: usize) -> usize {
        let size = buf.len();
        let Some(end) = offset.checked_add(size) else {
            return 0;
        };

        {
            let state = self.entry().state.lock().unwrap();
            if state.deny_write_cnt > 0 {
                return 0;
            }

            let length = self.length();
            if end > length {
                let fs = self.fs();
                let mut staging = fs.read_inode(self.inumber());
                if resize(fs, &mut staging, end).is_err() {
                    if let Err(err) = resize(fs, &mut staging, length) {
                        error!(
                            "rollback of failed extension of inode {} failed: {err}",
                            self.inumber()
                        );
                    }
                    return 0;
                }
                // The staging image is written only after every new
                // sector has been allocated and zeroed, so no pointer
                // becomes visible before its target is initialized.
                fs.write_inode(self.inumber(), &staging);
            }
        }

        let mut written = 0;
        while written < size {
            let pos = offset + written;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = usize::min(size - written, SECTOR_SIZE - sector_ofs);
            let Some(sector) = sector_for_offset(self.fs(), self.inumber(), pos) else {
                break;
            };
            self.fs()
                .cache()
                .acquire(sector.as_index(), true)
                .with_bytes_mut(|bytes| {
                    bytes[sector_ofs..sector_ofs + chunk]
                        .copy_from_slice(&buf[written..written + chunk]);
                });
            written += chunk;
        }
        written
    }
}

#[cfg(test)]
mod tests {
    use blockfs_types::{NUM_DIRECT_REFS, SECTOR_SIZE};

    use crate::{alloc::SectorAllocator, helpers};

    #[test]
    fn test_read_past_eof_returns_zero() {
        let t = helpers::fs_with(64);
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 100).unwrap();

        let file = t.fs.open(sector);
        let mut buf = [0; 10];
        assert_eq!(file.read_at(&mut buf, 100), 0);
        assert_eq!(file.read_at(&mut buf, 500), 0);
    }

    #[test]
    fn test_read_clamps_at_eof() {
        let t = helpers::fs_with(64);
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 100).unwrap();

        let file = t.fs.open(sector);
        let mut buf = [0xEE; 64];
        assert_eq!(file.read_at(&mut buf, 90), 10);
    }

    #[test]
    fn test_write_and_read_across_sector_boundary() {
        let t = helpers::fs_with(64);
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 0).unwrap();

        let file = t.fs.open(sector);
        let data = [0x5A; 100];
        let offset = SECTOR_SIZE - 50;
        assert_eq!(file.write_at(&data, offset), 100);
        assert_eq!(file.length(), offset + 100);

        let mut back = [0; 100];
        assert_eq!(file.read_at(&mut back, offset), 100);
        assert_eq!(back, data);

        // The bytes before the write are still zero.
        let mut head = [0xFF; 1];
        assert_eq!(file.read_at(&mut head, offset - 1), 1);
        assert_eq!(head[0], 0);
    }

    #[test]
    fn test_write_into_indirect_range() {
        let t = helpers::fs_with(512);
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 0).unwrap();

        let file = t.fs.open(sector);
        // Land the write a few sectors past the direct region.
        let offset = (NUM_DIRECT_REFS + 3) * SECTOR_SIZE + 7;
        assert_eq!(file.write_at(b"indirect", offset), 8);
        assert_eq!(file.length(), offset + 8);

        let mut back = [0; 8];
        assert_eq!(file.read_at(&mut back, offset), 8);
        assert_eq!(&back, b"indirect");

        // Everything before the written range was implicitly zeroed.
        let mut probe = [0xFF; 16];
        assert_eq!(file.read_at(&mut probe, SECTOR_SIZE * 40), 16);
        assert!(probe.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_failed_extension_leaves_file_unchanged() {
        // Small disk: the grow runs out of sectors partway through.
        let t = helpers::fs_with(16);
        let before = t.freemap.free_sectors();
        let sector = t.freemap.allocate().unwrap();
        t.fs.create(sector, 0).unwrap();

        let file = t.fs.open(sector);
        assert_eq!(file.write_at(b"ok", 0), 2);

        let huge = vec![1; 64 * SECTOR_SIZE];
        assert_eq!(file.write_at(&huge, 0), 0);
        assert_eq!(file.length(), 2);

        let mut back = [0; 2];
        assert_eq!(file.read_at(&mut back, 0), 2);
        assert_eq!(&back, b"ok");

        // The failed grow returned everything it had taken.
        file.remove();
        drop(file);
        assert_eq!(t.freemap.free_sectors(), before);
    }
}
