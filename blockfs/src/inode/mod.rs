//! In-memory inode handles.
//!
//! An inode describes a single unnamed file. Its on-disk form
//! ([`blockfs_types::DiskInode`]) occupies one sector and holds the file
//! length, the directory flag, and the pointer tree naming the data
//! sectors.
//!
//! The in-memory side is split in two. [`table::OpenTable`] is the
//! process-wide set of open inodes; it guarantees that any number of
//! opens of one sector share a single entry, so the open count, the
//! deny-write count, and the removed flag have one home. [`Inode`] is a
//! counted handle onto such an entry: cloning a handle reopens the inode,
//! dropping one closes it, and the last close of a removed inode returns
//! every sector the file owns to the allocator.
//!
//! Metadata lives on disk and is read and written through the buffer
//! cache on every access; the entry carries only bookkeeping that has no
//! on-disk form.

use std::sync::Arc;

use blockfs_types::{DiskInode, SectorNo};
use log::error;

use crate::fs::FileSystem;

use self::table::{CloseOutcome, OpenEntry};

mod content;
mod resize;
pub(crate) mod table;

pub(crate) use self::resize::resize;

/// An open handle to an on-disk inode.
///
/// Handles to the same sector share their state: a write denied through
/// one is denied through all, and removal is observed by every opener.
pub struct Inode {
    fs: Arc<FileSystem>,
    entry: Arc<OpenEntry>,
}

impl Inode {
    pub(crate) fn open(fs: &Arc<FileSystem>, sector: SectorNo) -> Self {
        Self {
            fs: Arc::clone(fs),
            entry: fs.open_inodes().get_or_insert(sector),
        }
    }

    pub(crate) fn fs(&self) -> &FileSystem {
        &self.fs
    }

    pub(crate) fn entry(&self) -> &OpenEntry {
        &self.entry
    }

    /// The sector number of the on-disk inode.
    #[must_use]
    pub fn inumber(&self) -> SectorNo {
        self.entry.sector
    }

    /// Number of handles currently open on this inode.
    #[must_use]
    pub fn open_count(&self) -> u32 {
        self.entry.state.lock().unwrap().open_cnt
    }

    /// Marks the inode for deletion. Its sectors are reclaimed when the
    /// last handle is dropped; until then every opener sees a live file.
    pub fn remove(&self) {
        self.entry.state.lock().unwrap().removed = true;
    }

    /// File length in bytes, as persisted on disk.
    #[must_use]
    pub fn length(&self) -> usize {
        self.fs
            .with_inode(self.entry.sector, |d| usize::try_from(d.length()).unwrap())
    }

    /// Whether the directory flag is set.
    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.fs.with_inode(self.entry.sector, |d| d.is_dir())
    }

    /// Sets or clears the directory flag.
    pub fn set_is_dir(&self, is_dir: bool) {
        self.fs
            .cache()
            .acquire(self.entry.sector.as_index(), true)
            .write_as(|d: &mut DiskInode| d.set_is_dir(is_dir));
    }

    /// Disables writes through every handle on this inode.
    ///
    /// May be called at most once per opener.
    pub fn deny_write(&self) {
        let mut state = self.entry.state.lock().unwrap();
        state.deny_write_cnt += 1;
        assert!(state.deny_write_cnt <= state.open_cnt);
    }

    /// Re-enables writes. Must balance a prior [`Self::deny_write`] from
    /// the same opener, before that opener closes.
    pub fn allow_write(&self) {
        let mut state = self.entry.state.lock().unwrap();
        assert!(state.deny_write_cnt > 0);
        assert!(state.deny_write_cnt <= state.open_cnt);
        state.deny_write_cnt -= 1;
    }
}

/// Reopens the inode: the clone is a new opener of the same file.
impl Clone for Inode {
    fn clone(&self) -> Self {
        self.entry.state.lock().unwrap().open_cnt += 1;
        Self {
            fs: Arc::clone(&self.fs),
            entry: Arc::clone(&self.entry),
        }
    }
}

/// Closes the handle. The last close unlinks the entry from the open
/// table; if the inode was removed, its data, pointer, and inode sectors
/// go back to the allocator.
impl Drop for Inode {
    fn drop(&mut self) {
        match self.fs.open_inodes().close(&self.entry) {
            CloseOutcome::StillOpen | CloseOutcome::Unlinked => {}
            CloseOutcome::Reclaim => {
                let mut staging = self.fs.read_inode(self.entry.sector);
                if let Err(err) = resize(&self.fs, &mut staging, 0) {
                    error!(
                        "reclaiming removed inode at sector {} failed: {err}",
                        self.entry.sector
                    );
                }
                self.fs.allocator().release(self.entry.sector);
            }
        }
    }
}
