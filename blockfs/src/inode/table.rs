//! The open-inodes table.

use std::sync::{Arc, Mutex};

use blockfs_types::SectorNo;

/// Process-wide set of open inodes.
///
/// The table guarantees that at most one [`OpenEntry`] exists per sector,
/// so all openers of a file share its open count, deny-write count, and
/// removed flag. Lock order: the table lock is taken before any entry
/// lock, never after.
pub(crate) struct OpenTable {
    entries: Mutex<Vec<Arc<OpenEntry>>>,
}

/// Shared in-memory state of one open inode.
pub(crate) struct OpenEntry {
    /// Sector of the on-disk inode.
    pub(crate) sector: SectorNo,
    pub(crate) state: Mutex<OpenState>,
}

pub(crate) struct OpenState {
    /// Number of live handles.
    pub(crate) open_cnt: u32,
    /// Writes fail while this is nonzero. Never exceeds `open_cnt`.
    pub(crate) deny_write_cnt: u32,
    /// Set by remove; acted on at the last close.
    pub(crate) removed: bool,
}

/// What the dropped handle must do after the table has been updated.
pub(crate) enum CloseOutcome {
    /// Other handles remain; nothing to do.
    StillOpen,
    /// Last handle gone, inode not removed; the on-disk inode survives.
    Unlinked,
    /// Last handle gone and the inode was removed: release every sector
    /// reachable from it, then the inode sector itself.
    Reclaim,
}

impl OpenTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Returns the entry for `sector`, bumping its open count, or inserts
    /// a fresh entry with a count of one.
    pub(crate) fn get_or_insert(&self, sector: SectorNo) -> Arc<OpenEntry> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(entry) = entries.iter().find(|e| e.sector == sector) {
            entry.state.lock().unwrap().open_cnt += 1;
            return Arc::clone(entry);
        }

        let entry = Arc::new(OpenEntry {
            sector,
            state: Mutex::new(OpenState {
                open_cnt: 1,
                deny_write_cnt: 0,
                removed: false,
            }),
        });
        entries.push(Arc::clone(&entry));
        entry
    }

    /// Drops one opener of `entry`. On the last close the entry is
    /// unlinked from the table before this returns, so a racing open of
    /// the same sector builds a fresh entry rather than reviving a dying
    /// one.
    pub(crate) fn close(&self, entry: &Arc<OpenEntry>) -> CloseOutcome {
        let mut entries = self.entries.lock().unwrap();
        let mut state = entry.state.lock().unwrap();
        state.open_cnt -= 1;
        if state.open_cnt > 0 {
            return CloseOutcome::StillOpen;
        }
        let removed = state.removed;
        drop(state);
        entries.retain(|e| !Arc::ptr_eq(e, entry));
        if removed {
            CloseOutcome::Reclaim
        } else {
            CloseOutcome::Unlinked
        }
    }
}
