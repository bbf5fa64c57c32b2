use blockfs_types::MAX_FILE_SIZE;

/// Failures surfaced by the storage core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A resize asked for more bytes than the pointer tree can address.
    #[error("file size {0} exceeds the {MAX_FILE_SIZE}-byte addressing limit")]
    FileTooLarge(usize),

    /// The allocator ran out of free sectors mid-growth.
    #[error("out of free sectors")]
    OutOfSectors,
}
