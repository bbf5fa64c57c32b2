//! The inode metadata engine.
//!
//! [`resize`] reshapes the pointer tree of a staging [`DiskInode`] so it
//! addresses exactly `new_size` bytes: slots past the new size are
//! released, slots inside it are allocated and zeroed through the cache.
//! The staging image itself is never written to the device here; the
//! caller persists it after a successful resize, which is what keeps a
//! pointer from becoming visible on disk before its target sector is
//! zeroed.
//!
//! On allocator exhaustion the error is returned with the staging image
//! reflecting every sector acquired so far; the caller rolls back with a
//! second resize to the prior length. To keep that rollback exact, a
//! partially updated pointer vector is written back through the cache
//! even on the failure path, and fresh indirect sectors are zeroed at
//! allocation so a rollback never walks stale slots.

use blockfs_types::{
    DiskInode, IndirectBlock, MAX_FILE_SIZE, NUM_DIRECT_REFS, NUM_INDIRECT_REFS, SECTOR_SIZE,
    SectorNo,
};
use dataview::PodMethods as _;
use log::warn;

use crate::{error::Error, fs::FileSystem};

/// First byte addressed through the indirect sector.
const INDIRECT_START: usize = NUM_DIRECT_REFS * SECTOR_SIZE;

/// First byte addressed through the doubly-indirect sector.
const DOUBLY_INDIRECT_START: usize = (NUM_DIRECT_REFS + NUM_INDIRECT_REFS) * SECTOR_SIZE;

/// Resizes the staging image to `new_size` bytes.
///
/// `staging.length` is updated only once every allocation and write has
/// succeeded. Released sectors are immediately reusable.
pub(crate) fn resize(
    fs: &FileSystem,
    staging: &mut DiskInode,
    new_size: usize,
) -> Result<(), Error> {
    if new_size > MAX_FILE_SIZE {
        return Err(Error::FileTooLarge(new_size));
    }

    // Direct pointers.
    for i in 0..NUM_DIRECT_REFS {
        let first_byte = i * SECTOR_SIZE;
        match staging.direct(i) {
            Some(sector) if new_size <= first_byte => {
                fs.allocator().release(sector);
                staging.set_direct(i, None);
            }
            None if new_size > first_byte => {
                staging.set_direct(i, Some(alloc_zeroed(fs)?));
            }
            _ => {}
        }
    }

    // Indirect sector.
    if staging.indirect().is_none() && new_size <= INDIRECT_START {
        staging.set_length(i32::try_from(new_size).unwrap());
        return Ok(());
    }
    let ip = match staging.indirect() {
        Some(sector) => sector,
        None => {
            let sector = alloc_zeroed(fs)?;
            staging.set_indirect(Some(sector));
            sector
        }
    };
    let mut slots = read_vector(fs, ip);
    let mut result = Ok(());
    for i in 0..NUM_INDIRECT_REFS {
        if let Err(err) = update_slot(fs, &mut slots, i, INDIRECT_START + i * SECTOR_SIZE, new_size)
        {
            result = Err(err);
            break;
        }
    }
    // Written back even on failure so a rollback sees every slot the
    // interrupted grow filled.
    write_vector(fs, ip, &slots);
    result?;
    if new_size <= INDIRECT_START {
        fs.allocator().release(ip);
        staging.set_indirect(None);
    }

    // Doubly-indirect sector.
    if staging.doubly_indirect().is_none() && new_size <= DOUBLY_INDIRECT_START {
        staging.set_length(i32::try_from(new_size).unwrap());
        return Ok(());
    }
    let dip = match staging.doubly_indirect() {
        Some(sector) => sector,
        None => {
            let sector = alloc_zeroed(fs)?;
            staging.set_doubly_indirect(Some(sector));
            sector
        }
    };
    let mut outer = read_vector(fs, dip);
    let mut result = Ok(());
    'outer: for i in 0..NUM_INDIRECT_REFS {
        let region_start = DOUBLY_INDIRECT_START + i * NUM_INDIRECT_REFS * SECTOR_SIZE;
        // Growth fills regions in order, so the first untouched region
        // past the new size ends the walk.
        if outer.get(i).is_none() && new_size <= region_start {
            break;
        }
        let inner_sector = match outer.get(i) {
            Some(sector) => sector,
            None => match alloc_zeroed(fs) {
                Ok(sector) => {
                    outer.set(i, Some(sector));
                    sector
                }
                Err(err) => {
                    result = Err(err);
                    break 'outer;
                }
            },
        };
        let mut inner = read_vector(fs, inner_sector);
        for j in 0..NUM_INDIRECT_REFS {
            if let Err(err) =
                update_slot(fs, &mut inner, j, region_start + j * SECTOR_SIZE, new_size)
            {
                write_vector(fs, inner_sector, &inner);
                result = Err(err);
                break 'outer;
            }
        }
        write_vector(fs, inner_sector, &inner);
        if new_size <= region_start {
            fs.allocator().release(inner_sector);
            outer.set(i, None);
        }
    }
    write_vector(fs, dip, &outer);
    result?;
    if new_size <= DOUBLY_INDIRECT_START {
        fs.allocator().release(dip);
        staging.set_doubly_indirect(None);
    }

    staging.set_length(i32::try_from(new_size).unwrap());
    Ok(())
}

/// Applies the grow/shrink rule to one slot of an indirect vector, where
/// `first_byte` is the file offset of the slot's first byte.
fn update_slot(
    fs: &FileSystem,
    slots: &mut IndirectBlock,
    i: usize,
    first_byte: usize,
    new_size: usize,
) -> Result<(), Error> {
    match slots.get(i) {
        Some(sector) if new_size <= first_byte => {
            fs.allocator().release(sector);
            slots.set(i, None);
        }
        None if new_size > first_byte => {
            slots.set(i, Some(alloc_zeroed(fs)?));
        }
        _ => {}
    }
    Ok(())
}

/// Allocates a sector and zeroes its contents through the cache.
fn alloc_zeroed(fs: &FileSystem) -> Result<SectorNo, Error> {
    let Some(sector) = fs.allocator().allocate() else {
        warn!("out of free sectors");
        return Err(Error::OutOfSectors);
    };
    fs.cache()
        .acquire(sector.as_index(), true)
        .with_bytes_mut(|bytes| bytes.fill(0));
    Ok(sector)
}

fn read_vector(fs: &FileSystem, sector: SectorNo) -> IndirectBlock {
    let mut slots = IndirectBlock::zeroed();
    fs.cache()
        .acquire(sector.as_index(), false)
        .with_bytes(|bytes| slots.as_bytes_mut().copy_from_slice(bytes));
    slots
}

fn write_vector(fs: &FileSystem, sector: SectorNo, slots: &IndirectBlock) {
    fs.cache()
        .acquire(sector.as_index(), true)
        .with_bytes_mut(|bytes| bytes.copy_from_slice(slots.as_bytes()));
}
