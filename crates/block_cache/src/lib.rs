//! Write-back cache for sector I/O.
//!
//! All block access in the file system goes through a bounded set of
//! in-memory frames. A frame pins one device sector: acquiring it bumps a
//! reference count that keeps the frame from being evicted until every
//! holder has released it. Replacement is least-recently-used, where
//! "used" means acquired: the frame list is reordered on every acquire,
//! most recent at the front.
//!
//! Dirty frames are written back when their slot is recycled, on
//! [`BufferCache::flush`], and on [`BufferCache::reset`]. The cache is the
//! single source of truth for a sector's current contents: readers and
//! writers that bypass it would race with write-back.

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex, MutexGuard},
};

use dataview::{Pod, PodMethods as _};
use log::trace;

/// Number of frames a [`BufferCache`] holds by default.
pub const NUM_FRAMES: usize = 64;

/// A fixed-size block device addressed by block index.
///
/// Reads and writes are synchronous and whole-block. Device failure is
/// not survivable at this layer; implementations panic rather than
/// report errors upward.
pub trait BlockDevice<const BLOCK_SIZE: usize>: Send + Sync {
    /// Reads block `index` into `data`.
    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]);

    /// Writes `data` to block `index`.
    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]);
}

impl<T, const BLOCK_SIZE: usize> BlockDevice<BLOCK_SIZE> for Arc<T>
where
    T: BlockDevice<BLOCK_SIZE> + ?Sized,
{
    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) {
        (**self).read(index, data);
    }

    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) {
        (**self).write(index, data);
    }
}

impl<T, const BLOCK_SIZE: usize> BlockDevice<BLOCK_SIZE> for &T
where
    T: BlockDevice<BLOCK_SIZE> + ?Sized,
{
    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) {
        (**self).read(index, data);
    }

    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) {
        (**self).write(index, data);
    }
}

/// A buffer cache over a [`BlockDevice`].
pub struct BufferCache<D, const BLOCK_SIZE: usize> {
    device: D,
    frames: Box<[Frame<BLOCK_SIZE>]>,
    state: Mutex<CacheState>,
}

struct Frame<const BLOCK_SIZE: usize> {
    /// Cached sector contents. Locked independently of the cache mutex so
    /// holders can copy bytes without stalling unrelated acquires.
    payload: Mutex<Box<[u8; BLOCK_SIZE]>>,
    /// Signaled on release; acquirers wait here for `ref_cnt` to reach 0.
    released: Condvar,
}

struct CacheState {
    meta: Box<[FrameMeta]>,
    /// LRU order of frame slots, most recently acquired at the front.
    /// Every slot appears exactly once, pinned or not.
    order: VecDeque<usize>,
    hits: u64,
    accesses: u64,
}

#[derive(Clone, Copy)]
struct FrameMeta {
    /// Block index currently cached. Meaningful only when `valid`.
    index: usize,
    valid: bool,
    dirty: bool,
    /// Holders currently pinning the frame. A pinned frame is never
    /// evicted.
    ref_cnt: u32,
}

impl CacheState {
    fn new(capacity: usize) -> Self {
        Self {
            meta: vec![
                FrameMeta {
                    index: usize::MAX,
                    valid: false,
                    dirty: false,
                    ref_cnt: 0,
                };
                capacity
            ]
            .into_boxed_slice(),
            order: (0..capacity).collect(),
            hits: 0,
            accesses: 0,
        }
    }

    fn find_valid(&self, index: usize) -> Option<usize> {
        self.meta
            .iter()
            .position(|m| m.valid && m.index == index)
    }

    /// Moves `slot` to the most-recently-used position.
    fn touch(&mut self, slot: usize) {
        self.order.retain(|&s| s != slot);
        self.order.push_front(slot);
    }

    /// Least-recently-used slot that is not pinned.
    ///
    /// # Panics
    ///
    /// Panics if every frame is pinned. Callers release frames before
    /// their operation returns, so this indicates a caller bug.
    fn victim(&self) -> usize {
        self.order
            .iter()
            .rev()
            .copied()
            .find(|&slot| self.meta[slot].ref_cnt == 0)
            .expect("buffer cache exhausted: all frames pinned")
    }
}

impl<D, const BLOCK_SIZE: usize> BufferCache<D, BLOCK_SIZE>
where
    D: BlockDevice<BLOCK_SIZE>,
{
    /// Creates a cache with [`NUM_FRAMES`] frames.
    pub fn new(device: D) -> Self {
        Self::with_capacity(device, NUM_FRAMES)
    }

    /// Creates a cache with `capacity` frames.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn with_capacity(device: D, capacity: usize) -> Self {
        assert!(capacity > 0);
        let frames = (0..capacity)
            .map(|_| Frame {
                payload: Mutex::new(Box::new([0; BLOCK_SIZE])),
                released: Condvar::new(),
            })
            .collect();
        Self {
            device,
            frames,
            state: Mutex::new(CacheState::new(capacity)),
        }
    }

    /// Pins and returns the frame holding block `index`, reading it from
    /// the device on a miss.
    ///
    /// `write_intent` marks the frame dirty so its contents reach the
    /// device on eviction or flush. On a miss the least-recently-used
    /// unpinned frame is recycled, writing its old contents back first if
    /// dirty. If the block is cached but pinned, the call blocks until
    /// the current holder releases it, then looks the block up again,
    /// since the frame may have been recycled while waiting.
    pub fn acquire(&self, index: usize, write_intent: bool) -> FrameGuard<'_, D, BLOCK_SIZE> {
        let mut state = self.state.lock().unwrap();
        state.accesses += 1;
        loop {
            if let Some(slot) = state.find_valid(index) {
                if state.meta[slot].ref_cnt > 0 {
                    state = self.frames[slot].released.wait(state).unwrap();
                    continue;
                }
                state.hits += 1;
                return self.pin(state, slot, index, write_intent);
            }

            let slot = state.victim();
            let meta = state.meta[slot];
            let mut payload = self.frames[slot].payload.lock().unwrap();
            if meta.valid && meta.dirty {
                self.device.write(meta.index, &payload);
            }
            self.device.read(index, &mut payload);
            drop(payload);
            state.meta[slot] = FrameMeta {
                index,
                valid: true,
                dirty: false,
                ref_cnt: 0,
            };
            trace!("recycled frame {slot} for block {index}");
            return self.pin(state, slot, index, write_intent);
        }
    }

    fn pin(
        &self,
        mut state: MutexGuard<'_, CacheState>,
        slot: usize,
        index: usize,
        write_intent: bool,
    ) -> FrameGuard<'_, D, BLOCK_SIZE> {
        state.touch(slot);
        if write_intent {
            state.meta[slot].dirty = true;
        }
        state.meta[slot].ref_cnt += 1;
        FrameGuard {
            cache: self,
            slot,
            index,
        }
    }

    /// Writes every valid dirty frame back to the device.
    pub fn flush(&self) {
        let mut state = self.state.lock().unwrap();
        for slot in 0..state.meta.len() {
            if state.meta[slot].valid && state.meta[slot].dirty {
                let payload = self.frames[slot].payload.lock().unwrap();
                self.device.write(state.meta[slot].index, &payload);
                drop(payload);
                state.meta[slot].dirty = false;
            }
        }
    }

    /// Flushes, invalidates every frame, and zeroes the hit/access
    /// counters. Subsequent acquires start from a cold cache.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        for slot in 0..state.meta.len() {
            if state.meta[slot].valid && state.meta[slot].dirty {
                let payload = self.frames[slot].payload.lock().unwrap();
                self.device.write(state.meta[slot].index, &payload);
                drop(payload);
                state.meta[slot].dirty = false;
            }
            state.meta[slot].valid = false;
        }
        state.hits = 0;
        state.accesses = 0;
    }

    /// Fraction of acquires served from the cache since the last reset.
    ///
    /// Calling this before any access divides zero by zero; avoiding that
    /// is the caller's responsibility.
    pub fn hit_rate(&self) -> f64 {
        let state = self.state.lock().unwrap();
        state.hits as f64 / state.accesses as f64
    }
}

/// A pinned reference to one cache frame.
///
/// The frame cannot be evicted while the guard lives. Dropping the guard
/// releases the pin and wakes acquirers waiting on the frame.
pub struct FrameGuard<'a, D, const BLOCK_SIZE: usize> {
    cache: &'a BufferCache<D, BLOCK_SIZE>,
    slot: usize,
    index: usize,
}

impl<D, const BLOCK_SIZE: usize> FrameGuard<'_, D, BLOCK_SIZE> {
    /// The block index this frame holds.
    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    /// Reads the frame contents.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8; BLOCK_SIZE]) -> R) -> R {
        let payload = self.cache.frames[self.slot].payload.lock().unwrap();
        f(&payload)
    }

    /// Mutates the frame contents. The frame must have been acquired with
    /// write intent or the mutation may be lost on eviction.
    pub fn with_bytes_mut<R>(&self, f: impl FnOnce(&mut [u8; BLOCK_SIZE]) -> R) -> R {
        let mut payload = self.cache.frames[self.slot].payload.lock().unwrap();
        f(&mut payload)
    }

    /// Reads the frame contents as a POD value starting at byte 0.
    pub fn read_as<T, R>(&self, f: impl FnOnce(&T) -> R) -> R
    where
        T: Pod,
    {
        self.with_bytes(|bytes| f(bytes.as_data_view().get(0)))
    }

    /// Mutates the frame contents as a POD value starting at byte 0.
    pub fn write_as<T, R>(&self, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Pod,
    {
        self.with_bytes_mut(|bytes| f(bytes.as_data_view_mut().get_mut(0)))
    }
}

impl<D, const BLOCK_SIZE: usize> Drop for FrameGuard<'_, D, BLOCK_SIZE> {
    fn drop(&mut self) {
        let mut state = self.cache.state.lock().unwrap();
        state.meta[self.slot].ref_cnt -= 1;
        drop(state);
        self.cache.frames[self.slot].released.notify_all();
    }
}
