//! Per-chunk synchronization.
//!
//! Each chunk of slots has a [`SyncObject`]: a mutex for writers, a writer
//! flag and a version counter. A writer raises the flag once it holds the
//! mutex and, on release, bumps the version before lowering the flag.
//! Optimistic readers sample `(version, flag)` before touching a chunk
//! and re-check afterwards, seqlock style.
//!
//! An [`OperationContext`] records the chunks one operation holds, always
//! acquired in increasing circular order, and releases them in acquisition
//! order when dropped.

use std::hint;
use std::sync::atomic::{self, AtomicBool, AtomicU32, Ordering};
use std::thread;

use parking_lot::lock_api::RawMutex as _;
use parking_lot::RawMutex;

use crate::config::{TableGeometry, MAX_LOCKS_PER_OPERATION};
use crate::error::{Error, Result};

pub struct SyncObject {
    mutex: RawMutex,
    writer_in_progress: AtomicBool,
    version: AtomicU32,
}

impl SyncObject {
    fn new() -> Self {
        SyncObject {
            mutex: RawMutex::INIT,
            writer_in_progress: AtomicBool::new(false),
            version: AtomicU32::new(0),
        }
    }

    #[cfg(test)]
    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn is_writer_in_progress(&self) -> bool {
        self.writer_in_progress.load(Ordering::Acquire)
    }

    /// Begin an optimistic read of this chunk. `None` while a writer is
    /// inside.
    #[inline]
    pub fn read_begin(&self) -> Option<u32> {
        let version = self.version.load(Ordering::Acquire);
        if self.writer_in_progress.load(Ordering::Acquire) {
            None
        } else {
            Some(version)
        }
    }

    /// Whether no writer entered since `read_begin` returned `version`.
    /// Callers issue an acquire fence after their data reads first.
    #[inline]
    pub fn read_validate(&self, version: u32) -> bool {
        !self.writer_in_progress.load(Ordering::Relaxed)
            && self.version.load(Ordering::Relaxed) == version
    }

    fn lock(&self, is_write: bool) {
        self.mutex.lock();
        if is_write {
            self.writer_in_progress.swap(true, Ordering::Acquire);
            // Flag must be visible before any data write.
            atomic::fence(Ordering::Release);
        }
    }

    /// # Safety
    /// The mutex must be held by the current context.
    unsafe fn unlock(&self, is_write: bool) {
        if is_write {
            self.version.fetch_add(1, Ordering::Release);
            self.writer_in_progress.store(false, Ordering::Release);
        }
        self.mutex.unlock();
    }
}

/// The lazily built array of per-chunk sync objects.
pub struct ChunkLocks {
    objects: Box<[SyncObject]>,
}

impl ChunkLocks {
    pub fn new(chunk_count: usize) -> Self {
        ChunkLocks {
            objects: (0..chunk_count).map(|_| SyncObject::new()).collect(),
        }
    }

    #[inline]
    pub fn get(&self, chunk: usize) -> &SyncObject {
        &self.objects[chunk]
    }
}

/// Chunks held by one in-flight operation.
///
/// With `locks == None` (exclusive mode) the context only tracks chunk
/// membership; the caller already holds the table-wide lock.
///
/// A bounded context refuses to hold more than the lock budget. An
/// unbounded one, used only while the table-wide lock is held exclusively,
/// releases its oldest chunk instead, always keeping the most recent ones.
pub(crate) struct OperationContext<'a> {
    locks: Option<&'a ChunkLocks>,
    geometry: &'a TableGeometry,
    held: [usize; MAX_LOCKS_PER_OPERATION],
    first: usize,
    len: usize,
    limit: usize,
    is_write: bool,
    unbounded: bool,
    pub initial_slot: u64,
}

impl<'a> OperationContext<'a> {
    pub fn new(
        locks: Option<&'a ChunkLocks>,
        geometry: &'a TableGeometry,
        is_write: bool,
        initial_slot: u64,
    ) -> Self {
        OperationContext {
            locks,
            geometry,
            held: [0; MAX_LOCKS_PER_OPERATION],
            first: 0,
            len: 0,
            limit: geometry.max_locks_per_operation.min(MAX_LOCKS_PER_OPERATION),
            is_write,
            unbounded: locks.is_none(),
            initial_slot,
        }
    }

    /// A context whose walks may cross any number of chunks. The caller
    /// must hold the table-wide lock exclusively.
    pub fn unbounded(
        locks: Option<&'a ChunkLocks>,
        geometry: &'a TableGeometry,
        is_write: bool,
        initial_slot: u64,
    ) -> Self {
        let mut ctx = Self::new(locks, geometry, is_write, initial_slot);
        ctx.unbounded = true;
        ctx
    }

    /// Make sure the chunk owning `slot` is held, acquiring it if needed.
    pub fn enter(&mut self, slot: u64) -> Result<()> {
        if self.try_enter(slot) {
            Ok(())
        } else {
            Err(Error::ClusterTooLong {
                max_locks: self.limit,
            })
        }
    }

    /// Like [`enter`](Self::enter), but `false` when a bounded context has
    /// spent its budget. Nothing is acquired in that case.
    pub fn try_enter(&mut self, slot: u64) -> bool {
        let chunk = self.geometry.chunk_of(slot);
        if self.holds(chunk) {
            return true;
        }
        if self.len == self.limit {
            if !self.unbounded {
                return false;
            }
            self.release_oldest();
        }
        self.acquire(chunk);
        true
    }

    /// Like [`enter`](Self::enter), but once the budget is spent releases
    /// the oldest chunk instead of failing. Only valid for walks that never
    /// look back at released chunks.
    pub fn enter_sliding(&mut self, slot: u64) -> Result<()> {
        let chunk = self.geometry.chunk_of(slot);
        if self.holds(chunk) {
            return Ok(());
        }
        if self.len == self.limit {
            self.release_oldest();
        }
        self.acquire(chunk);
        Ok(())
    }

    #[cfg(test)]
    pub fn held_count(&self) -> usize {
        self.len
    }

    fn holds(&self, chunk: usize) -> bool {
        (0..self.len).any(|i| self.held[(self.first + i) % MAX_LOCKS_PER_OPERATION] == chunk)
    }

    fn acquire(&mut self, chunk: usize) {
        if let Some(locks) = self.locks {
            locks.get(chunk).lock(self.is_write);
        }
        self.held[(self.first + self.len) % MAX_LOCKS_PER_OPERATION] = chunk;
        self.len += 1;
    }

    fn release_oldest(&mut self) {
        let chunk = self.held[self.first];
        if let Some(locks) = self.locks {
            // SAFETY: `chunk` was locked by `acquire` and not released since.
            unsafe { locks.get(chunk).unlock(self.is_write) };
        }
        self.first = (self.first + 1) % MAX_LOCKS_PER_OPERATION;
        self.len -= 1;
    }
}

impl Drop for OperationContext<'_> {
    fn drop(&mut self) {
        while self.len > 0 {
            self.release_oldest();
        }
    }
}

const SPIN_LIMIT: u32 = 6;
const YIELD_LIMIT: u32 = 10;

/// Exponential spin, then yield, between optimistic retries.
#[derive(Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..1u32 << self.step {
                hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.step < YIELD_LIMIT {
            self.step += 1;
        }
    }
}
