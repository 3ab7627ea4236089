//! Table sizing and open-time options.
//!
//! Every structural number of a table (slot count, chunk geometry, probe
//! limit, lock budget) is a power-of-two choice derived here once, when
//! the file is created. Reopening a file recomputes the geometry from the
//! slot count and chunk size stored in its header.

use std::thread;

use crate::error::{Error, Result};

/// Smallest slot array a table is created with.
pub const MIN_SLOT_COUNT: u64 = 16;

/// Bounds on the number of lock chunks.
pub const MIN_CHUNK_COUNT: u64 = 8;
pub const MAX_CHUNK_COUNT: u64 = 8192;

/// Upper bound of chunk locks a single operation may hold at once.
pub const MAX_LOCKS_PER_OPERATION: usize = 8;
const MIN_LOCKS_PER_OPERATION: usize = 2;

/// Largest chunk size before the distance formula takes over.
const MAX_MIN_CHUNK_SIZE: u64 = 64;

/// Slot count for a requested capacity: `capacity * 8/7` rounded up to a
/// power of two, so the load factor stays at or below 87.5%. `None` when
/// no `u64` slot count is large enough.
pub fn slot_count_for_capacity(capacity: u64) -> Option<u64> {
    capacity
        .checked_mul(8)?
        .div_ceil(7)
        .max(MIN_SLOT_COUNT)
        .checked_next_power_of_two()
}

/// Derived slot and chunk geometry of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableGeometry {
    pub slot_count: u64,
    pub chunk_size: u64,
    pub chunk_count: u64,
    /// Probe distance past which insertion fails.
    pub max_allowed_distance: u32,
    /// Chunk locks an operation may hold at the same time.
    pub max_locks_per_operation: usize,
}

impl TableGeometry {
    /// Geometry for a new table sized for `capacity` records.
    pub fn for_capacity(capacity: u64, processor_count: usize) -> Result<Self> {
        let slot_count =
            slot_count_for_capacity(capacity).ok_or(Error::CapacityTooLarge { capacity })?;
        let p = processor_count.max(1) as u64;
        let wanted_chunks = p
            .saturating_mul(p)
            .saturating_mul(16)
            .next_power_of_two()
            .min(MAX_CHUNK_COUNT);
        let chunk_size =
            (slot_count / wanted_chunks).max((slot_count / 8).min(MAX_MIN_CHUNK_SIZE));
        Ok(Self::from_parts(slot_count, chunk_size))
    }

    /// Geometry from the two values persisted in a table header.
    pub fn from_parts(slot_count: u64, chunk_size: u64) -> Self {
        debug_assert!(slot_count.is_power_of_two() && slot_count >= MIN_SLOT_COUNT);
        debug_assert!(chunk_size.is_power_of_two());

        let chunk_count = slot_count / chunk_size;
        let log2_slots = slot_count.trailing_zeros() as u64;

        // An operation spanning at most chunk_count - 2 chunks can never
        // wrap around onto a chunk it (or its neighbour) already holds.
        let max_allowed_distance = (7 * chunk_size)
            .min(6 + 42 * log2_slots)
            .min(chunk_count.saturating_sub(2) * chunk_size);

        let max_locks_per_operation = ((max_allowed_distance.div_ceil(chunk_size) + 1) as usize)
            .clamp(MIN_LOCKS_PER_OPERATION, MAX_LOCKS_PER_OPERATION);

        TableGeometry {
            slot_count,
            chunk_size,
            chunk_count,
            max_allowed_distance: max_allowed_distance as u32,
            max_locks_per_operation,
        }
    }

    /// Records the table accepts before crossing the 87.5% load ceiling.
    pub fn capacity(&self) -> u64 {
        self.slot_count - self.slot_count / 8
    }

    #[inline]
    pub fn hash_mask(&self) -> u64 {
        self.slot_count - 1
    }

    #[inline]
    pub fn initial_slot(&self, hash: u64) -> u64 {
        hash & self.hash_mask()
    }

    #[inline]
    pub fn next_slot(&self, slot: u64) -> u64 {
        (slot + 1) & self.hash_mask()
    }

    #[inline]
    pub fn chunk_of(&self, slot: u64) -> usize {
        (slot / self.chunk_size) as usize
    }

    /// Whether the chunk geometry satisfies the structural bounds.
    pub fn is_valid(&self) -> bool {
        self.slot_count.is_power_of_two()
            && self.slot_count >= MIN_SLOT_COUNT
            && self.chunk_size.is_power_of_two()
            && self.chunk_size <= self.slot_count
            && (MIN_CHUNK_COUNT..=MAX_CHUNK_COUNT).contains(&self.chunk_count)
    }
}

/// How `try_get` and `contains_key` read the slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Version-validated reads that never take a chunk lock.
    #[default]
    Optimistic,
    /// Reads that take each chunk's lock like a writer would, without
    /// raising the writer flag.
    Locking,
}

/// How concurrent callers are coordinated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// One lock and version pair per chunk; operations on distant keys run
    /// in parallel.
    #[default]
    Chunked,
    /// No per-chunk state at all; every operation holds one table-wide lock.
    Exclusive,
}

/// Options for opening a store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Records the table must hold. Ignored when the file already exists.
    pub capacity: u64,
    /// Processor count the chunk count is sized for.
    pub processor_count: usize,
    pub read_mode: ReadMode,
    pub concurrency: Concurrency,
    /// Initial length of the value log file in bytes.
    pub data_file_initial_size: u64,
    /// Bytes the value log grows by when an allocation runs past its end.
    pub data_file_growth: u64,
    /// Failed optimistic validations before a read takes the locking path.
    pub max_optimistic_retries: u32,
}

impl Default for StoreOptions {
    fn default() -> Self {
        StoreOptions {
            capacity: 64 * 1024,
            processor_count: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            read_mode: ReadMode::default(),
            concurrency: Concurrency::default(),
            data_file_initial_size: 1024 * 1024,
            data_file_growth: 4 * 1024 * 1024,
            max_optimistic_retries: 64,
        }
    }
}

impl StoreOptions {
    pub fn with_capacity(capacity: u64) -> Self {
        StoreOptions {
            capacity,
            ..Default::default()
        }
    }

    pub fn processor_count(mut self, processor_count: usize) -> Self {
        self.processor_count = processor_count.max(1);
        self
    }

    pub fn read_mode(mut self, read_mode: ReadMode) -> Self {
        self.read_mode = read_mode;
        self
    }

    pub fn concurrency(mut self, concurrency: Concurrency) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn data_file_initial_size(mut self, bytes: u64) -> Self {
        self.data_file_initial_size = bytes;
        self
    }

    pub fn data_file_growth(mut self, bytes: u64) -> Self {
        self.data_file_growth = bytes.max(1);
        self
    }

    pub fn max_optimistic_retries(mut self, retries: u32) -> Self {
        self.max_optimistic_retries = retries;
        self
    }

    /// Geometry a new table would be created with.
    pub fn geometry(&self) -> Result<TableGeometry> {
        TableGeometry::for_capacity(self.capacity, self.processor_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_count_keeps_load_under_seven_eighths() {
        assert_eq!(slot_count_for_capacity(0), Some(16));
        assert_eq!(slot_count_for_capacity(14), Some(16));
        assert_eq!(slot_count_for_capacity(15), Some(32));
        assert_eq!(slot_count_for_capacity(1000), Some(2048));
        assert_eq!(slot_count_for_capacity(1_000_000), Some(1 << 21));
    }

    #[test]
    fn oversized_capacity_is_rejected() {
        assert_eq!(slot_count_for_capacity(u64::MAX), None);
        assert_eq!(slot_count_for_capacity(u64::MAX / 7), None);
        assert_eq!(slot_count_for_capacity(7 << 58), Some(1 << 61));
        assert!(matches!(
            TableGeometry::for_capacity(u64::MAX, 1),
            Err(Error::CapacityTooLarge { capacity: u64::MAX })
        ));
        assert!(StoreOptions::with_capacity(u64::MAX).geometry().unwrap_err().is_capacity());
    }

    #[test]
    fn smallest_table() {
        let g = TableGeometry::for_capacity(14, 1).unwrap();
        assert_eq!(g.slot_count, 16);
        assert_eq!(g.chunk_size, 2);
        assert_eq!(g.chunk_count, 8);
        // min(7 * 2, 6 + 42 * 4) = 14, capped at (8 - 2) * 2
        assert_eq!(g.max_allowed_distance, 12);
        assert_eq!(g.max_locks_per_operation, 7);
        assert_eq!(g.capacity(), 14);
        assert!(g.is_valid());
    }

    #[test]
    fn medium_table() {
        let g = TableGeometry::for_capacity(1000, 2).unwrap();
        assert_eq!(g.slot_count, 2048);
        assert_eq!(g.chunk_size, 64);
        assert_eq!(g.chunk_count, 32);
        assert_eq!(g.max_allowed_distance, 448);
        assert_eq!(g.max_locks_per_operation, 8);
    }

    #[test]
    fn large_table_is_distance_bound() {
        let g = TableGeometry::for_capacity(1_000_000, 8).unwrap();
        assert_eq!(g.chunk_count, 1024);
        assert_eq!(g.chunk_size, 2048);
        assert_eq!(g.max_allowed_distance, 6 + 42 * 21);
        assert_eq!(g.max_locks_per_operation, 2);
    }

    #[test]
    fn chunk_count_stays_in_bounds() {
        for capacity in [0u64, 1, 100, 10_000, 1 << 20, 1 << 26] {
            for processors in [1usize, 2, 3, 8, 64, 512] {
                let g = TableGeometry::for_capacity(capacity, processors).unwrap();
                assert!(g.is_valid(), "{g:?}");
                assert!(
                    (g.max_allowed_distance as u64) <= (g.chunk_count - 2) * g.chunk_size,
                    "{g:?}"
                );
                assert!(g.max_locks_per_operation < g.chunk_count as usize);
            }
        }
    }

    #[test]
    fn reopen_geometry_matches_creation() {
        let created = TableGeometry::for_capacity(5000, 4).unwrap();
        let reopened = TableGeometry::from_parts(created.slot_count, created.chunk_size);
        assert_eq!(created, reopened);
    }

    #[test]
    fn slot_addressing_wraps() {
        let g = TableGeometry::for_capacity(14, 1).unwrap();
        assert_eq!(g.initial_slot(0x1234_5671), 1);
        assert_eq!(g.next_slot(15), 0);
        assert_eq!(g.chunk_of(5), 2);
    }
}
