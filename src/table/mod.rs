//! Memory-mapped Robin Hood slot table.
//!
//! [`RawTable`] stores fixed-size records keyed by a 64-bit hash and a
//! caller-supplied key matcher; it knows nothing about codecs or the value
//! log. Writers lock the chunks their probe crosses; readers either
//! validate chunk versions optimistically or lock like writers, per
//! [`ReadMode`].

pub mod layout;
pub(crate) mod engine;
pub(crate) mod lock;
pub(crate) mod optimistic;
pub(crate) mod slots;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::config::{
    Concurrency, ReadMode, StoreOptions, TableGeometry, MAX_CHUNK_COUNT, MIN_CHUNK_COUNT,
    MIN_SLOT_COUNT,
};
use crate::error::{Error, Result};
use crate::mapping::{MappingSession, MemoryMapper, MemoryMapping};

use engine::{Probe, TableStats};
use layout::*;
use lock::{ChunkLocks, OperationContext};
use optimistic::Optimistic;
use slots::SlotView;

/// What a write does once the key has been located.
pub(crate) enum Action {
    /// Leave the table as it is.
    Keep,
    /// Insert this record. Only valid when the key is absent.
    Insert(Vec<u8>),
    /// Overwrite the value part of the existing record.
    Replace(Vec<u8>),
    /// Remove the existing record.
    Remove,
}

/// Point-in-time table statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub record_count: u64,
    /// Sum of the distances of all records.
    pub distance_sum: u64,
    /// Largest distance any record has been placed at since the last
    /// clear. Not lowered by removals.
    pub max_distance: u32,
    pub slot_count: u64,
    pub capacity: u64,
    pub max_allowed_distance: u32,
}

impl StatsSnapshot {
    /// Mean record distance; 1.0 means every record sits at its ideal slot.
    pub fn average_distance(&self) -> f64 {
        if self.record_count == 0 {
            0.0
        } else {
            self.distance_sum as f64 / self.record_count as f64
        }
    }

    pub fn load_factor(&self) -> f64 {
        self.record_count as f64 / self.slot_count as f64
    }
}

/// Outcome of one write pass.
enum Attempt<R, F> {
    Done(R),
    /// The insert chain needs more chunks than the lock budget; `decide`
    /// has not run.
    Escalate(F),
}

/// Hold on the structure lock for the length of one operation.
struct StructureGuard<'a> {
    _shared: Option<RwLockReadGuard<'a, ()>>,
    _exclusive: Option<RwLockWriteGuard<'a, ()>>,
}

pub struct RawTable {
    path: PathBuf,
    mapper: MemoryMapper,
    session: MappingSession,
    layout: RecordLayout,
    geometry: TableGeometry,
    concurrency: Concurrency,
    read_mode: ReadMode,
    max_retries: u32,
    locks: OnceLock<ChunkLocks>,
    /// Shared by chunked operations; held exclusively by clear, dispose and
    /// every operation in exclusive mode.
    structure: RwLock<()>,
    stats: TableStats,
    disposed: AtomicBool,
}

impl RawTable {
    /// Open or create the table file at `path` for records of `layout`.
    ///
    /// A new file is sized from `options`; an existing one keeps the
    /// geometry in its header.
    pub fn open(path: &Path, layout: RecordLayout, options: &StoreOptions) -> Result<Self> {
        let requested = options.geometry()?;
        let (mapper, created) =
            MemoryMapper::open(path, "table", layout.file_len(requested.slot_count))?;
        let mapping = mapper.current()?;

        let (geometry, stats) = if created {
            write_header(&mapping, layout, &requested)?;
            mapping.flush()?;
            (requested, TableStats::default())
        } else {
            read_header(&mapping, layout)?
        };

        info!(
            path = %path.display(),
            created,
            shape = ?layout.shape,
            record_size = layout.record_size(),
            slot_count = geometry.slot_count,
            chunk_size = geometry.chunk_size,
            chunk_count = geometry.chunk_count,
            max_allowed_distance = geometry.max_allowed_distance,
            records = stats.record_count.load(Ordering::Relaxed),
            "opened table"
        );

        let session = mapper.session();
        Ok(RawTable {
            path: path.to_path_buf(),
            mapper,
            session,
            layout,
            geometry,
            concurrency: options.concurrency,
            read_mode: options.read_mode,
            max_retries: options.max_optimistic_retries,
            locks: OnceLock::new(),
            structure: RwLock::new(()),
            stats,
            disposed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    pub fn geometry(&self) -> &TableGeometry {
        &self.geometry
    }

    /// Chunk sync objects, built on first use. `None` in exclusive mode.
    pub(crate) fn ensure_initialized(&self) -> Option<&ChunkLocks> {
        match self.concurrency {
            Concurrency::Exclusive => None,
            Concurrency::Chunked => Some(self.locks.get_or_init(|| {
                debug!(
                    chunk_count = self.geometry.chunk_count,
                    "initializing chunk sync objects"
                );
                ChunkLocks::new(self.geometry.chunk_count as usize)
            })),
        }
    }

    fn check_live(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }

    fn begin(&self) -> Result<(StructureGuard<'_>, Arc<MemoryMapping>)> {
        let guard = match self.concurrency {
            Concurrency::Chunked => StructureGuard {
                _shared: Some(self.structure.read()),
                _exclusive: None,
            },
            Concurrency::Exclusive => StructureGuard {
                _shared: None,
                _exclusive: Some(self.structure.write()),
            },
        };
        self.check_live()?;
        Ok((guard, self.session.mapping()?))
    }

    /// The record for the key `matches` accepts among those hashing to
    /// `hash`.
    pub fn get<M>(&self, hash: u64, mut matches: M) -> Result<Option<Vec<u8>>>
    where
        M: FnMut(&[u8]) -> Result<bool>,
    {
        if self.read_mode == ReadMode::Optimistic {
            if let Some(locks) = self.ensure_initialized() {
                self.check_live()?;
                let mapping = self.session.mapping()?;
                let view = SlotView::new(&mapping, self.layout);
                let initial = self.geometry.initial_slot(hash);
                match optimistic::read(
                    &view,
                    locks,
                    &self.geometry,
                    initial,
                    self.max_retries,
                    &mut matches,
                )? {
                    Optimistic::Hit(record) => return Ok(Some(record)),
                    Optimistic::Miss => return Ok(None),
                    Optimistic::Contended => {
                        warn!(
                            slot = initial,
                            retries = self.max_retries,
                            "optimistic read kept failing validation, taking locks"
                        );
                    }
                }
            }
        }
        self.get_locked(hash, matches)
    }

    fn get_locked<M>(&self, hash: u64, matches: M) -> Result<Option<Vec<u8>>>
    where
        M: FnMut(&[u8]) -> Result<bool>,
    {
        let (_guard, mapping) = self.begin()?;
        let view = SlotView::new(&mapping, self.layout);
        let initial = self.geometry.initial_slot(hash);
        let mut ctx = OperationContext::new(self.ensure_initialized(), &self.geometry, false, initial);
        let mut record = view.record_buf();
        match engine::locate(&view, &mut ctx, &self.geometry, &mut record, matches)? {
            Probe::Found { .. } => Ok(Some(record)),
            Probe::Vacant { .. } => Ok(None),
        }
    }

    /// Locate the key, let `decide` inspect the existing record (if any)
    /// and apply the [`Action`] it returns, all under the chunk locks of
    /// the probe. `decide` runs exactly once.
    ///
    /// An insert whose displacement chain needs more chunks than the lock
    /// budget is retried with the structure lock held exclusively, before
    /// `decide` has run.
    pub(crate) fn write<M, F, R>(&self, hash: u64, mut matches: M, decide: F) -> Result<R>
    where
        M: FnMut(&[u8]) -> Result<bool>,
        F: FnOnce(Option<&[u8]>) -> Result<(Action, R)>,
    {
        let decide = match self.concurrency {
            Concurrency::Chunked => {
                let _shared = self.structure.read();
                self.check_live()?;
                let mapping = self.session.mapping()?;
                match self.attempt(&mapping, true, hash, &mut matches, decide)? {
                    Attempt::Done(out) => return Ok(out),
                    Attempt::Escalate(decide) => decide,
                }
            }
            Concurrency::Exclusive => decide,
        };

        let _exclusive = self.structure.write();
        self.check_live()?;
        let mapping = self.session.mapping()?;
        if self.concurrency == Concurrency::Chunked {
            debug!(
                slot = self.geometry.initial_slot(hash),
                max_locks = self.geometry.max_locks_per_operation,
                "insert chain exceeds the lock budget, holding the table exclusively"
            );
        }
        match self.attempt(&mapping, false, hash, &mut matches, decide)? {
            Attempt::Done(out) => Ok(out),
            Attempt::Escalate(_) => Err(Error::ClusterTooLong {
                max_locks: self.geometry.max_locks_per_operation,
            }),
        }
    }

    /// One pass of [`write`](Self::write). A `bounded` pass hands `decide`
    /// back untouched when the insert chain does not fit the lock budget.
    fn attempt<M, F, R>(
        &self,
        mapping: &MemoryMapping,
        bounded: bool,
        hash: u64,
        matches: &mut M,
        decide: F,
    ) -> Result<Attempt<R, F>>
    where
        M: FnMut(&[u8]) -> Result<bool>,
        F: FnOnce(Option<&[u8]>) -> Result<(Action, R)>,
    {
        let view = SlotView::new(mapping, self.layout);
        let initial = self.geometry.initial_slot(hash);
        let locks = self.ensure_initialized();
        let mut ctx = if bounded {
            OperationContext::new(locks, &self.geometry, true, initial)
        } else {
            OperationContext::unbounded(locks, &self.geometry, true, initial)
        };
        let mut record = view.record_buf();

        match engine::locate(&view, &mut ctx, &self.geometry, &mut record, &mut *matches)? {
            Probe::Found { slot } => {
                let (action, out) = decide(Some(&record))?;
                match action {
                    Action::Keep => {}
                    Action::Insert(_) => return Err(Error::KeyExists),
                    Action::Replace(value) => view.write_value(slot, &value)?,
                    Action::Remove => {
                        engine::remove(&view, &mut ctx, &self.geometry, &self.stats, slot)?
                    }
                }
                Ok(Attempt::Done(out))
            }
            Probe::Vacant { slot, distance } => {
                if !engine::reserve(&view, &mut ctx, &self.geometry, slot)? {
                    return Ok(Attempt::Escalate(decide));
                }
                let (action, out) = decide(None)?;
                match action {
                    Action::Keep => {}
                    Action::Insert(mut incoming) => engine::insert(
                        &view,
                        &mut ctx,
                        &self.geometry,
                        &self.stats,
                        slot,
                        distance,
                        &mut incoming,
                    )?,
                    Action::Replace(_) | Action::Remove => return Err(Error::KeyNotFound),
                }
                Ok(Attempt::Done(out))
            }
        }
    }

    /// Empty every slot. Space in the value log is not reclaimed.
    pub fn clear(&self) -> Result<()> {
        let _guard = self.structure.write();
        self.check_live()?;
        let mapping = self.session.mapping()?;
        let view = SlotView::new(&mapping, self.layout);
        let locks = self.ensure_initialized();

        // Optimistic readers do not take the structure lock; bump every
        // chunk's version so they retry.
        for chunk in 0..self.geometry.chunk_count {
            let first = chunk * self.geometry.chunk_size;
            let mut ctx = OperationContext::new(locks, &self.geometry, true, first);
            ctx.enter(first)?;
            view.clear_range(first, self.geometry.chunk_size)?;
        }
        self.stats.reset();
        debug!(path = %self.path.display(), "cleared table");
        Ok(())
    }

    /// Copy every occupied record in `chunk`, in slot order.
    pub(crate) fn scan_chunk(&self, chunk: u64, out: &mut Vec<Vec<u8>>) -> Result<()> {
        let (_guard, mapping) = self.begin()?;
        let view = SlotView::new(&mapping, self.layout);
        let first = chunk * self.geometry.chunk_size;
        let mut ctx = OperationContext::new(self.ensure_initialized(), &self.geometry, false, first);
        ctx.enter(first)?;
        let mut record = view.record_buf();
        for slot in first..first + self.geometry.chunk_size {
            view.read(slot, &mut record)?;
            if self.layout.distance(&record) != 0 {
                out.push(record.clone());
            }
        }
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.stats.record_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            record_count: self.len(),
            distance_sum: self.stats.distance_sum.load(Ordering::Acquire).max(0) as u64,
            max_distance: self.stats.max_distance.load(Ordering::Acquire),
            slot_count: self.geometry.slot_count,
            capacity: self.geometry.capacity(),
            max_allowed_distance: self.geometry.max_allowed_distance,
        }
    }

    fn persist_stats(&self, mapping: &MemoryMapping) -> Result<()> {
        let stats = self.stats();
        mapping.write_u64(OFF_RECORD_COUNT, stats.record_count)?;
        mapping.write_u64(OFF_DISTANCE_SUM, stats.distance_sum)?;
        mapping.write_u32(OFF_MAX_DISTANCE, stats.max_distance)
    }

    /// Write statistics to the header and flush the mapping.
    pub fn flush(&self) -> Result<()> {
        let (_guard, mapping) = self.begin()?;
        self.persist_stats(&mapping)?;
        mapping.flush()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Persist statistics and release the file. Waits for in-flight
    /// operations; later calls are no-ops.
    pub fn dispose(&self) -> Result<()> {
        let _guard = self.structure.write();
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let mut errors = Vec::new();
        match self.session.mapping() {
            Ok(mapping) => {
                if let Err(e) = self.persist_stats(&mapping) {
                    errors.push(e);
                }
            }
            Err(e) => errors.push(e),
        }
        if let Err(e) = self.mapper.close() {
            errors.push(e);
        }

        info!(
            path = %self.path.display(),
            records = self.len(),
            errors = errors.len(),
            "disposed table"
        );
        Error::aggregate(errors)
    }
}

fn write_header(
    mapping: &MemoryMapping,
    layout: RecordLayout,
    geometry: &TableGeometry,
) -> Result<()> {
    mapping.fill(0, HEADER_SIZE as usize, 0)?;
    mapping.write_u64(OFF_MAGIC, TABLE_MAGIC)?;
    mapping.write_u64(OFF_SLOT_COUNT, geometry.slot_count)?;
    mapping.write_u32(OFF_RECORD_SIZE, layout.record_size() as u32)?;
    mapping.write_u32(OFF_CHUNK_SIZE, geometry.chunk_size as u32)?;
    mapping.write_u32(OFF_SHAPE, layout.shape as u32)?;
    mapping.write_u32(OFF_KEY_WIDTH, layout.key_width as u32)?;
    mapping.write_u32(OFF_VALUE_WIDTH, layout.value_width as u32)
}

fn mismatch(field: &'static str, found: u64, expected: u64) -> Error {
    Error::FormatMismatch {
        file: "table",
        field,
        found,
        expected,
    }
}

/// Validate an existing header against the record layout and return the
/// stored geometry and statistics.
fn read_header(mapping: &MemoryMapping, layout: RecordLayout) -> Result<(TableGeometry, TableStats)> {
    let len = mapping.len() as u64;
    if len < HEADER_SIZE {
        return Err(Error::Truncated {
            file: "table",
            len,
            needed: HEADER_SIZE,
        });
    }

    let magic = mapping.read_u64(OFF_MAGIC)?;
    if magic != TABLE_MAGIC {
        return Err(Error::BadMagic {
            file: "table",
            found: magic,
        });
    }

    let record_size = mapping.read_u32(OFF_RECORD_SIZE)? as u64;
    if record_size != layout.record_size() as u64 {
        return Err(mismatch("record_size", record_size, layout.record_size() as u64));
    }
    let shape = mapping.read_u32(OFF_SHAPE)?;
    if RecordShape::from_u32(shape) != Some(layout.shape) {
        return Err(mismatch("shape", shape as u64, layout.shape as u64));
    }
    let key_width = mapping.read_u32(OFF_KEY_WIDTH)? as u64;
    if key_width != layout.key_width as u64 {
        return Err(mismatch("key_width", key_width, layout.key_width as u64));
    }
    let value_width = mapping.read_u32(OFF_VALUE_WIDTH)? as u64;
    if value_width != layout.value_width as u64 {
        return Err(mismatch("value_width", value_width, layout.value_width as u64));
    }

    let slot_count = mapping.read_u64(OFF_SLOT_COUNT)?;
    if !slot_count.is_power_of_two() || slot_count < MIN_SLOT_COUNT {
        let nearest = slot_count.max(MIN_SLOT_COUNT).checked_next_power_of_two();
        return Err(mismatch("slot_count", slot_count, nearest.unwrap_or(0)));
    }
    // Chunk count must stay within bounds, which caps the chunk size.
    let chunk_size = mapping.read_u32(OFF_CHUNK_SIZE)? as u64;
    let largest_chunk = slot_count / MIN_CHUNK_COUNT;
    if !chunk_size.is_power_of_two() || chunk_size > largest_chunk {
        return Err(mismatch("chunk_size", chunk_size, largest_chunk));
    }
    let geometry = TableGeometry::from_parts(slot_count, chunk_size);
    if !geometry.is_valid() {
        return Err(mismatch("chunk_count", geometry.chunk_count, MAX_CHUNK_COUNT));
    }

    let needed = layout.file_len(slot_count);
    if len < needed {
        return Err(Error::Truncated {
            file: "table",
            len,
            needed,
        });
    }

    let record_count = mapping.read_u64(OFF_RECORD_COUNT)?;
    if record_count > slot_count {
        return Err(mismatch("record_count", record_count, slot_count));
    }
    let stats = TableStats::new(
        record_count,
        mapping.read_u64(OFF_DISTANCE_SUM)?,
        mapping.read_u32(OFF_MAX_DISTANCE)?,
    );
    Ok((geometry, stats))
}
