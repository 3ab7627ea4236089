//! Memory-mapped files that can grow while other threads read them.
//!
//! A [`MemoryMapper`] owns one file and its current [`MemoryMapping`]
//! generation. Every structure that reads the file holds a
//! [`MappingSession`]; when the mapper grows the file it maps a new
//! generation and publishes it to every live session under the mapper
//! lock. Generations are reference counted, so a reader still holding the
//! previous generation keeps it mapped until it lets go.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use memmap2::{MmapMut, MmapOptions};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::{Error, Result};

/// File lengths are always a multiple of this many bytes.
const MIN_GRANULARITY: u64 = 64 * 1024;

/// Allocation granularity: the OS page size, but never less than 64 KiB.
pub fn allocation_granularity() -> u64 {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page > 0 {
            return (page as u64).max(MIN_GRANULARITY);
        }
    }
    MIN_GRANULARITY
}

/// Round `len` up to a multiple of `granularity`.
pub fn round_up(len: u64, granularity: u64) -> u64 {
    len.div_ceil(granularity) * granularity
}

/// One generation of a file mapping.
///
/// All access is bounds-checked against the generation's length. Writes go
/// through a shared reference; callers serialize writers to a given range
/// with the lock that owns it (a chunk lock for slot records, the atomic
/// free-space cursor for value log entries).
pub struct MemoryMapping {
    generation: u64,
    ptr: *mut u8,
    len: usize,
    mmap: MmapMut,
}

// SAFETY: the raw pointer targets the mapping owned by `mmap`, which lives
// as long as this value. Concurrent writers are serialized by the callers.
unsafe impl Send for MemoryMapping {}
unsafe impl Sync for MemoryMapping {}

impl MemoryMapping {
    fn new(generation: u64, mut mmap: MmapMut) -> Self {
        let ptr = mmap.as_mut_ptr();
        let len = mmap.len();
        MemoryMapping {
            generation,
            ptr,
            len,
            mmap,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn check(&self, offset: u64, len: usize) -> Result<usize> {
        let end = offset.checked_add(len as u64);
        match end {
            Some(end) if end <= self.len as u64 => Ok(offset as usize),
            _ => Err(Error::OutOfRange {
                offset,
                end: offset.saturating_add(len as u64),
                len: self.len as u64,
            }),
        }
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// The bytes may change underneath the borrow unless the caller holds
    /// the lock that owns the range.
    #[inline]
    pub fn bytes(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = self.check(offset, len)?;
        // SAFETY: range checked above; the mapping outlives `self`.
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(start), len) })
    }

    /// Mutable view of `len` bytes at `offset`.
    ///
    /// # Safety
    /// The caller must hold the lock that owns the range, so no other
    /// writer touches it for the lifetime of the returned slice.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn bytes_mut(&self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let start = self.check(offset, len)?;
        Ok(std::slice::from_raw_parts_mut(self.ptr.add(start), len))
    }

    /// Copy bytes at `offset` into `buf`.
    ///
    /// Safe to call while a writer may be changing the range: the copy can
    /// come out torn, which version-validated readers detect afterwards.
    #[inline]
    pub fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check(offset, buf.len())?;
        // SAFETY: range checked above; `buf` cannot overlap the mapping.
        unsafe { ptr::copy_nonoverlapping(self.ptr.add(start), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy `bytes` to `offset`.
    #[inline]
    pub fn write(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let start = self.check(offset, bytes.len())?;
        // SAFETY: range checked above; writers to this range are serialized
        // by the caller.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(start), bytes.len()) };
        Ok(())
    }

    /// Set `len` bytes at `offset` to `byte`.
    pub fn fill(&self, offset: u64, len: usize, byte: u8) -> Result<()> {
        let start = self.check(offset, len)?;
        // SAFETY: as for `write`.
        unsafe { ptr::write_bytes(self.ptr.add(start), byte, len) };
        Ok(())
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_into(offset, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_into(offset, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Force the whole generation to disk.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

struct SessionCell {
    mapping: RwLock<Option<Arc<MemoryMapping>>>,
}

struct MapperState {
    file: Option<File>,
    current: Option<Arc<MemoryMapping>>,
    next_generation: u64,
    next_session: u64,
    sessions: HashMap<u64, Weak<SessionCell>, ahash::RandomState>,
}

struct MapperShared {
    path: PathBuf,
    label: &'static str,
    state: Mutex<MapperState>,
}

/// Owner of one mapped file and its mapping generations.
pub struct MemoryMapper {
    shared: Arc<MapperShared>,
}

impl MemoryMapper {
    /// Map `path`, creating it with at least `initial_len` bytes when it is
    /// missing or empty. Returns the mapper and whether the file was new.
    pub fn open(path: &Path, label: &'static str, initial_len: u64) -> Result<(Self, bool)> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut len = file.metadata()?.len();
        let created = len == 0;
        if created {
            len = round_up(initial_len.max(1), allocation_granularity());
            file.set_len(len)?;
        }

        // SAFETY: the file stays open for as long as any generation lives;
        // a single owning process per file is assumed.
        let mmap = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };

        info!(path = %path.display(), len, created, "mapped {label} file");

        let state = MapperState {
            file: Some(file),
            current: Some(Arc::new(MemoryMapping::new(0, mmap))),
            next_generation: 1,
            next_session: 0,
            sessions: HashMap::default(),
        };
        let shared = Arc::new(MapperShared {
            path: path.to_path_buf(),
            label,
            state: Mutex::new(state),
        });
        Ok((MemoryMapper { shared }, created))
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Register a new session that follows this mapper's generations.
    pub fn session(&self) -> MappingSession {
        let mut state = self.shared.state.lock();
        let id = state.next_session;
        state.next_session += 1;
        let cell = Arc::new(SessionCell {
            mapping: RwLock::new(state.current.clone()),
        });
        state.sessions.insert(id, Arc::downgrade(&cell));
        MappingSession {
            id,
            cell,
            shared: Arc::clone(&self.shared),
        }
    }

    /// The current generation.
    pub fn current(&self) -> Result<Arc<MemoryMapping>> {
        self.shared
            .state
            .lock()
            .current
            .clone()
            .ok_or(Error::Disposed)
    }

    /// Mapped length of the current generation.
    pub fn len(&self) -> Result<u64> {
        Ok(self.current()?.len() as u64)
    }

    /// Extend the file to at least `min_len` bytes (rounded to the
    /// allocation granularity), map a new generation and publish it to
    /// every session. A no-op when the file is already long enough.
    pub fn grow(&self, min_len: u64) -> Result<Arc<MemoryMapping>> {
        let mut state = self.shared.state.lock();
        let current = state.current.clone().ok_or(Error::Disposed)?;
        if current.len() as u64 >= min_len {
            return Ok(current);
        }

        let new_len = round_up(min_len, allocation_granularity());
        let file = state.file.as_ref().ok_or(Error::Disposed)?;
        file.set_len(new_len)?;
        // SAFETY: see `open`.
        let mmap = unsafe { MmapOptions::new().len(new_len as usize).map_mut(file)? };

        let generation = state.next_generation;
        state.next_generation += 1;
        let mapping = Arc::new(MemoryMapping::new(generation, mmap));
        state.current = Some(Arc::clone(&mapping));

        // Publish while still holding the mapper lock so no session can
        // observe a generation older than one already handed out.
        state.sessions.retain(|_, weak| match weak.upgrade() {
            Some(cell) => {
                *cell.mapping.write() = Some(Arc::clone(&mapping));
                true
            }
            None => false,
        });

        debug!(
            file = self.shared.label,
            generation,
            old_len = current.len(),
            new_len,
            sessions = state.sessions.len(),
            "published grown mapping"
        );
        Ok(mapping)
    }

    /// Flush the current generation to disk.
    pub fn flush(&self) -> Result<()> {
        self.current()?.flush()
    }

    /// Flush, detach every session and close the file. Later calls are
    /// no-ops. Every failure is collected rather than stopping at the first.
    pub fn close(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        let Some(file) = state.file.take() else {
            return Ok(());
        };

        let mut errors = Vec::new();
        if let Some(current) = state.current.take() {
            if let Err(e) = current.flush() {
                errors.push(e);
            }
        }
        for weak in state.sessions.values() {
            if let Some(cell) = weak.upgrade() {
                *cell.mapping.write() = None;
            }
        }
        if let Err(e) = file.sync_all() {
            errors.push(Error::Io(e));
        }
        drop(file);

        debug!(file = self.shared.label, path = %self.shared.path.display(), "closed mapping");
        Error::aggregate(errors)
    }
}

/// A structure's view of a mapper: the last generation published to it.
pub struct MappingSession {
    id: u64,
    cell: Arc<SessionCell>,
    shared: Arc<MapperShared>,
}

impl MappingSession {
    /// The generation most recently published to this session. Holding the
    /// returned handle keeps that generation mapped.
    #[inline]
    pub fn mapping(&self) -> Result<Arc<MemoryMapping>> {
        self.cell.mapping.read().clone().ok_or(Error::Disposed)
    }

    pub fn generation(&self) -> Option<u64> {
        self.cell.mapping.read().as_ref().map(|m| m.generation())
    }
}

impl Drop for MappingSession {
    fn drop(&mut self) {
        self.shared.state.lock().sessions.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn granularity_is_at_least_64k() {
        let g = allocation_granularity();
        assert!(g >= MIN_GRANULARITY);
        assert!(g.is_power_of_two());
        assert_eq!(round_up(1, g), g);
        assert_eq!(round_up(g, g), g);
        assert_eq!(round_up(g + 1, g), 2 * g);
    }

    #[test]
    fn create_then_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("region.bin");

        {
            let (mapper, created) = MemoryMapper::open(&path, "test", 100)?;
            assert!(created);
            assert_eq!(mapper.len()?, allocation_granularity());
            mapper.current()?.write_u64(8, 0xfeed)?;
            mapper.close()?;
        }

        let (mapper, created) = MemoryMapper::open(&path, "test", 100)?;
        assert!(!created);
        assert_eq!(mapper.current()?.read_u64(8)?, 0xfeed);
        Ok(())
    }

    #[test]
    fn access_is_bounds_checked() -> Result<()> {
        let dir = tempdir()?;
        let (mapper, _) = MemoryMapper::open(&dir.path().join("r.bin"), "test", 1)?;
        let mapping = mapper.current()?;
        let len = mapping.len() as u64;

        assert!(mapping.bytes(len - 4, 4).is_ok());
        assert!(matches!(
            mapping.bytes(len - 4, 8),
            Err(Error::OutOfRange { .. })
        ));
        assert!(mapping.write(u64::MAX, b"x").is_err());
        Ok(())
    }

    #[test]
    fn grow_publishes_to_sessions_and_keeps_old_generation() -> Result<()> {
        let dir = tempdir()?;
        let (mapper, _) = MemoryMapper::open(&dir.path().join("g.bin"), "test", 1)?;
        let granularity = allocation_granularity();

        let a = mapper.session();
        let b = mapper.session();
        let held = a.mapping()?;
        held.write(16, b"still here")?;
        assert_eq!(held.generation(), 0);

        mapper.grow(granularity + 1)?;

        assert_eq!(a.generation(), Some(1));
        assert_eq!(b.generation(), Some(1));
        assert_eq!(b.mapping()?.len() as u64, 2 * granularity);

        // The old generation is still mapped and sees the same file.
        assert_eq!(held.bytes(16, 10)?, b"still here");
        b.mapping()?.write(32, b"new")?;
        assert_eq!(held.bytes(32, 3)?, b"new");

        // Growing to a length already covered is a no-op.
        mapper.grow(granularity)?;
        assert_eq!(a.generation(), Some(1));
        Ok(())
    }

    #[test]
    fn dropped_sessions_are_forgotten() -> Result<()> {
        let dir = tempdir()?;
        let (mapper, _) = MemoryMapper::open(&dir.path().join("s.bin"), "test", 1)?;
        let session = mapper.session();
        drop(session);
        assert!(mapper.shared.state.lock().sessions.is_empty());
        Ok(())
    }

    #[test]
    fn close_detaches_sessions_and_is_idempotent() -> Result<()> {
        let dir = tempdir()?;
        let (mapper, _) = MemoryMapper::open(&dir.path().join("c.bin"), "test", 1)?;
        let session = mapper.session();
        let held = session.mapping()?;

        mapper.close()?;
        mapper.close()?;

        assert!(matches!(session.mapping(), Err(Error::Disposed)));
        assert!(matches!(mapper.grow(1 << 20), Err(Error::Disposed)));
        // An in-flight holder can still finish its read.
        assert_eq!(held.read_u64(0)?, 0);
        Ok(())
    }
}
