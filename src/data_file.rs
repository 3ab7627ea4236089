//! Append-only value log.
//!
//! Payloads are stored as `{ length: u32, bytes }` entries at offsets handed
//! out by an atomic free-space cursor. Offsets are never reused, so a reader
//! holding an offset can always read the entry that was written there.

use std::mem;
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::mapping::{MappingSession, MemoryMapper, MemoryMapping};

/// Magic number at the start of every value log file.
pub const DATA_MAGIC: u64 = u64::from_le_bytes(*b"RBVLOG01");

/// Size of the fixed header at the start of the file.
pub const DATA_HEADER_SIZE: u64 = 64;

/// Bytes in an entry's length prefix.
pub const LENGTH_PREFIX: u64 = 4;

/// Header at offset 0 of the value log.
#[repr(C)]
#[derive(Debug)]
pub struct DataFileHeader {
    pub magic: u64,             // 0..8
    pub free_space_offset: u64, // 8..16
    pub _pad: [u8; 48],
}

const _: () = assert!(mem::size_of::<DataFileHeader>() == DATA_HEADER_SIZE as usize);

const OFF_MAGIC: u64 = mem::offset_of!(DataFileHeader, magic) as u64;
const OFF_FREE_SPACE: u64 = mem::offset_of!(DataFileHeader, free_space_offset) as u64;

/// Read-only view of one entry's payload.
///
/// Keeps the mapping generation it was read from alive, so the view stays
/// valid while the log grows.
pub struct ValueView {
    mapping: Arc<MemoryMapping>,
    start: u64,
    len: usize,
}

impl ValueView {
    pub fn as_bytes(&self) -> &[u8] {
        // The range was validated when the view was created.
        self.mapping.bytes(self.start, self.len).unwrap_or_default()
    }
}

impl Deref for ValueView {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl AsRef<[u8]> for ValueView {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

pub struct DataFile {
    mapper: MemoryMapper,
    session: MappingSession,
    free_space: AtomicU64,
    growth: u64,
    grow_lock: Mutex<()>,
}

impl DataFile {
    /// Open or create the value log at `path`.
    pub fn open(path: &Path, initial_size: u64, growth: u64) -> Result<Self> {
        let (mapper, created) =
            MemoryMapper::open(path, "data", initial_size.max(DATA_HEADER_SIZE))?;
        let mapping = mapper.current()?;
        let len = mapping.len() as u64;
        if len < DATA_HEADER_SIZE {
            return Err(Error::Truncated {
                file: "data",
                len,
                needed: DATA_HEADER_SIZE,
            });
        }

        let free_space = if created {
            mapping.write_u64(OFF_MAGIC, DATA_MAGIC)?;
            mapping.write_u64(OFF_FREE_SPACE, DATA_HEADER_SIZE)?;
            mapping.flush()?;
            DATA_HEADER_SIZE
        } else {
            let magic = mapping.read_u64(OFF_MAGIC)?;
            if magic != DATA_MAGIC {
                return Err(Error::BadMagic {
                    file: "data",
                    found: magic,
                });
            }
            let free = mapping.read_u64(OFF_FREE_SPACE)?;
            if free < DATA_HEADER_SIZE {
                return Err(Error::FormatMismatch {
                    file: "data",
                    field: "free_space_offset",
                    found: free,
                    expected: DATA_HEADER_SIZE,
                });
            }
            if free > len {
                return Err(Error::Truncated {
                    file: "data",
                    len,
                    needed: free,
                });
            }
            free
        };

        info!(path = %path.display(), len, free_space, created, "opened value log");

        let session = mapper.session();
        Ok(DataFile {
            mapper,
            session,
            free_space: AtomicU64::new(free_space),
            growth: growth.max(1),
            grow_lock: Mutex::new(()),
        })
    }

    /// Reserve `size` bytes and return their offset. Grows the file when
    /// the reservation runs past the mapped length.
    pub fn allocate(&self, size: u64) -> Result<u64> {
        let offset = self.free_space.fetch_add(size, Ordering::AcqRel);
        let end = offset + size;
        if end > self.session.mapping()?.len() as u64 {
            self.grow_to(end)?;
        }
        Ok(offset)
    }

    fn grow_to(&self, end: u64) -> Result<()> {
        let _guard = self.grow_lock.lock();
        let len = self.mapper.len()?;
        if end <= len {
            // Another allocation already grew past us.
            return Ok(());
        }
        let target = end.max(len + self.growth);
        let mapping = self.mapper.grow(target)?;
        debug!(end, new_len = mapping.len(), "grew value log");
        Ok(())
    }

    /// Append one entry and return its offset.
    pub fn write(&self, payload: &[u8]) -> Result<u64> {
        self.write_parts(&[payload])
    }

    /// Append one entry whose payload is the concatenation of `parts`.
    pub fn write_parts(&self, parts: &[&[u8]]) -> Result<u64> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let len32 = i32::try_from(len)
            .map_err(|_| Error::Codec(format!("payload of {len} bytes exceeds entry limit")))?
            as u32;

        let offset = self.allocate(LENGTH_PREFIX + len as u64)?;
        let mapping = self.session.mapping()?;
        let mut at = offset + LENGTH_PREFIX;
        for part in parts {
            mapping.write(at, part)?;
            at += part.len() as u64;
        }
        mapping.write_u32(offset, len32)?;
        Ok(offset)
    }

    /// Payload of the entry at `offset`.
    pub fn read(&self, offset: u64) -> Result<ValueView> {
        if offset < DATA_HEADER_SIZE {
            return Err(Error::CorruptEntry { offset });
        }
        let mapping = self.session.mapping()?;
        let len = mapping
            .read_u32(offset)
            .map_err(|_| Error::CorruptEntry { offset })?;
        if len > i32::MAX as u32 {
            return Err(Error::CorruptEntry { offset });
        }
        let start = offset + LENGTH_PREFIX;
        mapping
            .bytes(start, len as usize)
            .map_err(|_| Error::CorruptEntry { offset })?;
        Ok(ValueView {
            mapping,
            start,
            len: len as usize,
        })
    }

    pub fn free_space_offset(&self) -> u64 {
        self.free_space.load(Ordering::Acquire)
    }

    /// Bytes handed out so far, header excluded.
    pub fn used_bytes(&self) -> u64 {
        self.free_space_offset() - DATA_HEADER_SIZE
    }

    pub fn mapped_len(&self) -> Result<u64> {
        self.mapper.len()
    }

    /// Persist the free-space cursor and flush mapped pages.
    pub fn flush(&self) -> Result<()> {
        let mapping = self.mapper.current()?;
        mapping.write_u64(OFF_FREE_SPACE, self.free_space_offset())?;
        mapping.flush()
    }

    /// Flush and release the file. Later calls are no-ops.
    pub fn close(&self) -> Result<()> {
        let mut errors = Vec::new();
        match self.flush() {
            Ok(()) | Err(Error::Disposed) => {}
            Err(e) => errors.push(e),
        }
        if let Err(e) = self.mapper.close() {
            errors.push(e);
        }
        Error::aggregate(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::allocation_granularity;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;
    use tempfile::tempdir;

    #[test]
    fn write_then_read() -> Result<()> {
        let dir = tempdir()?;
        let log = DataFile::open(&dir.path().join("v.data"), 0, 1024)?;

        let a = log.write(b"hello")?;
        let b = log.write(b"")?;
        let c = log.write_parts(&[b"split ", b"payload"])?;

        assert_eq!(a, DATA_HEADER_SIZE);
        assert_eq!(b, a + LENGTH_PREFIX + 5);
        assert_eq!(&*log.read(a)?, b"hello");
        assert!(log.read(b)?.is_empty());
        assert_eq!(&*log.read(c)?, b"split payload");
        assert_eq!(log.used_bytes(), 3 * LENGTH_PREFIX + 5 + 13);
        Ok(())
    }

    #[test]
    fn grows_past_initial_mapping() -> Result<()> {
        let dir = tempdir()?;
        let granularity = allocation_granularity();
        let log = DataFile::open(&dir.path().join("v.data"), 0, 1)?;
        assert_eq!(log.mapped_len()?, granularity);

        let first = log.write(b"first")?;
        let early = log.read(first)?;

        let big = vec![7u8; granularity as usize];
        let offset = log.write(&big)?;
        assert!(log.mapped_len()? >= offset + LENGTH_PREFIX + granularity);
        assert_eq!(log.read(offset)?.len(), big.len());

        // A view taken before the growth still reads its entry.
        assert_eq!(&*early, b"first");
        Ok(())
    }

    #[test]
    fn concurrent_writers_get_disjoint_entries() -> Result<()> {
        let dir = tempdir()?;
        let log = DataFile::open(&dir.path().join("v.data"), 0, 4096)?;
        let threads = 8;
        let per_thread = 500;
        let barrier = Barrier::new(threads);

        let offsets: Vec<Vec<(u64, Vec<u8>)>> = thread::scope(|s| {
            let handles: Vec<_> = (0..threads)
                .map(|t| {
                    let log = &log;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        (0..per_thread)
                            .map(|i| {
                                let payload = format!("t{t}-i{i}").into_bytes();
                                (log.write(&payload).unwrap(), payload)
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut seen = HashSet::new();
        for (offset, payload) in offsets.iter().flatten() {
            assert!(seen.insert(*offset));
            assert_eq!(&*log.read(*offset)?, payload.as_slice());
        }
        assert_eq!(seen.len(), threads * per_thread);
        Ok(())
    }

    #[test]
    fn readers_follow_growth_while_writers_append() -> Result<()> {
        let dir = tempdir()?;
        let granularity = allocation_granularity();
        let log = DataFile::open(&dir.path().join("v.data"), 0, 1)?;
        let published = parking_lot::Mutex::new(Vec::<(u64, Vec<u8>)>::new());
        let threads = 4;
        let per_thread = 300;
        let barrier = Barrier::new(threads);

        thread::scope(|s| {
            for t in 0..threads {
                let (log, published, barrier) = (&log, &published, &barrier);
                s.spawn(move || {
                    barrier.wait();
                    for i in 0..per_thread {
                        let payload = vec![(t * per_thread + i) as u8; 512 + (i % 7) * 100];
                        let offset = log.write(&payload).unwrap();
                        assert_eq!(&*log.read(offset).unwrap(), payload.as_slice());
                        published.lock().push((offset, payload));

                        // Entries other writers placed in earlier generations.
                        let sample: Vec<(u64, Vec<u8>)> =
                            published.lock().iter().rev().step_by(13).take(4).cloned().collect();
                        for (offset, payload) in sample {
                            assert_eq!(&*log.read(offset).unwrap(), payload.as_slice());
                        }
                    }
                });
            }
        });

        let published = published.into_inner();
        assert_eq!(published.len(), threads * per_thread);
        assert!(log.mapped_len()? > 8 * granularity);
        for (offset, payload) in &published {
            assert_eq!(&*log.read(*offset)?, payload.as_slice());
        }
        Ok(())
    }

    #[test]
    fn reopen_restores_cursor() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("v.data");
        let offset = {
            let log = DataFile::open(&path, 0, 1024)?;
            let offset = log.write(b"persisted")?;
            log.close()?;
            log.close()?;
            offset
        };

        let log = DataFile::open(&path, 0, 1024)?;
        assert_eq!(&*log.read(offset)?, b"persisted");
        let next = log.write(b"next")?;
        assert_eq!(next, offset + LENGTH_PREFIX + 9);
        Ok(())
    }

    #[test]
    fn rejects_foreign_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("v.data");
        std::fs::write(&path, vec![0xabu8; 128])?;

        match DataFile::open(&path, 0, 1024) {
            Err(e @ Error::BadMagic { .. }) => assert!(e.is_format()),
            Err(e) => panic!("unexpected error {e}"),
            Ok(_) => panic!("opened a foreign file"),
        }
        Ok(())
    }

    #[test]
    fn bad_offsets_are_corrupt_entries() -> Result<()> {
        let dir = tempdir()?;
        let log = DataFile::open(&dir.path().join("v.data"), 0, 1024)?;
        log.write(b"x")?;

        assert!(matches!(log.read(3), Err(Error::CorruptEntry { offset: 3 })));
        assert!(matches!(
            log.read(u64::MAX - 2),
            Err(Error::CorruptEntry { .. })
        ));
        Ok(())
    }
}
