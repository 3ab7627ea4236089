//! Typed key/value store over a [`RawTable`] and its value log.
//!
//! The record shape is fixed by the codecs: fixed-width keys and values
//! live inline, a variable value is appended to the value log and the
//! record keeps its offset, and a variable key is replaced in the record
//! by its hash with `[key_len: u32][key][value]` in the log.

use std::ffi::OsString;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::codec::Codec;
use crate::config::StoreOptions;
use crate::data_file::DataFile;
use crate::error::{Error, Result};
use crate::hash::{HashFunction, XxHash};
use crate::table::layout::{RecordLayout, RecordShape};
use crate::table::{Action, RawTable, StatsSnapshot};

/// Statistics of a store: the slot table plus value log usage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StoreStats {
    pub table: StatsSnapshot,
    /// Bytes appended to the value log, including entries no longer
    /// referenced.
    pub log_bytes: u64,
}

struct EncodedKey {
    bytes: Vec<u8>,
    hash: u64,
}

/// A persistent, concurrent hash map from `K` to `V` backed by a
/// memory-mapped Robin Hood table.
///
/// Every method takes `&self`; share the store between threads by
/// reference or behind an `Arc`.
pub struct Store<K, V, H = XxHash> {
    table: RawTable,
    data: Option<DataFile>,
    hasher: H,
    _marker: PhantomData<fn() -> (K, V)>,
}

/// Value log path for a table file: `<table path>.data`.
pub fn data_file_path(table_path: &Path) -> PathBuf {
    let mut os: OsString = table_path.as_os_str().to_owned();
    os.push(".data");
    PathBuf::from(os)
}

impl<K: Codec, V: Codec> Store<K, V, XxHash> {
    /// Open or create a store at `path` hashing keys with XXH3.
    pub fn open(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::open_with_hasher(path, options, XxHash)
    }
}

impl<K: Codec, V: Codec, H: HashFunction> Store<K, V, H> {
    /// Open or create a store at `path` with a custom hash function. A file
    /// must always be reopened with the hash function that wrote it.
    pub fn open_with_hasher(path: impl AsRef<Path>, options: StoreOptions, hasher: H) -> Result<Self> {
        let path = path.as_ref();
        let layout = RecordLayout::select(K::FIXED_WIDTH, V::FIXED_WIDTH);
        let table = RawTable::open(path, layout, &options)?;
        let data = if layout.shape.uses_data_file() {
            Some(DataFile::open(
                &data_file_path(path),
                options.data_file_initial_size,
                options.data_file_growth,
            )?)
        } else {
            None
        };
        Ok(Store {
            table,
            data,
            hasher,
            _marker: PhantomData,
        })
    }

    fn layout(&self) -> RecordLayout {
        *self.table.layout()
    }

    fn encode_key(&self, key: &K) -> EncodedKey {
        let bytes = key.encode();
        let hash = self.hasher.hash(&bytes);
        EncodedKey { bytes, hash }
    }

    fn log(&self) -> Result<&DataFile> {
        self.data
            .as_ref()
            .ok_or_else(|| Error::Codec("record shape keeps no value log".into()))
    }

    /// Key bytes and value bytes of the hashed-shape log entry at `offset`.
    fn read_hashed(&self, offset: u64) -> Result<(Vec<u8>, Vec<u8>)> {
        let entry = self.log()?.read(offset)?;
        let (key, value) = split_hashed(offset, &entry)?;
        Ok((key.to_vec(), value.to_vec()))
    }

    fn matcher<'a>(&'a self, key: &'a EncodedKey) -> impl FnMut(&[u8]) -> Result<bool> + 'a {
        let layout = self.layout();
        move |record: &[u8]| match layout.shape {
            RecordShape::Inline | RecordShape::KeyInline => Ok(layout.key(record) == key.bytes),
            RecordShape::Hashed => {
                if layout.key_hash(record) != key.hash {
                    return Ok(false);
                }
                let offset = layout.value_offset(record);
                let entry = self.log()?.read(offset)?;
                let (stored, _) = split_hashed(offset, &entry)?;
                Ok(stored == key.bytes.as_slice())
            }
        }
    }

    /// Encoded value held by `record`.
    fn value_bytes(&self, record: &[u8]) -> Result<Vec<u8>> {
        let layout = self.layout();
        match layout.shape {
            RecordShape::Inline => Ok(layout.value(record).to_vec()),
            RecordShape::KeyInline => {
                let offset = layout.value_offset(record);
                Ok(self.log()?.read(offset)?.to_vec())
            }
            RecordShape::Hashed => Ok(self.read_hashed(layout.value_offset(record))?.1),
        }
    }

    fn decode_value(&self, record: &[u8]) -> Result<V> {
        V::decode(&self.value_bytes(record)?)
    }

    fn decode_entry(&self, record: &[u8]) -> Result<(K, V)> {
        let layout = self.layout();
        match layout.shape {
            RecordShape::Hashed => {
                let (key, value) = self.read_hashed(layout.value_offset(record))?;
                Ok((K::decode(&key)?, V::decode(&value)?))
            }
            _ => Ok((K::decode(layout.key(record))?, self.decode_value(record)?)),
        }
    }

    fn decode_key(&self, record: &[u8]) -> Result<K> {
        let layout = self.layout();
        match layout.shape {
            RecordShape::Hashed => K::decode(&self.read_hashed(layout.value_offset(record))?.0),
            _ => K::decode(layout.key(record)),
        }
    }

    /// The value part a record needs to hold `value`, appending to the
    /// value log when the shape keeps values there.
    fn value_part(&self, key: &EncodedKey, value: &[u8]) -> Result<Vec<u8>> {
        match self.layout().shape {
            RecordShape::Inline => Ok(value.to_vec()),
            RecordShape::KeyInline => {
                let offset = self.log()?.write(value)?;
                Ok(offset.to_le_bytes().to_vec())
            }
            RecordShape::Hashed => {
                let key_len = (key.bytes.len() as u32).to_le_bytes();
                let offset = self.log()?.write_parts(&[&key_len, &key.bytes, value])?;
                Ok(offset.to_le_bytes().to_vec())
            }
        }
    }

    fn new_record(&self, key: &EncodedKey, value: &[u8]) -> Result<Vec<u8>> {
        let layout = self.layout();
        let value_part = self.value_part(key, value)?;
        Ok(match layout.shape {
            RecordShape::Hashed => layout.build(&key.hash.to_le_bytes(), &value_part),
            _ => layout.build(&key.bytes, &value_part),
        })
    }

    pub fn try_get(&self, key: &K) -> Result<Option<V>> {
        let key = self.encode_key(key);
        match self.table.get(key.hash, self.matcher(&key))? {
            Some(record) => Ok(Some(self.decode_value(&record)?)),
            None => Ok(None),
        }
    }

    /// Like [`try_get`](Self::try_get), but a missing key is an error.
    pub fn get(&self, key: &K) -> Result<V> {
        self.try_get(key)?.ok_or(Error::KeyNotFound)
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        let key = self.encode_key(key);
        Ok(self.table.get(key.hash, self.matcher(&key))?.is_some())
    }

    /// Insert a new key. Fails with [`Error::KeyExists`] if it is present.
    pub fn add(&self, key: &K, value: &V) -> Result<()> {
        if self.try_add(key, value)? {
            Ok(())
        } else {
            Err(Error::KeyExists)
        }
    }

    /// Insert a new key; `false` if it was already present.
    pub fn try_add(&self, key: &K, value: &V) -> Result<bool> {
        self.try_add_encoded(key, || value.encode())
    }

    /// Insert a new key with a value built by `factory`. The factory runs
    /// only when the key is absent, at most once, while the key's chunks
    /// are locked.
    pub fn try_add_with<F>(&self, key: &K, factory: F) -> Result<bool>
    where
        F: FnOnce() -> V,
    {
        self.try_add_encoded(key, || factory().encode())
    }

    fn try_add_encoded<F>(&self, key: &K, encode: F) -> Result<bool>
    where
        F: FnOnce() -> Vec<u8>,
    {
        let key = self.encode_key(key);
        self.table
            .write(key.hash, self.matcher(&key), |existing| match existing {
                Some(_) => Ok((Action::Keep, false)),
                None => {
                    let record = self.new_record(&key, &encode())?;
                    Ok((Action::Insert(record), true))
                }
            })
    }

    /// Insert or overwrite.
    pub fn put(&self, key: &K, value: &V) -> Result<()> {
        let key = self.encode_key(key);
        let value = value.encode();
        self.table
            .write(key.hash, self.matcher(&key), |existing| match existing {
                Some(_) => Ok((Action::Replace(self.value_part(&key, &value)?), ())),
                None => Ok((Action::Insert(self.new_record(&key, &value)?), ())),
            })
    }

    /// Replace the value of `key` with `new_value` if its current value
    /// equals `comparison`.
    pub fn try_update(&self, key: &K, new_value: &V, comparison: &V) -> Result<bool> {
        let key = self.encode_key(key);
        let expected = comparison.encode();
        self.table
            .write(key.hash, self.matcher(&key), |existing| {
                let Some(record) = existing else {
                    return Ok((Action::Keep, false));
                };
                if self.value_bytes(record)? != expected {
                    return Ok((Action::Keep, false));
                }
                let part = self.value_part(&key, &new_value.encode())?;
                Ok((Action::Replace(part), true))
            })
    }

    /// Insert `add_value`, or replace the current value with
    /// `update(current)`. Returns the value now stored.
    pub fn add_or_update<U>(&self, key: &K, add_value: V, update: U) -> Result<V>
    where
        U: FnOnce(&V) -> V,
    {
        self.add_or_update_with(key, || add_value, update)
    }

    /// Like [`add_or_update`](Self::add_or_update) with a lazily built
    /// value to add. Exactly one of `add` and `update` runs.
    pub fn add_or_update_with<A, U>(&self, key: &K, add: A, update: U) -> Result<V>
    where
        A: FnOnce() -> V,
        U: FnOnce(&V) -> V,
    {
        let key = self.encode_key(key);
        self.table
            .write(key.hash, self.matcher(&key), |existing| match existing {
                Some(record) => {
                    let value = update(&self.decode_value(record)?);
                    let part = self.value_part(&key, &value.encode())?;
                    Ok((Action::Replace(part), value))
                }
                None => {
                    let value = add();
                    let record = self.new_record(&key, &value.encode())?;
                    Ok((Action::Insert(record), value))
                }
            })
    }

    /// The current value of `key`, inserting `value` first if absent.
    pub fn get_or_add(&self, key: &K, value: V) -> Result<V> {
        self.get_or_add_with(key, || value)
    }

    /// The current value of `key`, inserting `factory()` first if absent.
    /// Concurrent callers racing on a new key all observe the single value
    /// that was added, and the factory runs once.
    pub fn get_or_add_with<F>(&self, key: &K, factory: F) -> Result<V>
    where
        F: FnOnce() -> V,
    {
        if let Some(value) = self.try_get(key)? {
            return Ok(value);
        }
        let key = self.encode_key(key);
        self.table
            .write(key.hash, self.matcher(&key), |existing| match existing {
                Some(record) => Ok((Action::Keep, self.decode_value(record)?)),
                None => {
                    let value = factory();
                    let record = self.new_record(&key, &value.encode())?;
                    Ok((Action::Insert(record), value))
                }
            })
    }

    /// Remove `key`, returning its value if it was present.
    pub fn try_remove(&self, key: &K) -> Result<Option<V>> {
        let key = self.encode_key(key);
        self.table
            .write(key.hash, self.matcher(&key), |existing| match existing {
                Some(record) => Ok((Action::Remove, Some(self.decode_value(record)?))),
                None => Ok((Action::Keep, None)),
            })
    }

    /// Remove `key`. Fails with [`Error::KeyNotFound`] if it is absent.
    pub fn remove(&self, key: &K) -> Result<V> {
        self.try_remove(key)?.ok_or(Error::KeyNotFound)
    }

    /// Every record, chunk by chunk in slot order.
    ///
    /// Records come out grouped by ideal slot, in increasing order, except
    /// that a cluster wrapping past the last slot yields its wrapped
    /// records first, ahead of the records of slot 0.
    ///
    /// Each chunk is copied under its lock; the iteration as a whole is not
    /// a snapshot when writers run concurrently.
    pub fn iter(&self) -> impl Iterator<Item = Result<(K, V)>> + '_ {
        Records::new(&self.table).map(move |record| record.and_then(|r| self.decode_entry(&r)))
    }

    /// Every key, in the order of [`iter`](Self::iter).
    pub fn keys(&self) -> impl Iterator<Item = Result<K>> + '_ {
        Records::new(&self.table).map(move |record| record.and_then(|r| self.decode_key(&r)))
    }
}

impl<K, V, H> Store<K, V, H> {
    pub fn path(&self) -> &Path {
        self.table.path()
    }

    pub fn len(&self) -> u64 {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Records the table accepts before crossing its load ceiling.
    pub fn capacity(&self) -> u64 {
        self.table.geometry().capacity()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            table: self.table.stats(),
            log_bytes: self.data.as_ref().map_or(0, DataFile::used_bytes),
        }
    }

    /// Remove every record. Value log space is not reclaimed.
    pub fn clear(&self) -> Result<()> {
        self.table.clear()
    }

    /// Persist header statistics and force mapped pages to disk.
    pub fn flush(&self) -> Result<()> {
        self.table.flush()?;
        if let Some(data) = &self.data {
            data.flush()?;
        }
        Ok(())
    }

    /// Flush and release both files. Later calls are no-ops; every release
    /// failure is reported.
    pub fn dispose(&self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.table.dispose() {
            errors.push(e);
        }
        if let Some(data) = &self.data {
            if let Err(e) = data.close() {
                errors.push(e);
            }
        }
        Error::aggregate(errors)
    }

    pub fn is_disposed(&self) -> bool {
        self.table.is_disposed()
    }
}

impl<K, V, H> Drop for Store<K, V, H> {
    fn drop(&mut self) {
        if self.table.is_disposed() {
            return;
        }
        if let Err(e) = self.dispose() {
            warn!(path = %self.table.path().display(), error = %e, "dispose on drop failed");
        }
    }
}

/// Split a hashed-shape log entry into key and value bytes.
fn split_hashed(offset: u64, entry: &[u8]) -> Result<(&[u8], &[u8])> {
    if entry.len() < 4 {
        return Err(Error::CorruptEntry { offset });
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&entry[..4]);
    let key_len = u32::from_le_bytes(raw) as usize;
    let rest = &entry[4..];
    if key_len > rest.len() {
        return Err(Error::CorruptEntry { offset });
    }
    Ok(rest.split_at(key_len))
}

/// Raw records of a table, one chunk at a time.
struct Records<'a> {
    table: &'a RawTable,
    next_chunk: u64,
    pending: std::vec::IntoIter<Vec<u8>>,
}

impl<'a> Records<'a> {
    fn new(table: &'a RawTable) -> Self {
        Records {
            table,
            next_chunk: 0,
            pending: Vec::new().into_iter(),
        }
    }
}

impl Iterator for Records<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        let chunk_count = self.table.geometry().chunk_count;
        loop {
            if let Some(record) = self.pending.next() {
                return Some(Ok(record));
            }
            if self.next_chunk >= chunk_count {
                return None;
            }
            let mut records = Vec::new();
            let scanned = self.table.scan_chunk(self.next_chunk, &mut records);
            self.next_chunk += 1;
            if let Err(e) = scanned {
                self.next_chunk = chunk_count;
                return Some(Err(e));
            }
            self.pending = records.into_iter();
        }
    }
}
