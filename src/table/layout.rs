/// `#[repr(C)]` header and slot record layout of the table file.
///
/// The file is a 64-byte header followed by `slot_count` fixed-size
/// records. A record is `[key part][value part][distance: u16]`, all
/// little-endian. `distance == 0` marks an empty slot; `distance == d`
/// puts the record `d - 1` slots past its ideal slot.
use std::mem;
use std::ops::Range;

/// Magic number at the start of every table file.
pub const TABLE_MAGIC: u64 = u64::from_le_bytes(*b"RBTABLE1");

/// Size of the fixed header at the start of the file.
pub const HEADER_SIZE: u64 = 64;

/// Width of the distance field that closes every record.
pub const DISTANCE_WIDTH: usize = 2;

/// Width of a key hash or a value log offset stored in a record.
pub const REFERENCE_WIDTH: usize = 8;

/// Header at offset 0 of the table file.
///
/// Fields are ordered u64-first to avoid implicit alignment padding
/// in `#[repr(C)]`.
#[repr(C)]
#[derive(Debug)]
pub struct TableHeader {
    // 8-byte aligned group
    pub magic: u64,        // 0..8
    pub slot_count: u64,   // 8..16
    pub record_count: u64, // 16..24
    pub distance_sum: u64, // 24..32

    // 4-byte aligned group
    pub record_size: u32,  // 32..36
    pub max_distance: u32, // 36..40
    pub chunk_size: u32,   // 40..44
    pub shape: u32,        // 44..48
    pub key_width: u32,    // 48..52
    pub value_width: u32,  // 52..56

    pub _pad: [u8; 8],
}

const _: () = assert!(mem::size_of::<TableHeader>() == HEADER_SIZE as usize);

pub const OFF_MAGIC: u64 = mem::offset_of!(TableHeader, magic) as u64;
pub const OFF_SLOT_COUNT: u64 = mem::offset_of!(TableHeader, slot_count) as u64;
pub const OFF_RECORD_COUNT: u64 = mem::offset_of!(TableHeader, record_count) as u64;
pub const OFF_DISTANCE_SUM: u64 = mem::offset_of!(TableHeader, distance_sum) as u64;
pub const OFF_RECORD_SIZE: u64 = mem::offset_of!(TableHeader, record_size) as u64;
pub const OFF_MAX_DISTANCE: u64 = mem::offset_of!(TableHeader, max_distance) as u64;
pub const OFF_CHUNK_SIZE: u64 = mem::offset_of!(TableHeader, chunk_size) as u64;
pub const OFF_SHAPE: u64 = mem::offset_of!(TableHeader, shape) as u64;
pub const OFF_KEY_WIDTH: u64 = mem::offset_of!(TableHeader, key_width) as u64;
pub const OFF_VALUE_WIDTH: u64 = mem::offset_of!(TableHeader, value_width) as u64;

/// Which parts of a record hold data inline.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    /// Fixed-size key and value, both inline.
    Inline = 1,
    /// Fixed-size key inline; value in the value log, referenced by offset.
    KeyInline = 2,
    /// 64-bit key hash inline; key and value together in the value log.
    Hashed = 3,
}

impl RecordShape {
    pub fn from_u32(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(RecordShape::Inline),
            2 => Some(RecordShape::KeyInline),
            3 => Some(RecordShape::Hashed),
            _ => None,
        }
    }

    pub fn uses_data_file(self) -> bool {
        self != RecordShape::Inline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub shape: RecordShape,
    pub key_width: usize,
    pub value_width: usize,
}

impl RecordLayout {
    /// Pick the record shape for codecs with the given fixed widths.
    pub fn select(key_width: Option<usize>, value_width: Option<usize>) -> Self {
        match (key_width, value_width) {
            (Some(key_width), Some(value_width)) => RecordLayout {
                shape: RecordShape::Inline,
                key_width,
                value_width,
            },
            (Some(key_width), None) => RecordLayout {
                shape: RecordShape::KeyInline,
                key_width,
                value_width: REFERENCE_WIDTH,
            },
            (None, _) => RecordLayout {
                shape: RecordShape::Hashed,
                key_width: REFERENCE_WIDTH,
                value_width: REFERENCE_WIDTH,
            },
        }
    }

    #[inline]
    pub fn record_size(&self) -> usize {
        self.key_width + self.value_width + DISTANCE_WIDTH
    }

    #[inline]
    pub fn key_range(&self) -> Range<usize> {
        0..self.key_width
    }

    #[inline]
    pub fn value_range(&self) -> Range<usize> {
        self.key_width..self.key_width + self.value_width
    }

    #[inline]
    fn distance_range(&self) -> Range<usize> {
        let start = self.key_width + self.value_width;
        start..start + DISTANCE_WIDTH
    }

    #[inline]
    pub fn key<'r>(&self, record: &'r [u8]) -> &'r [u8] {
        &record[self.key_range()]
    }

    #[inline]
    pub fn value<'r>(&self, record: &'r [u8]) -> &'r [u8] {
        &record[self.value_range()]
    }

    #[inline]
    pub fn distance(&self, record: &[u8]) -> u16 {
        let r = self.distance_range();
        u16::from_le_bytes([record[r.start], record[r.start + 1]])
    }

    #[inline]
    pub fn set_distance(&self, record: &mut [u8], distance: u16) {
        record[self.distance_range()].copy_from_slice(&distance.to_le_bytes());
    }

    /// Value part read as a value log offset.
    #[inline]
    pub fn value_offset(&self, record: &[u8]) -> u64 {
        read_reference(self.value(record))
    }

    /// Key part read as a 64-bit hash.
    #[inline]
    pub fn key_hash(&self, record: &[u8]) -> u64 {
        read_reference(self.key(record))
    }

    /// A fresh record holding `key` and `value`, distance unset.
    pub fn build(&self, key: &[u8], value: &[u8]) -> Vec<u8> {
        debug_assert_eq!(key.len(), self.key_width);
        debug_assert_eq!(value.len(), self.value_width);
        let mut record = vec![0u8; self.record_size()];
        record[self.key_range()].copy_from_slice(key);
        record[self.value_range()].copy_from_slice(value);
        record
    }

    /// Bytes a table file with `slot_count` slots needs.
    pub fn file_len(&self, slot_count: u64) -> u64 {
        HEADER_SIZE.saturating_add(slot_count.saturating_mul(self.record_size() as u64))
    }
}

fn read_reference(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; REFERENCE_WIDTH];
    let n = bytes.len().min(REFERENCE_WIDTH);
    raw[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(raw)
}
