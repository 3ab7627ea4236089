//! Slot record access over one mapping generation.

use crate::error::Result;
use crate::mapping::MemoryMapping;

use super::layout::{RecordLayout, HEADER_SIZE};

/// Bounds-checked record reads and writes for one operation.
///
/// Writers must hold the chunk lock that owns a slot before writing it.
pub(crate) struct SlotView<'m> {
    mapping: &'m MemoryMapping,
    layout: RecordLayout,
    record_size: u64,
}

impl<'m> SlotView<'m> {
    pub fn new(mapping: &'m MemoryMapping, layout: RecordLayout) -> Self {
        SlotView {
            mapping,
            layout,
            record_size: layout.record_size() as u64,
        }
    }

    #[inline]
    pub fn layout(&self) -> &RecordLayout {
        &self.layout
    }

    /// A zeroed buffer sized for one record.
    pub fn record_buf(&self) -> Vec<u8> {
        vec![0u8; self.record_size as usize]
    }

    #[inline]
    fn offset(&self, slot: u64) -> u64 {
        HEADER_SIZE + slot * self.record_size
    }

    /// Copy the record at `slot` into `buf`.
    #[inline]
    pub fn read(&self, slot: u64, buf: &mut [u8]) -> Result<()> {
        self.mapping.read_into(self.offset(slot), buf)
    }

    #[inline]
    pub fn distance(&self, slot: u64) -> Result<u16> {
        let mut raw = [0u8; 2];
        let at = self.offset(slot) + self.record_size - 2;
        self.mapping.read_into(at, &mut raw)?;
        Ok(u16::from_le_bytes(raw))
    }

    #[inline]
    pub fn write(&self, slot: u64, record: &[u8]) -> Result<()> {
        debug_assert_eq!(record.len() as u64, self.record_size);
        self.mapping.write(self.offset(slot), record)
    }

    /// Overwrite only the value part of the record at `slot`.
    pub fn write_value(&self, slot: u64, value: &[u8]) -> Result<()> {
        debug_assert_eq!(value.len(), self.layout.value_width);
        let at = self.offset(slot) + self.layout.key_width as u64;
        self.mapping.write(at, value)
    }

    pub fn clear(&self, slot: u64) -> Result<()> {
        self.clear_range(slot, 1)
    }

    /// Zero `count` consecutive slots starting at `first`. Never wraps.
    pub fn clear_range(&self, first: u64, count: u64) -> Result<()> {
        let len = (count * self.record_size) as usize;
        self.mapping.fill(self.offset(first), len, 0)
    }
}
