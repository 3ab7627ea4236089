//! Robin Hood probing, insertion and backward-shift deletion.
//!
//! All functions run under an [`OperationContext`] and take each chunk
//! lock before touching a slot in it. A probe visits slots in increasing
//! circular order starting at the key's ideal slot, with its own distance
//! starting at 1.

use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::config::TableGeometry;
use crate::error::{Error, Result};

use super::lock::OperationContext;
use super::slots::SlotView;

/// Live table statistics, mirrored into the header on flush.
#[derive(Debug, Default)]
pub(crate) struct TableStats {
    pub record_count: AtomicU64,
    pub distance_sum: AtomicI64,
    pub max_distance: AtomicU32,
}

impl TableStats {
    pub fn new(record_count: u64, distance_sum: u64, max_distance: u32) -> Self {
        TableStats {
            record_count: AtomicU64::new(record_count),
            distance_sum: AtomicI64::new(distance_sum as i64),
            max_distance: AtomicU32::new(max_distance),
        }
    }

    pub fn reset(&self) {
        self.record_count.store(0, Ordering::Release);
        self.distance_sum.store(0, Ordering::Release);
        self.max_distance.store(0, Ordering::Release);
    }

    fn placed(&self, distance_delta: i64, max_distance: u16) {
        self.record_count.fetch_add(1, Ordering::AcqRel);
        self.distance_sum.fetch_add(distance_delta, Ordering::AcqRel);
        self.max_distance
            .fetch_max(u32::from(max_distance), Ordering::AcqRel);
    }

    fn removed(&self, distance_delta: i64) {
        self.record_count.fetch_sub(1, Ordering::AcqRel);
        self.distance_sum.fetch_sub(distance_delta, Ordering::AcqRel);
    }
}

/// Where a probe for a key ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Probe {
    /// The key's record sits at `slot`.
    Found { slot: u64 },
    /// The key is absent; an insert would start displacing at `slot` with
    /// the given probe distance.
    Vacant { slot: u64, distance: u16 },
}

/// Probe for a key. `matches` sees every record whose distance equals the
/// probe distance at that slot, i.e. every record sharing the key's ideal
/// slot; on `Found` the matching record is left in `record`.
pub(crate) fn locate<M>(
    view: &SlotView<'_>,
    ctx: &mut OperationContext<'_>,
    geometry: &TableGeometry,
    record: &mut [u8],
    mut matches: M,
) -> Result<Probe>
where
    M: FnMut(&[u8]) -> Result<bool>,
{
    let layout = *view.layout();
    let mut slot = ctx.initial_slot;
    let mut distance: u16 = 1;
    loop {
        if u32::from(distance) > geometry.max_allowed_distance {
            return Ok(Probe::Vacant { slot, distance });
        }
        ctx.enter(slot)?;
        view.read(slot, record)?;
        let occupant = layout.distance(record);
        // An empty slot, or a richer occupant, ends the cluster our key
        // could live in.
        if occupant == 0 || occupant < distance {
            return Ok(Probe::Vacant { slot, distance });
        }
        if occupant == distance && matches(record)? {
            return Ok(Probe::Found { slot });
        }
        distance += 1;
        slot = geometry.next_slot(slot);
    }
}

/// Hold every chunk from the vacancy `locate` returned up to the empty slot
/// that ends its cluster. `false` when the chain needs more chunks than a
/// bounded context may hold; the table is never written.
pub(crate) fn reserve(
    view: &SlotView<'_>,
    ctx: &mut OperationContext<'_>,
    geometry: &TableGeometry,
    start: u64,
) -> Result<bool> {
    let mut slot = start;
    for _ in 0..geometry.slot_count {
        if !ctx.try_enter(slot) {
            return Ok(false);
        }
        if view.distance(slot)? == 0 {
            break;
        }
        slot = geometry.next_slot(slot);
    }
    Ok(true)
}

/// Place `incoming` at the vacancy `locate` returned, displacing richer
/// records down the cluster.
///
/// The whole displacement chain is checked against the distance limit and
/// the lock budget before the first slot is written, so a failed insert
/// leaves the table untouched.
pub(crate) fn insert(
    view: &SlotView<'_>,
    ctx: &mut OperationContext<'_>,
    geometry: &TableGeometry,
    stats: &TableStats,
    start: u64,
    distance: u16,
    incoming: &mut Vec<u8>,
) -> Result<()> {
    let layout = *view.layout();
    let max = geometry.max_allowed_distance;

    let mut slot = start;
    let mut carried = distance;
    let mut steps = 0;
    loop {
        // A full table has no empty slot to end the chain.
        if u32::from(carried) > max || steps == geometry.slot_count {
            return Err(Error::MaxDistanceExceeded { max });
        }
        ctx.enter(slot)?;
        let occupant = view.distance(slot)?;
        if occupant == 0 {
            break;
        }
        if occupant < carried {
            carried = occupant;
        }
        carried += 1;
        steps += 1;
        slot = geometry.next_slot(slot);
    }

    let mut displaced = view.record_buf();
    let mut slot = start;
    let mut carried = distance;
    let mut delta = 0i64;
    let mut farthest = 0u16;
    loop {
        // Still held unless an unbounded context slid past it.
        ctx.enter(slot)?;
        let occupant = view.distance(slot)?;
        if occupant == 0 || occupant < carried {
            if occupant != 0 {
                view.read(slot, &mut displaced)?;
            }
            layout.set_distance(incoming, carried);
            view.write(slot, incoming)?;
            delta += i64::from(carried) - i64::from(occupant);
            farthest = farthest.max(carried);
            if occupant == 0 {
                break;
            }
            std::mem::swap(incoming, &mut displaced);
            carried = occupant;
        }
        carried += 1;
        slot = geometry.next_slot(slot);
    }

    stats.placed(delta, farthest);
    Ok(())
}

/// Remove the record at `slot` and shift its successors back by one until
/// a record at its ideal slot, or an empty slot, ends the cluster.
pub(crate) fn remove(
    view: &SlotView<'_>,
    ctx: &mut OperationContext<'_>,
    geometry: &TableGeometry,
    stats: &TableStats,
    slot: u64,
) -> Result<()> {
    let layout = *view.layout();
    let removed = view.distance(slot)?;
    let mut record = view.record_buf();
    let mut gap = slot;
    let mut shifted = 0i64;

    for _ in 1..geometry.slot_count {
        let next = geometry.next_slot(gap);
        ctx.enter_sliding(next)?;
        view.read(next, &mut record)?;
        let distance = layout.distance(&record);
        if distance <= 1 {
            break;
        }
        layout.set_distance(&mut record, distance - 1);
        view.write(gap, &record)?;
        shifted += 1;
        gap = next;
    }
    view.clear(gap)?;

    stats.removed(i64::from(removed) + shifted);
    Ok(())
}
