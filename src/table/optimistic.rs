//! Lock-free lookups validated against chunk versions.
//!
//! The walk mirrors [`locate`](super::engine::locate) but copies records
//! out without taking any chunk lock. Every chunk it enters is sampled
//! first; after the walk an acquire fence orders the copies before the
//! re-check of every sampled chunk. If any writer entered one of them the
//! copies may be torn and the walk is repeated.

use std::sync::atomic::{self, Ordering};

use crate::config::{TableGeometry, MAX_LOCKS_PER_OPERATION};
use crate::error::Result;

use super::lock::{Backoff, ChunkLocks};
use super::slots::SlotView;

pub(crate) enum Optimistic {
    Hit(Vec<u8>),
    Miss,
    /// Validation kept failing; retry on the locking path.
    Contended,
}

enum Walk {
    Hit,
    Miss,
    /// A writer was inside a chunk when we reached it.
    Busy,
    /// The walk crossed more chunks than a locked probe could hold.
    Overflow,
}

pub(crate) fn read<M>(
    view: &SlotView<'_>,
    locks: &ChunkLocks,
    geometry: &TableGeometry,
    initial_slot: u64,
    max_retries: u32,
    mut matches: M,
) -> Result<Optimistic>
where
    M: FnMut(&[u8]) -> Result<bool>,
{
    let layout = *view.layout();
    let mut record = view.record_buf();
    let mut sampled = [(0usize, 0u32); MAX_LOCKS_PER_OPERATION + 1];
    let mut backoff = Backoff::default();

    for attempt in 0..=max_retries {
        if attempt > 0 {
            backoff.snooze();
        }

        let mut sampled_len = 0;
        let mut slot = initial_slot;
        let mut distance: u16 = 1;
        let outcome: Result<Walk> = loop {
            if u32::from(distance) > geometry.max_allowed_distance {
                break Ok(Walk::Miss);
            }
            let chunk = geometry.chunk_of(slot);
            if sampled_len == 0 || sampled[sampled_len - 1].0 != chunk {
                if sampled_len == sampled.len() {
                    break Ok(Walk::Overflow);
                }
                match locks.get(chunk).read_begin() {
                    Some(version) => {
                        sampled[sampled_len] = (chunk, version);
                        sampled_len += 1;
                    }
                    None => break Ok(Walk::Busy),
                }
            }
            if let Err(e) = view.read(slot, &mut record) {
                break Err(e);
            }
            let occupant = layout.distance(&record);
            if occupant == 0 || occupant < distance {
                break Ok(Walk::Miss);
            }
            if occupant == distance {
                match matches(&record) {
                    Ok(true) => break Ok(Walk::Hit),
                    Ok(false) => {}
                    Err(e) => break Err(e),
                }
            }
            distance += 1;
            slot = geometry.next_slot(slot);
        };

        if matches!(outcome, Ok(Walk::Overflow)) {
            return Ok(Optimistic::Contended);
        }
        if matches!(outcome, Ok(Walk::Busy)) {
            continue;
        }

        atomic::fence(Ordering::Acquire);
        let valid = sampled[..sampled_len]
            .iter()
            .all(|&(chunk, version)| locks.get(chunk).read_validate(version));
        if !valid {
            continue;
        }

        // Errors from a torn copy are discarded above; these came from a
        // consistent snapshot.
        return match outcome? {
            Walk::Hit => Ok(Optimistic::Hit(record)),
            _ => Ok(Optimistic::Miss),
        };
    }

    Ok(Optimistic::Contended)
}
