//! Agent records: the arena+index realization of the "agent-embedded list
//! node" design used by the list-based mutex/condvar (see module docs on
//! [`crate::mutex_list`]).
//!
//! The original systems this crate's primitives are modeled on store queue
//! nodes inside the waiter's own thread-local record; a systems rewrite over
//! a flat shared region instead carries a fixed array of agent records, each
//! with an embedded intrusive list node, indexed by a small integer agent
//! id. That's what `AgentTable` is.

use crate::error::{Error, Result};
use crate::park::{self, ParkResult};
use crate::region::SharedRegion;
use core::sync::atomic::Ordering::SeqCst;
use core::time::Duration;

/// Sentinel `next`/head/tail value meaning "no agent".
pub const NONE: u32 = u32::MAX;

const RECORD_BYTES: usize = 8; // awake (4) + next (4)
const RECORD_ALIGN: usize = 4;

fn validate(region: &SharedRegion, base: usize, capacity: u32) -> Result<()> {
    if base % RECORD_ALIGN != 0 {
        return Err(Error::BadLayout {
            offset: base,
            bytes: AgentTable::bytes_needed(capacity),
            align: RECORD_ALIGN,
        });
    }
    let total = AgentTable::bytes_needed(capacity);
    if base.checked_add(total).map_or(true, |end| end > region.len()) {
        return Err(Error::OutOfBounds {
            offset: base,
            bytes: total,
            region_len: region.len(),
        });
    }
    Ok(())
}

/// A fixed-capacity array of agent records living in the shared region.
///
/// Each record has a `park` word (parked-on to implement the record's own
/// wakeup) and a `next` index, so the table doubles as storage for however
/// many intrusive singly-linked FIFOs list-based primitives need to thread
/// through it; a waiter is in at most one such list at a time, matching the
/// invariant in the data model.
pub struct AgentTable {
    region: SharedRegion,
    base: usize,
    capacity: u32,
}

impl AgentTable {
    /// Bytes needed for `capacity` agent records.
    pub const fn bytes_needed(capacity: u32) -> usize {
        capacity as usize * RECORD_BYTES
    }

    /// Initializes a fresh table for up to `capacity` agents.
    pub fn init(region: SharedRegion, base: usize, capacity: u32) -> Result<Self> {
        validate(&region, base, capacity)?;
        let table = Self {
            region,
            base,
            capacity,
        };
        for id in 0..capacity {
            table.awake_word(id).store(0, SeqCst);
            table.next_word(id).store(NONE, SeqCst);
        }
        Ok(table)
    }

    /// Attaches to a table another agent already initialized.
    pub fn at(region: SharedRegion, base: usize, capacity: u32) -> Result<Self> {
        validate(&region, base, capacity)?;
        Ok(Self {
            region,
            base,
            capacity,
        })
    }

    fn record_base(&self, id: u32) -> usize {
        debug_assert!(id < self.capacity);
        self.base + id as usize * RECORD_BYTES
    }

    fn awake_word(&self, id: u32) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.record_base(id))
    }

    fn next_word(&self, id: u32) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.record_base(id) + 4)
    }

    /// Reads `next[id]`.
    pub fn next(&self, id: u32) -> u32 {
        self.next_word(id).load(SeqCst)
    }

    /// Sets `next[id]`.
    pub fn set_next(&self, id: u32, next: u32) {
        self.next_word(id).store(next, SeqCst);
    }

    /// Clears the wake flag and parks `id` on its own record until another
    /// agent calls [`AgentTable::wake`] on it, or `timeout` elapses.
    ///
    /// Callers must clear the record's `next` pointer themselves once the
    /// agent is unlinked from whatever list it was queued on.
    pub fn park(&self, id: u32, timeout: Option<Duration>) -> ParkResult {
        loop {
            if self.awake_word(id).load(SeqCst) != 0 {
                self.awake_word(id).store(0, SeqCst);
                return ParkResult::Unparked;
            }
            match park::park(&self.region, self.record_base(id), 0, timeout) {
                ParkResult::TimedOut => return ParkResult::TimedOut,
                _ => continue,
            }
        }
    }

    /// Wakes `id`'s park, regardless of whether it has called
    /// [`AgentTable::park`] yet (the flag latches).
    pub fn wake(&self, id: u32) {
        self.awake_word(id).store(1, SeqCst);
        park::unpark_all(&self.region, self.record_base(id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn wake_before_park_is_not_lost() {
        let region = SharedRegion::new(256);
        let table = AgentTable::init(region, 0, 4).unwrap();
        table.wake(2);
        assert_eq!(table.park(2, Some(Duration::from_millis(50))), ParkResult::Unparked);
    }

    #[test]
    fn wake_after_park_arrives() {
        let region = Arc::new(SharedRegion::new(256));
        let table = Arc::new(AgentTable::init((*region).clone(), 0, 4).unwrap());
        let t2 = table.clone();
        let h = thread::spawn(move || t2.park(1, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(30));
        table.wake(1);
        assert_eq!(h.join().unwrap(), ParkResult::Unparked);
    }

    #[test]
    fn init_rejects_a_region_too_small_for_the_requested_capacity() {
        let region = SharedRegion::new(16);
        assert!(matches!(
            AgentTable::init(region, 0, 4),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn at_rejects_a_region_too_small_for_the_requested_capacity() {
        let region = SharedRegion::new(16);
        assert!(matches!(
            AgentTable::at(region, 0, 4),
            Err(Error::OutOfBounds { .. })
        ));
    }
}
