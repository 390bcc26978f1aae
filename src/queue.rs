//! Bounded integer-bundle queues (L6): a circular buffer of variable-length
//! "bundles" of 32-bit words, with a single non-blocking side and one or more
//! blocking sides serialized by a latch.
//!
//! [`Mpiq`] is master-producer / many-worker-consumers; [`Wpiq`] is its dual,
//! many-worker-producers / single non-blocking master-consumer. Both share
//! the same on-the-wire layout and circular-buffer bookkeeping; only which
//! side blocks and which side is latched differs.
//!
//! `insert`/`remove` are absolute, ever-increasing word cursors (reduced mod
//! `capacity_words` only when indexing into the buffer), not reset to the
//! buffer's own range - the standard circular-buffer-with-absolute-cursors
//! construction. `pop` is not derived from them; it is the authoritative
//! population count in words (including one header word per item), bumped by
//! the same `add`/`sub` calls that make it usable as the asymmetric
//! synchronic callers wait or register callbacks on.
//!
//! Every agent attaches to a queue as either [`Role::Master`] or
//! [`Role::Worker`]; each method is restricted to one side and raises
//! [`Error::WrongAgent`] if called through an instance attached as the
//! other.

use crate::asymmetric::AsymmetricSynchronic;
use crate::error::{Error, Result};
use crate::message::{CallbackReason, Mailbox, MasterLoop};
use crate::region::SharedRegion;
use core::sync::atomic::Ordering::SeqCst;
use core::time::Duration;

const INSERT_OFFSET: usize = 0;
const REMOVE_OFFSET: usize = 4;
const POP_OFFSET: usize = 8;
const LATCH_OFFSET: usize = 28;
const BUFFER_OFFSET: usize = 48;

/// Which side of an [`Mpiq`]/[`Wpiq`] an attaching agent plays. `Mpiq`
/// restricts producing to `Master` and consuming to `Worker`; `Wpiq` inverts
/// that. Chosen at `init`/`at` time and fixed for the life of the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The single non-blocking side of the queue.
    Master,
    /// One of the possibly many blocking sides of the queue.
    Worker,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::Master => "the master",
            Role::Worker => "a worker",
        }
    }
}

fn bytes_needed(capacity_words: u32) -> usize {
    BUFFER_OFFSET + capacity_words as usize * 4
}

fn validate(region: &SharedRegion, base: usize, capacity_words: u32) -> Result<()> {
    if base % 4 != 0 {
        return Err(Error::BadLayout {
            offset: base,
            bytes: bytes_needed(capacity_words),
            align: 4,
        });
    }
    let total = bytes_needed(capacity_words);
    if base.checked_add(total).map_or(true, |end| end > region.len()) {
        return Err(Error::OutOfBounds {
            offset: base,
            bytes: total,
            region_len: region.len(),
        });
    }
    Ok(())
}

/// Shared bookkeeping between [`Mpiq`] and [`Wpiq`]: cursor arithmetic and
/// raw word access. Neither queue type exposes this directly.
struct Core {
    region: SharedRegion,
    base: usize,
    capacity_words: u32,
    role: Role,
    pop: AsymmetricSynchronic<u32>,
    latch: AsymmetricSynchronic<u32>,
}

impl Core {
    fn init(
        region: SharedRegion,
        base: usize,
        capacity_words: u32,
        role: Role,
        pop_id: u32,
        latch_id: u32,
        mailbox: Mailbox,
    ) -> Result<Self> {
        validate(&region, base, capacity_words)?;
        let pop = AsymmetricSynchronic::init(region.clone(), base + POP_OFFSET, 0, pop_id, mailbox.clone())?;
        let latch = AsymmetricSynchronic::init(region.clone(), base + LATCH_OFFSET, 0, latch_id, mailbox)?;
        let this = Self {
            region: region.clone(),
            base,
            capacity_words,
            role,
            pop,
            latch,
        };
        this.insert_word().store(0, SeqCst);
        this.remove_word().store(0, SeqCst);
        Ok(this)
    }

    fn at(
        region: SharedRegion,
        base: usize,
        capacity_words: u32,
        role: Role,
        pop_id: u32,
        latch_id: u32,
        mailbox: Mailbox,
    ) -> Result<Self> {
        validate(&region, base, capacity_words)?;
        let pop = AsymmetricSynchronic::at(region.clone(), base + POP_OFFSET, mailbox.clone())?;
        let latch = AsymmetricSynchronic::at(region.clone(), base + LATCH_OFFSET, mailbox)?;
        Ok(Self {
            region,
            base,
            capacity_words,
            role,
            pop,
            latch,
        })
    }

    fn require_role(&self, required: Role, method: &'static str) -> Result<()> {
        if self.role != required {
            return Err(Error::WrongAgent {
                method,
                expected: required.label(),
            });
        }
        Ok(())
    }

    fn insert_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + INSERT_OFFSET)
    }

    fn remove_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + REMOVE_OFFSET)
    }

    fn buffer_word(&self, cursor: u32) -> &core::sync::atomic::AtomicU32 {
        let slot = cursor % self.capacity_words;
        self.region.atomic_u32(self.base + BUFFER_OFFSET + slot as usize * 4)
    }

    fn occupied_words(&self) -> u32 {
        self.pop.load()
    }

    fn free_words(&self) -> u32 {
        self.capacity_words - self.occupied_words()
    }

    /// Writes one bundle at the current `insert` cursor and publishes the
    /// advance. Caller has already checked there's room.
    fn write_item(&self, item: &[u32]) {
        let insert = self.insert_word().load(SeqCst);
        self.buffer_word(insert).store(item.len() as u32, SeqCst);
        for (i, word) in item.iter().enumerate() {
            self.buffer_word(insert + 1 + i as u32).store(*word, SeqCst);
        }
        self.insert_word().store(insert.wrapping_add(item.len() as u32 + 1), SeqCst);
        self.pop.add(item.len() as u32 + 1);
    }

    /// Reads and retires one bundle at the current `remove` cursor. Caller
    /// has already checked the queue is non-empty.
    fn read_item(&self) -> Vec<u32> {
        let remove = self.remove_word().load(SeqCst);
        let len = self.buffer_word(remove).load(SeqCst);
        let item = (0..len)
            .map(|i| self.buffer_word(remove + 1 + i).load(SeqCst))
            .collect();
        self.remove_word().store(remove.wrapping_add(len + 1), SeqCst);
        self.pop.sub(len + 1);
        item
    }

    fn acquire_latch(&self) {
        while self.latch.cas(0, 1).is_err() {
            self.latch.wait_for_equal(0, None);
        }
    }

    fn release_latch(&self) {
        self.latch.store(0);
    }

    fn check_fits(&self, item_words: u32) -> Result<()> {
        if item_words + 1 > self.capacity_words {
            return Err(Error::Overlong {
                item_words,
                capacity_words: self.capacity_words,
            });
        }
        Ok(())
    }
}

/// Master-producer, many-worker-consumer queue: `put_or_fail`/`call_when_can_put`
/// run on the master and never block; `take_or_fail`/`take` run on workers and
/// serialize against each other through `latch`.
pub struct Mpiq {
    core: Core,
}

impl Mpiq {
    /// Bytes a queue of `capacity_words` needs, including its header.
    pub const fn bytes_needed(capacity_words: u32) -> usize {
        bytes_needed(capacity_words)
    }

    /// Initializes a new, empty queue, attaching the caller as `role`. The
    /// first agent to touch a queue's backing bytes calls this; every other
    /// agent attaches with [`Mpiq::at`] instead.
    pub fn init(
        region: SharedRegion,
        base: usize,
        capacity_words: u32,
        role: Role,
        pop_id: u32,
        latch_id: u32,
        mailbox: Mailbox,
    ) -> Result<Self> {
        Ok(Self {
            core: Core::init(region, base, capacity_words, role, pop_id, latch_id, mailbox)?,
        })
    }

    /// Attaches to a queue another agent already initialized, as `role`.
    pub fn at(
        region: SharedRegion,
        base: usize,
        capacity_words: u32,
        role: Role,
        pop_id: u32,
        latch_id: u32,
        mailbox: Mailbox,
    ) -> Result<Self> {
        Ok(Self {
            core: Core::at(region, base, capacity_words, role, pop_id, latch_id, mailbox)?,
        })
    }

    /// Master-only, non-blocking. Appends `item` if there's room; returns
    /// `false` (without writing anything) if the queue is currently too
    /// full, and errors if `item` could never fit regardless of occupancy.
    pub fn put_or_fail(&self, item: &[u32]) -> Result<bool> {
        self.core.require_role(Role::Master, "Mpiq::put_or_fail")?;
        self.core.check_fits(item.len() as u32)?;
        if self.core.free_words() < item.len() as u32 + 1 {
            return Ok(false);
        }
        self.core.write_item(item);
        Ok(true)
    }

    /// Master-only: invokes `cb` once at least `min_free_words` words of
    /// free capacity are available, or once `timeout` elapses. Re-checks the
    /// free-space predicate (not just equality against a baseline) on every
    /// population change, per the asymmetric-synchronic callback contract.
    pub fn call_when_can_put(
        &self,
        master: &mut MasterLoop,
        min_free_words: u32,
        timeout: Option<Duration>,
        cb: impl FnMut(CallbackReason) + Send + 'static,
    ) -> Result<()> {
        self.core.require_role(Role::Master, "Mpiq::call_when_can_put")?;
        let capacity_words = self.core.capacity_words;
        self.core
            .pop
            .call_when(master, timeout, move |occupied| capacity_words - occupied < min_free_words, cb);
        Ok(())
    }

    /// Worker-only, non-blocking. Takes the head item if one is ready and
    /// the latch is free; returns `None` without touching the queue if
    /// either isn't.
    pub fn take_or_fail(&self) -> Result<Option<Vec<u32>>> {
        self.core.require_role(Role::Worker, "Mpiq::take_or_fail")?;
        Ok(self.take_locked())
    }

    fn take_locked(&self) -> Option<Vec<u32>> {
        self.core.acquire_latch();
        if self.core.occupied_words() == 0 {
            self.core.release_latch();
            return None;
        }
        let item = self.core.read_item();
        self.core.release_latch();
        Some(item)
    }

    /// Worker-only, blocking. Takes the head item, waiting for one to
    /// appear; gives up and returns `None` once `timeout` elapses.
    pub fn take(&self, timeout: Option<Duration>) -> Result<Option<Vec<u32>>> {
        self.core.require_role(Role::Worker, "Mpiq::take")?;
        loop {
            if let Some(item) = self.take_locked() {
                return Ok(Some(item));
            }
            if !self.core.pop.wait_for_not_equal(0, timeout).is_unparked() {
                return Ok(None);
            }
        }
    }
}

/// Many-worker-producer, master-consumer queue: the symmetric dual of
/// [`Mpiq`]. Workers `put`/`put_or_fail` through the latch; the master
/// `take_or_fail`s without ever blocking.
pub struct Wpiq {
    core: Core,
}

impl Wpiq {
    /// Bytes a queue of `capacity_words` needs, including its header.
    pub const fn bytes_needed(capacity_words: u32) -> usize {
        bytes_needed(capacity_words)
    }

    /// Initializes a new, empty queue, attaching the caller as `role`. The
    /// first agent to touch a queue's backing bytes calls this; every other
    /// agent attaches with [`Wpiq::at`] instead.
    pub fn init(
        region: SharedRegion,
        base: usize,
        capacity_words: u32,
        role: Role,
        pop_id: u32,
        latch_id: u32,
        mailbox: Mailbox,
    ) -> Result<Self> {
        Ok(Self {
            core: Core::init(region, base, capacity_words, role, pop_id, latch_id, mailbox)?,
        })
    }

    /// Attaches to a queue another agent already initialized, as `role`.
    pub fn at(
        region: SharedRegion,
        base: usize,
        capacity_words: u32,
        role: Role,
        pop_id: u32,
        latch_id: u32,
        mailbox: Mailbox,
    ) -> Result<Self> {
        Ok(Self {
            core: Core::at(region, base, capacity_words, role, pop_id, latch_id, mailbox)?,
        })
    }

    /// Worker-only, non-blocking. Appends `item` if there's room and the
    /// latch is free; returns `false` if either isn't.
    pub fn put_or_fail(&self, item: &[u32]) -> Result<bool> {
        self.core.require_role(Role::Worker, "Wpiq::put_or_fail")?;
        self.core.check_fits(item.len() as u32)?;
        Ok(self.put_locked(item))
    }

    fn put_locked(&self, item: &[u32]) -> bool {
        self.core.acquire_latch();
        if self.core.free_words() < item.len() as u32 + 1 {
            self.core.release_latch();
            return false;
        }
        self.core.write_item(item);
        self.core.release_latch();
        true
    }

    /// Worker-only, blocking. As [`Wpiq::put_or_fail`], but waits for room
    /// to free up instead of failing, giving up once `timeout` elapses.
    pub fn put(&self, item: &[u32], timeout: Option<Duration>) -> Result<bool> {
        self.core.require_role(Role::Worker, "Wpiq::put")?;
        self.core.check_fits(item.len() as u32)?;
        loop {
            if self.put_locked(item) {
                return Ok(true);
            }
            if !self.core.pop.wait_for_equal(self.core.capacity_words, timeout).is_unparked() {
                return Ok(false);
            }
        }
    }

    /// Master-only, non-blocking.
    pub fn take_or_fail(&self) -> Result<Option<Vec<u32>>> {
        self.core.require_role(Role::Master, "Wpiq::take_or_fail")?;
        if self.core.occupied_words() == 0 {
            return Ok(None);
        }
        Ok(Some(self.core.read_item()))
    }

    /// Master-only: invokes `cb` once at least one item is available, or
    /// once `timeout` elapses.
    pub fn call_when_can_take(
        &self,
        master: &mut MasterLoop,
        timeout: Option<Duration>,
        cb: impl FnMut(CallbackReason) + Send + 'static,
    ) -> Result<()> {
        self.core.require_role(Role::Master, "Wpiq::call_when_can_take")?;
        self.core.pop.call_when(master, timeout, |occupied| occupied == 0, cb);
        Ok(())
    }
}
