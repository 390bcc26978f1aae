//! The list-based mutex/condvar variant (the "master-lock" in the external
//! interface sizing table): a spinlock-guarded FIFO of [`AgentTable`]
//! entries instead of a bare futex word.
//!
//! Being queue-head *is* holding the lock: `lock` always links itself onto
//! the tail, and only parks if the queue wasn't empty; `unlock` pops itself
//! off the head and directly hands ownership to the new head by waking it,
//! so there's no separate "locked" flag to keep in sync with the queue -
//! the three words (spinlock, head, tail) are the entire state, matching
//! the `3 x 4 bytes` layout in the external interfaces. This is the same
//! enqueue/unlink algorithm as the bucket lists in [`crate::park`], just
//! re-hosted on [`AgentTable`] records addressed by agent id instead of
//! stack-resident nodes, per the arena+index design note for
//! agent-embedded list storage.

use crate::agent::{AgentTable, NONE};
use crate::region::{Layout, SharedRegion};
use core::sync::atomic::Ordering::SeqCst;
use core::time::Duration;

const SPIN_OFFSET: usize = 0;
const HEAD_OFFSET: usize = 4;
const TAIL_OFFSET: usize = 8;

fn spin_acquire(word: &core::sync::atomic::AtomicU32) {
    while word.compare_exchange_weak(0, 1, SeqCst, SeqCst).is_err() {
        core::hint::spin_loop();
    }
}

fn spin_release(word: &core::sync::atomic::AtomicU32) {
    word.store(0, SeqCst);
}

/// A FIFO mutex whose wait queue lives in an [`AgentTable`] rather than on
/// waiting threads' stacks.
pub struct ListMutex {
    region: SharedRegion,
    base: usize,
}

impl Layout for ListMutex {
    const BYTES: usize = 12;
    const ALIGN: usize = 4;
}

impl ListMutex {
    /// Initializes a new, unlocked list-based mutex at `base`.
    pub fn init(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        let this = Self { region, base };
        this.spin().store(0, SeqCst);
        this.head().store(NONE, SeqCst);
        this.tail().store(NONE, SeqCst);
        Ok(this)
    }

    /// Attaches to a list-based mutex another agent already initialized.
    pub fn at(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self { region, base })
    }

    fn spin(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + SPIN_OFFSET)
    }
    fn head(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + HEAD_OFFSET)
    }
    fn tail(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + TAIL_OFFSET)
    }

    /// Enqueues `id` onto the tail; returns `true` if the queue was empty
    /// (and so `id` now owns the lock immediately).
    fn enqueue(&self, agents: &AgentTable, id: u32) -> bool {
        spin_acquire(self.spin());
        agents.set_next(id, NONE);
        let was_empty = self.head().load(SeqCst) == NONE;
        if was_empty {
            self.head().store(id, SeqCst);
        } else {
            agents.set_next(self.tail().load(SeqCst), id);
        }
        self.tail().store(id, SeqCst);
        spin_release(self.spin());
        was_empty
    }

    /// Pops `id` (the current head - the caller must hold the lock) and
    /// returns the new head, or `NONE` if the queue is now empty.
    fn pop_head(&self, agents: &AgentTable, id: u32) -> u32 {
        spin_acquire(self.spin());
        debug_assert_eq!(self.head().load(SeqCst), id);
        let next = agents.next(id);
        self.head().store(next, SeqCst);
        if next == NONE {
            self.tail().store(NONE, SeqCst);
        }
        spin_release(self.spin());
        next
    }

    /// Acquires the lock as `id`, blocking (via `agents`) until it's this
    /// agent's turn.
    pub fn lock(&self, agents: &AgentTable, id: u32) {
        if !self.enqueue(agents, id) {
            agents.park(id, None);
        }
    }

    /// Releases the lock held by `id`, handing it directly to the next
    /// queued agent, if any.
    pub fn unlock(&self, agents: &AgentTable, id: u32) {
        let next = self.pop_head(agents, id);
        if next != NONE {
            agents.wake(next);
        }
    }
}

/// A condition variable whose waiters are parked through an [`AgentTable`],
/// paired with a [`ListMutex`].
pub struct ListCondvar {
    region: SharedRegion,
    base: usize,
}

impl Layout for ListCondvar {
    const BYTES: usize = 12;
    const ALIGN: usize = 4;
}

impl ListCondvar {
    /// Initializes a new list-based condvar at `base`.
    pub fn init(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        let this = Self { region, base };
        this.spin().store(0, SeqCst);
        this.head().store(NONE, SeqCst);
        this.tail().store(NONE, SeqCst);
        Ok(this)
    }

    /// Attaches to a list-based condvar another agent already initialized.
    pub fn at(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self { region, base })
    }

    fn spin(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + SPIN_OFFSET)
    }
    fn head(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + HEAD_OFFSET)
    }
    fn tail(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + TAIL_OFFSET)
    }

    fn enqueue(&self, agents: &AgentTable, id: u32) {
        spin_acquire(self.spin());
        agents.set_next(id, NONE);
        if self.head().load(SeqCst) == NONE {
            self.head().store(id, SeqCst);
        } else {
            agents.set_next(self.tail().load(SeqCst), id);
        }
        self.tail().store(id, SeqCst);
        spin_release(self.spin());
    }

    fn pop_one(&self, agents: &AgentTable) -> u32 {
        spin_acquire(self.spin());
        let id = self.head().load(SeqCst);
        if id != NONE {
            let next = agents.next(id);
            self.head().store(next, SeqCst);
            if next == NONE {
                self.tail().store(NONE, SeqCst);
            }
        }
        spin_release(self.spin());
        id
    }

    /// Releases `mutex`, waits to be notified (or for `timeout` to elapse),
    /// then re-acquires `mutex`. `mutex` must be held as `id` on entry.
    /// Returns `true` if woken by a notification rather than a timeout.
    pub fn wait(&self, agents: &AgentTable, mutex: &ListMutex, id: u32, timeout: Option<Duration>) -> bool {
        self.enqueue(agents, id);
        mutex.unlock(agents, id);
        let result = agents.park(id, timeout);
        mutex.lock(agents, id);
        result.is_unparked()
    }

    /// Wakes one waiter, if any.
    pub fn notify_one(&self, agents: &AgentTable) {
        let id = self.pop_one(agents);
        if id != NONE {
            agents.wake(id);
        }
    }

    /// Wakes every waiter.
    pub fn notify_all(&self, agents: &AgentTable) {
        loop {
            let id = self.pop_one(agents);
            if id == NONE {
                break;
            }
            agents.wake(id);
        }
    }
}
