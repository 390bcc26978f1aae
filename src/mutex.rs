//! The primary mutex and condition variable (L3): a three-state futex mutex
//! plus a sequence-word condvar, both parking directly on [`crate::park`]
//! rather than through a [`crate::synchronic::Synchronic`] (the mutex's
//! `state` word and the condvar's `seq` word are the wait addresses
//! themselves, so there's no separate generation counter to maintain).
//!
//! See [`crate::mutex_list`] for the FIFO, agent-table-backed alternative
//! described in the design as the "list-based variant".

use crate::park::{self, ParkResult};
use crate::region::{Layout, SharedRegion};
use core::sync::atomic::Ordering::SeqCst;
use core::time::Duration;

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;
const CONTENDED: u32 = 2;

/// A futex-backed mutual-exclusion lock over a word in the shared region.
///
/// `lock`/`unlock` follow the same three-state protocol as `parking_lot`'s
/// word lock and glibc's fast mutex: uncontended lock/unlock costs a single
/// CAS with no syscall, and `state` only becomes `Contended` once some
/// thread has actually parked, so `unlock` on an uncontended lock never
/// calls into [`crate::park`].
pub struct Mutex {
    region: SharedRegion,
    base: usize,
}

impl Layout for Mutex {
    const BYTES: usize = 4;
    const ALIGN: usize = 4;
}

impl Mutex {
    /// Initializes a new, unlocked mutex at `base`.
    pub fn init(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        let this = Self { region, base };
        this.state().store(UNLOCKED, SeqCst);
        Ok(this)
    }

    /// Attaches to a mutex another agent already initialized.
    pub fn at(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self { region, base })
    }

    fn state(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base)
    }

    /// Acquires the lock, blocking until it's available.
    pub fn lock(&self) {
        if self.state().compare_exchange(UNLOCKED, LOCKED, SeqCst, SeqCst).is_ok() {
            return;
        }
        loop {
            let prev = self.state().swap(CONTENDED, SeqCst);
            if prev == UNLOCKED {
                return;
            }
            park::park(&self.region, self.base, CONTENDED, None);
            // Re-read: another thread may already have set CONTENDED and be
            // racing us for the lock, so keep trying the swap above.
        }
    }

    /// Attempts to acquire the lock without blocking.
    pub fn try_lock(&self) -> bool {
        self.state().compare_exchange(UNLOCKED, LOCKED, SeqCst, SeqCst).is_ok()
    }

    /// Releases a lock previously acquired with `lock`/`try_lock`. Calling
    /// this without holding the lock is a logic error and corrupts the
    /// mutex's state for every other agent.
    pub fn unlock(&self) {
        if self.state().fetch_sub(1, SeqCst) != LOCKED {
            self.state().store(UNLOCKED, SeqCst);
            park::unpark_one(&self.region, self.base);
        }
    }

    /// Runs `f` with the lock held, unlocking even if `f` panics.
    pub fn with_lock<R>(&self, f: impl FnOnce() -> R) -> R {
        self.lock();
        let _guard = UnlockOnDrop(self);
        f()
    }
}

struct UnlockOnDrop<'a>(&'a Mutex);

impl Drop for UnlockOnDrop<'_> {
    fn drop(&mut self) {
        self.0.unlock();
    }
}

/// A condition variable associated with exactly one [`Mutex`] per wait.
///
/// `wait` must be called with the associated mutex held; it snapshots the
/// sequence word, releases the mutex, parks until `notify_*` bumps the
/// sequence, then re-acquires the mutex before returning.
pub struct Condvar {
    region: SharedRegion,
    base: usize,
}

impl Layout for Condvar {
    const BYTES: usize = 4;
    const ALIGN: usize = 4;
}

impl Condvar {
    /// Initializes a new condvar at `base`.
    pub fn init(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        let this = Self { region, base };
        this.seq().store(0, SeqCst);
        Ok(this)
    }

    /// Attaches to a condvar another agent already initialized.
    pub fn at(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self { region, base })
    }

    fn seq(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base)
    }

    /// Releases `mutex`, waits for a matching `notify_*`, then re-acquires
    /// `mutex` before returning. `mutex` must be held by the caller.
    pub fn wait(&self, mutex: &Mutex) {
        self.wait_timeout(mutex, None);
    }

    /// As [`Condvar::wait`], but gives up (and re-acquires the mutex anyway)
    /// after `timeout`. Returns `true` if woken by a notification.
    pub fn wait_timeout(&self, mutex: &Mutex, timeout: Option<Duration>) -> bool {
        let snapshot = self.seq().load(SeqCst);
        mutex.unlock();
        let result = park::park(&self.region, self.base, snapshot, timeout);
        mutex.lock();
        !matches!(result, ParkResult::TimedOut)
    }

    /// Wakes one waiter. The "head of queue" is whichever waiter the
    /// underlying park table happens to hold first; this implementation
    /// treats `notify_one` as waking one arbitrary parked agent, per the
    /// design's resolution of the "notifies only the caller's own waiter"
    /// bug in one of the systems this is modeled on.
    pub fn notify_one(&self) {
        self.seq().fetch_add(1, SeqCst);
        park::unpark_one(&self.region, self.base);
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        self.seq().fetch_add(1, SeqCst);
        park::unpark_all(&self.region, self.base);
    }
}
