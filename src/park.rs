//! The park word: the one primitive every other synchronization type in this
//! crate is built from (L1 in the design). `park`/`unpark` operate on any
//! 32-bit atomic slot inside a [`SharedRegion`](crate::region::SharedRegion),
//! the same way `sparking_lot_core`/`parking_lot_core` park on addresses:
//! threads waiting on the same physical word are linked into a bucket keyed
//! by that word's address, `park` enqueues-and-sleeps atomically with respect
//! to a value check, and `unpark_*` walks the bucket to wake the matching
//! threads.
//!
//! Successful `unpark` synchronizes-with the return of every `park` it
//! releases (the `signalled` flag uses `Release`/`Acquire` ordering).

cfg_if::cfg_if! {
    if #[cfg(loom)] {
        use loom as stdlib;
    } else {
        use std as stdlib;
    }
}

use crate::region::SharedRegion;
use stdlib::cell::Cell;
use stdlib::sync::atomic::{AtomicBool, Ordering::{Acquire, Release}};
use stdlib::sync::{Mutex, MutexGuard};
use stdlib::thread::{self, Thread};

use core::ptr;
use core::time::Duration;
use std::time::Instant;

/// Outcome of a `park`/`expect_update` call, per the L1 contract in the
/// design: a wait either observed the wake, found the condition already
/// false, or ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParkResult {
    /// The thread was woken by a matching `unpark_*` call.
    Unparked,
    /// `expected` didn't hold at the time of the check; the thread never
    /// slept.
    NotEqual,
    /// The timeout elapsed before any `unpark_*` call matched.
    TimedOut,
}

impl ParkResult {
    /// Whether the wait ended because of a wake (as opposed to a mismatch or
    /// a timeout).
    pub fn is_unparked(self) -> bool {
        matches!(self, ParkResult::Unparked)
    }
}

#[repr(C)]
struct ThreadData {
    next: Cell<*const ThreadData>,
    key: usize,
    signalled: AtomicBool,
    thread: Thread,
}

// `ThreadData` lives on one thread's stack for the duration of its park, and
// is only touched by other threads while the owning bucket's lock is held
// (or, after being unlinked, only by the single unparking thread before the
// wake), so it's sound to share across threads despite the `Cell`.
unsafe impl Sync for ThreadData {}

struct Bucket {
    first: Cell<*const ThreadData>,
    last: Cell<*const ThreadData>,
}

unsafe impl Send for Bucket {}

const BUCKET_BITS: usize = 8;
const BUCKET_COUNT: usize = 1 << BUCKET_BITS;

struct Hashtable {
    buckets: [Mutex<Bucket>; BUCKET_COUNT],
}

impl Hashtable {
    #[cfg(not(loom))]
    fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| {
                Mutex::new(Bucket {
                    first: Cell::new(ptr::null()),
                    last: Cell::new(ptr::null()),
                })
            }),
        }
    }

    #[cfg(loom)]
    fn new() -> Self {
        Self {
            buckets: core::array::from_fn(|_| {
                Mutex::new(Bucket {
                    first: Cell::new(ptr::null()),
                    last: Cell::new(ptr::null()),
                })
            }),
        }
    }

    fn hash(key: usize) -> usize {
        #[cfg(target_pointer_width = "64")]
        return (key.wrapping_mul(0x9E3779B97F4A7C15) >> (64 - BUCKET_BITS)) as usize;
        #[cfg(not(target_pointer_width = "64"))]
        return (key.wrapping_mul(0x9E3779B9) >> (32 - BUCKET_BITS)) as usize;
    }

    fn lock(&self, key: usize) -> MutexGuard<'_, Bucket> {
        self.buckets[Self::hash(key)]
            .lock()
            .expect("park bucket lock poisoned")
    }
}

#[cfg(not(loom))]
fn table() -> &'static Hashtable {
    use stdlib::sync::OnceLock;
    static TABLE: OnceLock<Hashtable> = OnceLock::new();
    TABLE.get_or_init(Hashtable::new)
}

#[cfg(loom)]
fn table() -> &'static Hashtable {
    loom::lazy_static! {
        static ref TABLE: Hashtable = Hashtable::new();
    }
    &TABLE
}

/// Address identifying the physical word at `region[addr..addr+4]`. Two
/// regions never alias, so this is unique process-wide for as long as
/// `region` is alive.
fn key_of(region: &SharedRegion, addr: usize) -> usize {
    region.atomic_u32(addr) as *const _ as usize
}

/// Atomically checks that the 32-bit word at `addr` equals `expected` and,
/// if so, blocks the current thread until a matching `unpark_*` call, or
/// until `timeout` elapses.
///
/// The check-and-block is atomic with respect to `unpark_one`/`unpark_all`
/// on the same address: if a concurrent unpark happens after `expected`
/// stops holding, this call either observes the new value and returns
/// `NotEqual`, or has already been enqueued and will be woken.
pub fn park(region: &SharedRegion, addr: usize, expected: u32, timeout: Option<Duration>) -> ParkResult {
    use core::sync::atomic::Ordering::SeqCst;

    let key = key_of(region, addr);
    let table = table();
    let bucket = table.lock(key);
    if region.atomic_u32(addr).load(SeqCst) != expected {
        return ParkResult::NotEqual;
    }

    let data = ThreadData {
        next: Cell::new(ptr::null()),
        key,
        signalled: AtomicBool::new(false),
        thread: thread::current(),
    };
    let data_ptr: *const ThreadData = &data;

    if bucket.first.get().is_null() {
        bucket.first.set(data_ptr);
    } else {
        // SAFETY: last is non-null whenever first is, and only this bucket's
        // lock holder can be linking into the list.
        unsafe { &*bucket.last.get() }.next.set(data_ptr);
    }
    bucket.last.set(data_ptr);
    drop(bucket);

    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        if data.signalled.load(Acquire) {
            return ParkResult::Unparked;
        }
        match deadline {
            None => thread::park(),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                thread::park_timeout(deadline - now);
            }
        }
    }

    // Timed out (or spuriously woke right at the deadline). Re-take the
    // bucket lock to resolve the race against a concurrent `unpark_*`: if
    // we're still linked, unlink ourselves and report `TimedOut`; if we're
    // not, an unpark already claimed us (or is about to set `signalled`),
    // so wait for that to finish and report `Unparked`.
    let bucket = table.lock(key);
    if data.signalled.load(Acquire) {
        drop(bucket);
        return ParkResult::Unparked;
    }
    unlink(&bucket, data_ptr);
    drop(bucket);
    // An in-flight `unpark_*` may have already unlinked us and be about to
    // call `thread::unpark()`; park once more (non-blocking in practice,
    // since any pending unpark is imminent) to consume it without leaking a
    // stray wakeup into the next `park` call on this thread.
    if data.signalled.load(Acquire) {
        return ParkResult::Unparked;
    }
    ParkResult::TimedOut
}

/// Unlinks `target` from `bucket`'s list if present.
fn unlink(bucket: &Bucket, target: *const ThreadData) {
    let mut current = bucket.first.get();
    let mut previous = ptr::null();
    unsafe {
        while !current.is_null() {
            let next = (*current).next.get();
            if ptr::eq(current, target) {
                if ptr::eq(current, bucket.last.get()) {
                    bucket.last.set(previous);
                }
                if previous.is_null() {
                    bucket.first.set(next);
                } else {
                    (*previous).next.set(next);
                }
                return;
            }
            previous = current;
            current = next;
        }
    }
}

/// Wakes up to `count` threads parked on `addr`. Returns the number actually
/// woken.
pub fn unpark(region: &SharedRegion, addr: usize, mut count: usize) -> usize {
    if count == 0 {
        return 0;
    }
    let key = key_of(region, addr);
    let table = table();
    let bucket = table.lock(key);

    let mut current = bucket.first.get();
    let mut previous = ptr::null();
    let mut woken = Vec::new();

    unsafe {
        while !current.is_null() && count > 0 {
            let next = (*current).next.get();
            if (*current).key == key {
                if ptr::eq(current, bucket.last.get()) {
                    bucket.last.set(previous);
                }
                if previous.is_null() {
                    bucket.first.set(next);
                } else {
                    (*previous).next.set(next);
                }
                woken.push(current);
                count -= 1;
            } else {
                previous = current;
            }
            current = next;
        }
    }
    drop(bucket);

    let n = woken.len();
    for data in woken {
        // SAFETY: the thread owning `data` is still inside `park`'s wait
        // loop (it only returns after observing `signalled`), and `data`
        // lives on that thread's stack until then.
        unsafe {
            let thread = (*data).thread.clone();
            (*data).signalled.store(true, Release);
            thread.unpark();
        }
    }
    n
}

/// Wakes exactly one thread parked on `addr`, if any. Equivalent to
/// `unpark(region, addr, 1) == 1`.
pub fn unpark_one(region: &SharedRegion, addr: usize) -> bool {
    unpark(region, addr, 1) == 1
}

/// Wakes every thread parked on `addr`. Returns the number woken.
pub fn unpark_all(region: &SharedRegion, addr: usize) -> usize {
    unpark(region, addr, usize::MAX)
}
