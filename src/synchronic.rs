//! Synchronic cells (L2): typed atomic cells with efficient
//! change-notification, built directly on [`crate::park`].
//!
//! A `Synchronic<T>` occupies 16 bytes on a 4-byte boundary: a `value` word,
//! a `waiters` counter, a `seq` generation counter, and one reserved word.
//! Every mutating method performs the RMW on `value`, bumps `seq` if the
//! value actually changed (or the call is `notify`), and - only if
//! `waiters > 0` - wakes every thread parked on `seq`. Waiting on `seq`
//! rather than `value` lets one waiting protocol serve every integer width
//! up to 32 bits and avoids the race of parking directly on a narrow value.

use crate::park::{self, ParkResult};
use crate::region::{Layout, SharedRegion};
use core::marker::PhantomData;
use core::sync::atomic::Ordering::SeqCst;
use core::time::Duration;

const VALUE_OFFSET: usize = 0;
const WAITERS_OFFSET: usize = 4;
const SEQ_OFFSET: usize = 8;

/// Integer types a [`Synchronic`] can hold. Signed values are stored
/// sign-extended into the 32-bit word.
pub trait SynchronicValue: Copy + PartialEq + 'static {
    /// Packs `self` into the cell's 32-bit word.
    fn to_bits(self) -> u32;
    /// Unpacks a value previously produced by [`to_bits`](Self::to_bits).
    fn from_bits(bits: u32) -> Self;
}

macro_rules! impl_unsigned {
    ($($t:ty),*) => {
        $(impl SynchronicValue for $t {
            fn to_bits(self) -> u32 { self as u32 }
            fn from_bits(bits: u32) -> Self { bits as $t }
        })*
    };
}

macro_rules! impl_signed {
    ($($t:ty),*) => {
        $(impl SynchronicValue for $t {
            fn to_bits(self) -> u32 { self as i32 as u32 }
            fn from_bits(bits: u32) -> Self { bits as i32 as $t }
        })*
    };
}

impl_unsigned!(u8, u16, u32);
impl_signed!(i8, i16, i32);

/// A typed atomic cell with change notification. See the module docs.
pub struct Synchronic<T: SynchronicValue> {
    region: SharedRegion,
    base: usize,
    _value: PhantomData<T>,
}

impl<T: SynchronicValue> Layout for Synchronic<T> {
    const BYTES: usize = 16;
    const ALIGN: usize = 4;
}

impl<T: SynchronicValue> Synchronic<T> {
    /// Initializes a new cell at `base` to `initial`. Call this exactly once
    /// per cell, from whichever agent creates the region's layout; every
    /// other agent should use [`Synchronic::at`] and must not observe the
    /// cell before this call's writes are visible to it (e.g. by
    /// synchronizing through a barrier or the region handoff itself).
    pub fn init(region: SharedRegion, base: usize, initial: T) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        let this = Self {
            region,
            base,
            _value: PhantomData,
        };
        this.value_word().store(initial.to_bits(), SeqCst);
        this.waiters_word().store(0, SeqCst);
        this.seq_word().store(0, SeqCst);
        Ok(this)
    }

    /// Attaches to a cell at `base` that another agent already initialized.
    pub fn at(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self {
            region,
            base,
            _value: PhantomData,
        })
    }

    fn value_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + VALUE_OFFSET)
    }

    fn waiters_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + WAITERS_OFFSET)
    }

    fn seq_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + SEQ_OFFSET)
    }

    /// Byte offset of the `seq` word, exposed for composite primitives (like
    /// [`crate::asymmetric::AsymmetricSynchronic`]) that need to wait on it
    /// directly.
    pub(crate) fn seq_addr(&self) -> usize {
        self.base + SEQ_OFFSET
    }

    fn bump_seq_and_wake(&self) {
        self.seq_word().fetch_add(1, SeqCst);
        if self.waiters_word().load(SeqCst) > 0 {
            park::unpark_all(&self.region, self.seq_addr());
        }
    }

    /// Reads the current value.
    pub fn load(&self) -> T {
        T::from_bits(self.value_word().load(SeqCst))
    }

    /// Unconditionally stores `v`, bumping `seq` only if it changed.
    pub fn store(&self, v: T) {
        let old = self.value_word().swap(v.to_bits(), SeqCst);
        if old != v.to_bits() {
            self.bump_seq_and_wake();
        }
    }

    /// Compare-and-swap: if the current value equals `current`, replaces it
    /// with `new` and returns `Ok(current)`; otherwise returns `Err(actual)`.
    pub fn cas(&self, current: T, new: T) -> Result<T, T> {
        match self
            .value_word()
            .compare_exchange(current.to_bits(), new.to_bits(), SeqCst, SeqCst)
        {
            Ok(old) => {
                if old != new.to_bits() {
                    self.bump_seq_and_wake();
                }
                Ok(T::from_bits(old))
            }
            Err(actual) => Err(T::from_bits(actual)),
        }
    }

    fn rmw(&self, f: impl FnOnce(&core::sync::atomic::AtomicU32, u32) -> u32, operand: T) -> T {
        let old = f(self.value_word(), operand.to_bits());
        let new = self.value_word().load(SeqCst);
        if old != new {
            self.bump_seq_and_wake();
        }
        T::from_bits(old)
    }

    /// Fetch-add; returns the previous value.
    pub fn add(&self, v: T) -> T {
        self.rmw(|a, x| a.fetch_add(x, SeqCst), v)
    }

    /// Fetch-sub; returns the previous value.
    pub fn sub(&self, v: T) -> T {
        self.rmw(|a, x| a.fetch_sub(x, SeqCst), v)
    }

    /// Fetch-and; returns the previous value.
    pub fn and(&self, v: T) -> T {
        self.rmw(|a, x| a.fetch_and(x, SeqCst), v)
    }

    /// Fetch-or; returns the previous value.
    pub fn or(&self, v: T) -> T {
        self.rmw(|a, x| a.fetch_or(x, SeqCst), v)
    }

    /// Fetch-xor; returns the previous value.
    pub fn xor(&self, v: T) -> T {
        self.rmw(|a, x| a.fetch_xor(x, SeqCst), v)
    }

    /// Bumps `seq` and wakes waiters without otherwise touching `value`.
    /// Useful to re-kick waiters after a side channel changed something the
    /// predicate depends on.
    pub fn notify(&self) {
        self.bump_seq_and_wake();
    }

    /// Blocks until `load() == v`, or until `timeout` elapses.
    pub fn wait_for_equal(&self, v: T, timeout: Option<Duration>) -> ParkResult {
        self.wait_while(timeout, |cur| cur != v)
    }

    /// Blocks until `load() != v`, or until `timeout` elapses.
    pub fn wait_for_not_equal(&self, v: T, timeout: Option<Duration>) -> ParkResult {
        self.wait_while(timeout, |cur| cur == v)
    }

    /// Blocks until the value differs from the snapshot `v` passed in (the
    /// synchronic.js-style "has this been updated since I last looked"
    /// check). Semantically identical to [`wait_for_not_equal`].
    pub fn expect_update(&self, v: T, timeout: Option<Duration>) -> ParkResult {
        self.wait_for_not_equal(v, timeout)
    }

    fn wait_while(&self, timeout: Option<Duration>, keep_waiting: impl Fn(T) -> bool) -> ParkResult {
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        self.waiters_word().fetch_add(1, SeqCst);
        let result = loop {
            let t = self.seq_word().load(SeqCst);
            let cur = self.load();
            if !keep_waiting(cur) {
                break ParkResult::Unparked;
            }
            let remaining = match deadline {
                None => None,
                Some(dl) => {
                    let now = std::time::Instant::now();
                    if now >= dl {
                        break ParkResult::TimedOut;
                    }
                    Some(dl - now)
                }
            };
            match park::park(&self.region, self.seq_addr(), t, remaining) {
                ParkResult::TimedOut => break ParkResult::TimedOut,
                // `Unparked` or `NotEqual` both mean "something changed
                // `seq`"; loop around and re-check the predicate.
                ParkResult::Unparked | ParkResult::NotEqual => continue,
            }
        };
        self.waiters_word().fetch_sub(1, SeqCst);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region::SharedRegion;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn store_then_load_round_trips() {
        let region = SharedRegion::new(32);
        let cell = Synchronic::<u32>::init(region, 0, 0).unwrap();
        cell.store(42);
        assert_eq!(cell.load(), 42);
    }

    #[test]
    fn signed_values_sign_extend() {
        let region = SharedRegion::new(32);
        let cell = Synchronic::<i8>::init(region, 0, 0).unwrap();
        cell.store(-5);
        assert_eq!(cell.load(), -5);
    }

    #[test]
    fn cas_reports_mismatch() {
        let region = SharedRegion::new(32);
        let cell = Synchronic::<u32>::init(region, 0, 1).unwrap();
        assert_eq!(cell.cas(0, 5), Err(1));
        assert_eq!(cell.cas(1, 5), Ok(1));
        assert_eq!(cell.load(), 5);
    }

    #[test]
    fn wait_for_equal_observes_prior_store() {
        let region = Arc::new(SharedRegion::new(32));
        let cell = Arc::new(Synchronic::<u32>::init((*region).clone(), 0, 0).unwrap());
        let writer = {
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                cell.store(7);
            })
        };
        let result = cell.wait_for_equal(7, Some(Duration::from_secs(5)));
        assert!(result.is_unparked());
        assert_eq!(cell.load(), 7);
        writer.join().unwrap();
    }

    #[test]
    fn wait_for_equal_times_out() {
        let region = SharedRegion::new(32);
        let cell = Synchronic::<u32>::init(region, 0, 0).unwrap();
        let result = cell.wait_for_equal(1, Some(Duration::from_millis(20)));
        assert_eq!(result, ParkResult::TimedOut);
    }

    #[test]
    fn multiple_waiters_all_wake() {
        let region = Arc::new(SharedRegion::new(32));
        let cell = Arc::new(Synchronic::<u32>::init((*region).clone(), 0, 0).unwrap());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || cell.wait_for_not_equal(0, Some(Duration::from_secs(5))))
            })
            .collect();
        thread::sleep(Duration::from_millis(40));
        cell.store(9);
        for h in handles {
            assert!(h.join().unwrap().is_unparked());
        }
    }
}
