//! The asymmetric synchronic (L5): a [`crate::synchronic::Synchronic`]
//! augmented so the master agent, which may never block, can register a
//! callback instead of waiting.
//!
//! Adds two fields to the plain synchronic's `{value, waiters, seq}`:
//! `waitbits` (`0`, `Wait`, or `Wait|Transit`) and a stable `id` used to tag
//! the `Notify(id)` message. On registration the master sets `Wait`; on
//! every mutating operation, by any agent, the mutator CASes `waitbits`
//! from `Wait` to `Wait|Transit` and only sends `Notify(id)` if that CAS
//! wins - this is what keeps at most one notification for a given cell in
//! flight at a time, regardless of how many agents are concurrently
//! updating it.

use crate::message::{CallbackReason, Mailbox, Message, MasterLoop};
use crate::park::{self, ParkResult};
use crate::region::{Layout, SharedRegion};
use crate::synchronic::SynchronicValue;
use core::marker::PhantomData;
use core::sync::atomic::Ordering::SeqCst;
use core::time::Duration;

const VALUE_OFFSET: usize = 0;
const WAITERS_OFFSET: usize = 4;
const SEQ_OFFSET: usize = 8;
const WAITBITS_OFFSET: usize = 12;
const ID_OFFSET: usize = 16;

const WAIT: u32 = 1;
const TRANSIT: u32 = 2;

/// Result handed to a master-side callback registered through
/// [`AsymmetricSynchronic::call_when_updated`] and friends.
pub type Outcome = CallbackReason;

/// See the module docs.
pub struct AsymmetricSynchronic<T: SynchronicValue> {
    region: SharedRegion,
    base: usize,
    mailbox: Mailbox,
    _value: PhantomData<T>,
}

impl<T: SynchronicValue> Clone for AsymmetricSynchronic<T> {
    fn clone(&self) -> Self {
        Self {
            region: self.region.clone(),
            base: self.base,
            mailbox: self.mailbox.clone(),
            _value: PhantomData,
        }
    }
}

impl<T: SynchronicValue> Layout for AsymmetricSynchronic<T> {
    const BYTES: usize = 20;
    const ALIGN: usize = 4;
}

impl<T: SynchronicValue> AsymmetricSynchronic<T> {
    /// Initializes a new cell at `base` to `initial`, tagged with `id` for
    /// its `Notify(id)` messages.
    pub fn init(
        region: SharedRegion,
        base: usize,
        initial: T,
        id: u32,
        mailbox: Mailbox,
    ) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        let this = Self {
            region,
            base,
            mailbox,
            _value: PhantomData,
        };
        this.value_word().store(initial.to_bits(), SeqCst);
        this.waiters_word().store(0, SeqCst);
        this.seq_word().store(0, SeqCst);
        this.waitbits_word().store(0, SeqCst);
        this.id_word().store(id, SeqCst);
        Ok(this)
    }

    /// Attaches to a cell another agent already initialized.
    pub fn at(region: SharedRegion, base: usize, mailbox: Mailbox) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self {
            region,
            base,
            mailbox,
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
    fn waitbits_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + WAITBITS_OFFSET)
    }
    fn id_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + ID_OFFSET)
    }

    fn seq_addr(&self) -> usize {
        self.base + SEQ_OFFSET
    }

    /// This cell's stable identifier.
    pub fn id(&self) -> u32 {
        self.id_word().load(SeqCst)
    }

    fn bump_seq_wake_and_maybe_notify(&self) {
        self.seq_word().fetch_add(1, SeqCst);
        if self.waiters_word().load(SeqCst) > 0 {
            park::unpark_all(&self.region, self.seq_addr());
        }
        if self
            .waitbits_word()
            .compare_exchange(WAIT, WAIT | TRANSIT, SeqCst, SeqCst)
            .is_ok()
        {
            let _ = self.mailbox.send(Message::Notify { id: self.id() });
        }
    }

    // --- worker-side operations, identical in shape to `Synchronic<T>` ---

    /// Reads the current value.
    pub fn load(&self) -> T {
        T::from_bits(self.value_word().load(SeqCst))
    }

    /// Unconditionally stores `v`.
    pub fn store(&self, v: T) {
        let old = self.value_word().swap(v.to_bits(), SeqCst);
        if old != v.to_bits() {
            self.bump_seq_wake_and_maybe_notify();
        }
    }

    /// Compare-and-swap.
    pub fn cas(&self, current: T, new: T) -> Result<T, T> {
        match self
            .value_word()
            .compare_exchange(current.to_bits(), new.to_bits(), SeqCst, SeqCst)
        {
            Ok(old) => {
                if old != new.to_bits() {
                    self.bump_seq_wake_and_maybe_notify();
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
            self.bump_seq_wake_and_maybe_notify();
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

    /// Bumps `seq`/notifies without otherwise touching `value`.
    pub fn notify(&self) {
        self.bump_seq_wake_and_maybe_notify();
    }

    /// Worker-side blocking wait: identical to [`crate::synchronic::Synchronic::wait_for_equal`].
    pub fn wait_for_equal(&self, v: T, timeout: Option<Duration>) -> ParkResult {
        self.wait_while(timeout, |cur| cur != v)
    }

    /// Worker-side blocking wait: identical to [`crate::synchronic::Synchronic::wait_for_not_equal`].
    pub fn wait_for_not_equal(&self, v: T, timeout: Option<Duration>) -> ParkResult {
        self.wait_while(timeout, |cur| cur == v)
    }

    fn wait_while(&self, timeout: Option<Duration>, keep_waiting: impl Fn(T) -> bool) -> ParkResult {
        let deadline = timeout.map(|d| std::time::Instant::now() + d);
        self.waiters_word().fetch_add(1, SeqCst);
        let result = loop {
            let t = self.seq_word().load(SeqCst);
            if !keep_waiting(self.load()) {
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
                ParkResult::Unparked | ParkResult::NotEqual => continue,
            }
        };
        self.waiters_word().fetch_sub(1, SeqCst);
        result
    }

    // --- master-side: callbacks instead of blocking ---

    fn arm(&self) {
        // Only transitions 0 -> Wait; if a notification is already in
        // flight (Wait|Transit) or another registration is pending, leave
        // it alone.
        let _ = self
            .waitbits_word()
            .compare_exchange(0, WAIT, SeqCst, SeqCst);
    }

    /// Master-only: invokes `cb` once `keep_waiting(load())` is `false`, or
    /// once `timeout` elapses. The building block [`AsymmetricSynchronic::call_when_updated`]
    /// and its siblings are expressed in terms of; also used directly by
    /// [`crate::queue`] to watch a derived condition (free/occupied word
    /// count) rather than the cell's raw value.
    pub fn call_when(
        &self,
        master: &mut MasterLoop,
        timeout: Option<Duration>,
        keep_waiting: impl Fn(T) -> bool + Clone + Send + 'static,
        on_done: impl FnMut(Outcome) + Send + 'static,
    ) {
        self.arm();
        let id = self.id();
        if let Some(timeout) = timeout {
            master.schedule_timer(id, timeout);
        }
        let this = self.clone();
        // Both closures are stashed in `Option`s rather than captured
        // directly: a re-arm needs to hand the predicate and the original
        // callback off to a *new* registration, which means moving them out
        // of this one - and a closure that moves a captured-by-value field
        // out of itself can only ever be `FnOnce`. Taking from an `Option`
        // mutates the capture in place instead of consuming it, so this
        // closure stays `FnMut` even though it only ever actually fires once.
        let mut keep_waiting_slot = Some(keep_waiting);
        let mut on_done_slot = Some(on_done);
        master.register(id, move |reason, master| {
            this.waitbits_word().store(0, SeqCst);
            let keep_waiting = keep_waiting_slot
                .take()
                .expect("asymmetric synchronic callback fired after completion");
            let mut on_done = on_done_slot
                .take()
                .expect("asymmetric synchronic callback fired after completion");
            match reason {
                CallbackReason::TimedOut => on_done(Outcome::TimedOut),
                CallbackReason::Satisfied => {
                    if !keep_waiting(this.load()) {
                        on_done(Outcome::Satisfied);
                    } else {
                        // Spurious for this predicate (another field or
                        // updater caused the notification); re-arm and keep
                        // watching.
                        this.call_when(master, None, keep_waiting, on_done);
                    }
                }
            }
        });
    }

    /// Master-only: invokes `cb` once `load() != baseline`, or once
    /// `timeout` elapses.
    pub fn call_when_updated(
        &self,
        master: &mut MasterLoop,
        baseline: T,
        timeout: Option<Duration>,
        cb: impl FnMut(Outcome) + Send + 'static,
    ) {
        self.call_when(master, timeout, move |cur| cur == baseline, cb);
    }

    /// Master-only: invokes `cb` once `load() == v`, or once `timeout`
    /// elapses.
    pub fn call_when_equals(
        &self,
        master: &mut MasterLoop,
        v: T,
        timeout: Option<Duration>,
        cb: impl FnMut(Outcome) + Send + 'static,
    ) {
        self.call_when(master, timeout, move |cur| cur != v, cb);
    }

    /// Master-only: invokes `cb` once `load() != v`, or once `timeout`
    /// elapses.
    pub fn call_when_not_equals(
        &self,
        master: &mut MasterLoop,
        v: T,
        timeout: Option<Duration>,
        cb: impl FnMut(Outcome) + Send + 'static,
    ) {
        self.call_when(master, timeout, move |cur| cur == v, cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as StdAtomicU32;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn worker_wait_observes_master_store() {
        let region = Arc::new(SharedRegion::new(64));
        let mut master = MasterLoop::new();
        let mailbox = master.mailbox();
        let cell = Arc::new(
            AsymmetricSynchronic::<u32>::init((*region).clone(), 0, 0, 1, mailbox).unwrap(),
        );
        let worker = {
            let cell = cell.clone();
            thread::spawn(move || cell.wait_for_equal(5, Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(30));
        cell.store(5);
        assert!(worker.join().unwrap().is_unparked());
    }

    #[test]
    fn master_callback_fires_once_on_update() {
        let region = Arc::new(SharedRegion::new(64));
        let mut master = MasterLoop::new();
        let mailbox = master.mailbox();
        let cell = Arc::new(
            AsymmetricSynchronic::<u32>::init((*region).clone(), 0, 0, 9, mailbox).unwrap(),
        );
        let fired = Arc::new(StdAtomicU32::new(0));
        let f = fired.clone();
        cell.call_when_updated(&mut master, 0, Some(Duration::from_secs(5)), move |reason| {
            assert_eq!(reason, CallbackReason::Satisfied);
            f.fetch_add(1, SeqCst);
        });

        let writer = {
            let cell = cell.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                cell.store(1);
            })
        };
        master.run_once();
        writer.join().unwrap();
        assert_eq!(fired.load(SeqCst), 1);
    }

    #[test]
    fn only_one_notification_in_flight_per_cell() {
        let region = Arc::new(SharedRegion::new(64));
        let mut master = MasterLoop::new();
        let mailbox = master.mailbox();
        let cell = Arc::new(
            AsymmetricSynchronic::<u32>::init((*region).clone(), 0, 0, 4, mailbox).unwrap(),
        );
        cell.call_when_updated(&mut master, 0, None, |_| {});

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let cell = cell.clone();
                thread::spawn(move || cell.add(1))
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }
        // Exactly one Notify should be queued, regardless of 8 concurrent
        // updaters: draining the loop once must not panic on an empty inbox
        // or double-fire the callback (run_once is a no-op past the first
        // successful dispatch because the registration is gone).
        master.run_once();
        master.run_once();
    }
}
