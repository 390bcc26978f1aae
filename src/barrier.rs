//! Barriers (L4): a symmetric, fully-blocking barrier, and a master/worker
//! "asymmetric" barrier whose last-arrival notifies the master instead of
//! releasing the round itself.

use crate::message::{Mailbox, Message};
use crate::park::{self, ParkResult};
use crate::region::{Layout, SharedRegion};
use core::sync::atomic::Ordering::SeqCst;

const COUNTER_OFFSET: usize = 0;
const SEQ_OFFSET: usize = 4;

/// A reusable barrier where every party blocks in `enter` until the last
/// party arrives.
///
/// `counter` counts down from `parties` to 0 within a round; the arrival
/// that takes it to 0 restores `counter` to `parties`, bumps `seq`, and
/// wakes every other arrival, which had snapshotted `seq` before
/// decrementing and parked on it expecting that snapshot.
pub struct Barrier {
    region: SharedRegion,
    base: usize,
    parties: u32,
}

impl Layout for Barrier {
    const BYTES: usize = 8;
    const ALIGN: usize = 4;
}

impl Barrier {
    /// Initializes a new barrier for `parties` agents.
    pub fn init(region: SharedRegion, base: usize, parties: u32) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        let this = Self {
            region,
            base,
            parties,
        };
        this.counter().store(parties, SeqCst);
        this.seq().store(0, SeqCst);
        Ok(this)
    }

    /// Attaches to a barrier another agent already initialized.
    pub fn at(region: SharedRegion, base: usize, parties: u32) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self {
            region,
            base,
            parties,
        })
    }

    fn counter(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + COUNTER_OFFSET)
    }

    fn seq(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + SEQ_OFFSET)
    }

    /// Blocks until every one of `parties` agents has called `enter` for
    /// this round.
    pub fn enter(&self) {
        let snapshot = self.seq().load(SeqCst);
        let prev = self.counter().fetch_sub(1, SeqCst);
        if prev == 1 {
            self.counter().store(self.parties, SeqCst);
            self.seq().fetch_add(1, SeqCst);
            park::unpark_all(&self.region, self.base + SEQ_OFFSET);
            return;
        }
        loop {
            match park::park(&self.region, self.base + SEQ_OFFSET, snapshot, None) {
                ParkResult::Unparked | ParkResult::NotEqual => {
                    if self.seq().load(SeqCst) != snapshot {
                        return;
                    }
                    // spurious: seq hadn't actually moved yet, keep waiting.
                }
                ParkResult::TimedOut => unreachable!("enter() never passes a timeout"),
            }
        }
    }
}

/// A master/worker barrier: workers call [`AsymmetricBarrier::enter`]
/// exactly like [`Barrier::enter`], but the arrival that empties `counter`
/// posts a `BarrierArrived` message instead of releasing the round itself.
/// The master must call [`AsymmetricBarrier::release`] once it has reacted
/// to that message; every worker (including the one that triggered the
/// message) stays parked until then.
pub struct AsymmetricBarrier {
    region: SharedRegion,
    base: usize,
    parties: u32,
    id: u32,
    mailbox: Mailbox,
}

impl Layout for AsymmetricBarrier {
    const BYTES: usize = 8;
    const ALIGN: usize = 4;
}

impl AsymmetricBarrier {
    /// Initializes a new asymmetric barrier for `parties` workers, tagged
    /// with `id` for the `BarrierArrived` message it posts to `mailbox`.
    pub fn init(
        region: SharedRegion,
        base: usize,
        parties: u32,
        id: u32,
        mailbox: Mailbox,
    ) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        let this = Self {
            region,
            base,
            parties,
            id,
            mailbox,
        };
        this.counter().store(parties, SeqCst);
        this.seq().store(0, SeqCst);
        Ok(this)
    }

    /// Attaches to an asymmetric barrier another agent already initialized.
    pub fn at(
        region: SharedRegion,
        base: usize,
        parties: u32,
        id: u32,
        mailbox: Mailbox,
    ) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self {
            region,
            base,
            parties,
            id,
            mailbox,
        })
    }

    /// This barrier's stable identifier, for registering a callback against
    /// it in a [`crate::message::MasterLoop`].
    pub fn id(&self) -> u32 {
        self.id
    }

    fn counter(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + COUNTER_OFFSET)
    }

    fn seq(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + SEQ_OFFSET)
    }

    /// Worker side: blocks until [`AsymmetricBarrier::release`] ends this
    /// round. If this call is the one that brings every party in, it first
    /// posts `BarrierArrived` to the master's mailbox.
    pub fn enter(&self) {
        let snapshot = self.seq().load(SeqCst);
        let prev = self.counter().fetch_sub(1, SeqCst);
        if prev == 1 {
            let _ = self.mailbox.send(Message::BarrierArrived { id: self.id });
        }
        loop {
            match park::park(&self.region, self.base + SEQ_OFFSET, snapshot, None) {
                ParkResult::Unparked | ParkResult::NotEqual => {
                    if self.seq().load(SeqCst) != snapshot {
                        return;
                    }
                }
                ParkResult::TimedOut => unreachable!("enter() never passes a timeout"),
            }
        }
    }

    /// Master side: ends the round if every party has arrived (`counter ==
    /// 0`), restoring `counter`, bumping `seq`, and waking every worker.
    /// Returns `false` without side effects if not every party has arrived
    /// yet (e.g. a stale or duplicate call).
    pub fn release(&self) -> bool {
        if self.counter().load(SeqCst) != 0 {
            return false;
        }
        self.counter().store(self.parties, SeqCst);
        self.seq().fetch_add(1, SeqCst);
        park::unpark_all(&self.region, self.base + SEQ_OFFSET);
        true
    }
}
