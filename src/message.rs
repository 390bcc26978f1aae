//! The out-of-band message channel from workers to the master, and the
//! single-threaded task runner that stands in for the master's "driven by
//! an event loop that dequeues messages and fires timers" scheduling model.
//!
//! Every primitive with a master-side callback ([`crate::barrier::AsymmetricBarrier`],
//! [`crate::asymmetric::AsymmetricSynchronic`], [`crate::dispatcher`]) posts
//! one of these [`Message`] variants instead of blocking, and the
//! [`MasterLoop`] the master owns is the only thing that ever calls back
//! into application code.

use std::collections::BinaryHeap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

/// A message posted by a worker (or by a timer firing) into the master's
/// inbox.
#[derive(Debug, Clone, Copy)]
pub enum Message {
    /// The last party of round has entered an [`crate::barrier::AsymmetricBarrier`]
    /// identified by `id`.
    BarrierArrived {
        /// Stable identifier of the barrier.
        id: u32,
    },
    /// An [`crate::asymmetric::AsymmetricSynchronic`] identified by `id` was
    /// mutated while a callback was registered on it.
    Notify {
        /// Stable identifier of the cell.
        id: u32,
    },
    /// A host timer registered through [`MasterLoop::schedule_timer`] fired.
    TimerFired {
        /// Identifier the timer was scheduled under.
        id: u32,
    },
}

/// The sending half every worker (and the master itself, for self-messages
/// like re-arming a timer) holds a clone of.
pub type Mailbox = Sender<Message>;

/// Reason a registered callback is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackReason {
    /// The predicate the callback was registered with is now satisfied.
    Satisfied,
    /// The registration's timeout elapsed first. Per the design, the first
    /// of {notification, timeout} to run wins and clears the registration.
    TimedOut,
}

type Callback = Box<dyn FnMut(CallbackReason, &mut MasterLoop) + Send>;

struct TimerEntry {
    deadline: Instant,
    id: u32,
    // Timers are identified by a monotonically increasing sequence number so
    // a cancelled-then-rescheduled id's stale entry can be told apart from
    // its live one.
    generation: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        // `BinaryHeap` is a max-heap; we want the earliest deadline first.
        other.deadline.cmp(&self.deadline)
    }
}

/// The master's cooperative event loop: a map from cell/barrier id to its
/// registered callback, plus a timer wheel, draining one inbox.
///
/// This is the "portable realization" of the callback-driven master
/// described in the design notes: a single-threaded task runner that owns
/// `{cell_id -> callback}` and drains an inbound message queue. The master
/// never calls [`crate::park::park`] itself; the only blocking operation it
/// performs is waiting on its own inbox, bounded by the next timer
/// deadline.
pub struct MasterLoop {
    inbox: Receiver<Message>,
    mailbox: Mailbox,
    callbacks: std::collections::HashMap<u32, Callback>,
    timers: BinaryHeap<TimerEntry>,
    next_generation: u64,
    live_generation: std::collections::HashMap<u32, u64>,
}

impl MasterLoop {
    /// Creates a fresh event loop and its mailbox (clone this into every
    /// worker that needs to notify the master).
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            inbox: rx,
            mailbox: tx,
            callbacks: Default::default(),
            timers: BinaryHeap::new(),
            next_generation: 0,
            live_generation: Default::default(),
        }
    }

    /// A cloneable handle workers use to post [`Message`]s to this loop.
    pub fn mailbox(&self) -> Mailbox {
        self.mailbox.clone()
    }

    /// Registers (or replaces) the callback invoked for notifications
    /// tagged with `id`. Per the asymmetric-synchronic invariant, a cell may
    /// have at most one callback registration in flight.
    pub fn register(
        &mut self,
        id: u32,
        callback: impl FnMut(CallbackReason, &mut MasterLoop) + Send + 'static,
    ) {
        self.callbacks.insert(id, Box::new(callback));
    }

    /// Removes any registration for `id` without invoking it.
    pub fn unregister(&mut self, id: u32) {
        self.callbacks.remove(&id);
        self.live_generation.remove(&id);
    }

    /// Schedules a timer that posts `TimerFired { id }` to this loop's own
    /// inbox after `delay`. Scheduling a new timer under an `id` that
    /// already has one pending invalidates the old one.
    pub fn schedule_timer(&mut self, id: u32, delay: Duration) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.live_generation.insert(id, generation);
        self.timers.push(TimerEntry {
            deadline: Instant::now() + delay,
            id,
            generation,
        });
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.timers.peek().map(|t| t.deadline)
    }

    fn pop_due_timers(&mut self, into: &mut Vec<u32>) {
        let now = Instant::now();
        while let Some(top) = self.timers.peek() {
            if top.deadline > now {
                break;
            }
            let top = self.timers.pop().unwrap();
            if self.live_generation.get(&top.id) == Some(&top.generation) {
                into.push(top.id);
            }
        }
    }

    /// Runs one iteration: fires any due timers, then waits for either the
    /// next message or the next timer deadline (whichever comes first),
    /// dispatching at most one message to its registered callback.
    ///
    /// Returns `true` if any work (a timer firing or a message dispatch)
    /// happened, so callers can distinguish "idle tick" from "did something"
    /// without a separate polling API.
    pub fn run_once(&mut self) -> bool {
        let mut fired = Vec::new();
        self.pop_due_timers(&mut fired);
        let mut did_work = !fired.is_empty();
        for id in fired {
            self.live_generation.remove(&id);
            if let Some(mut cb) = self.callbacks.remove(&id) {
                cb(CallbackReason::TimedOut, self);
            }
        }

        let wait = match self.next_deadline() {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::from_millis(50),
        };
        match self.inbox.recv_timeout(wait) {
            Ok(Message::Notify { id }) | Ok(Message::BarrierArrived { id }) => {
                self.live_generation.remove(&id);
                if let Some(mut cb) = self.callbacks.remove(&id) {
                    cb(CallbackReason::Satisfied, self);
                    did_work = true;
                }
            }
            Ok(Message::TimerFired { id }) => {
                self.live_generation.remove(&id);
                if let Some(mut cb) = self.callbacks.remove(&id) {
                    cb(CallbackReason::TimedOut, self);
                    did_work = true;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {}
        }
        did_work
    }

    /// Drives [`MasterLoop::run_once`] until `stop` returns `true`.
    pub fn run_until(&mut self, mut stop: impl FnMut() -> bool) {
        while !stop() {
            self.run_once();
        }
    }
}

impl Default for MasterLoop {
    fn default() -> Self {
        Self::new()
    }
}
