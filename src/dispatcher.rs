//! The parallel dispatcher (L9): a master that publishes one job at a time
//! into a shared reservation and releases an [`AsymmetricBarrier`] to hand it
//! to a fixed pool of workers, which claim ranges of an index space (or run
//! once each, for a broadcast) and loop back to the barrier when done.
//!
//! There is no worker-script loader or value-marshaling codec here: workers
//! register their own remote functions by name before starting their
//! dispatch loop (the in-process stand-in for "resolves in the worker's
//! global scope"), and argument/result payloads are opaque byte blocks the
//! caller has already encoded - this module only packs and copies them.

use crate::barrier::AsymmetricBarrier;
use crate::error::{Error, Result};
use crate::message::{Mailbox, MasterLoop};
use crate::region::SharedRegion;
use core::sync::atomic::Ordering::SeqCst;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

const OPCODE_NONE: u32 = 0;
const OPCODE_INVOKE: u32 = 1;
const OPCODE_BROADCAST: u32 = 2;
const OPCODE_EXIT: u32 = 3;

const NAME_MAX: usize = 64;
const OPCODE_OFFSET: usize = 0;
const ITEM_SIZE_OFFSET: usize = 4;
const NAME_LEN_OFFSET: usize = 8;
const NAME_BYTES_OFFSET: usize = 12;
const ITEMS_NEXT_OFFSET: usize = NAME_BYTES_OFFSET + NAME_MAX;
const ITEMS_LIMIT_OFFSET: usize = ITEMS_NEXT_OFFSET + 4;
const ARGS_LEN_OFFSET: usize = ITEMS_LIMIT_OFFSET + 4;
const HEADER_BYTES: usize = ARGS_LEN_OFFSET + 4;
// Matches `<AsymmetricBarrier as Layout>::BYTES`.
const BARRIER_BYTES: usize = 8;

/// Bytes the dispatcher's reservation (header, scratch, barrier) needs.
/// `scratch_bytes` should be a multiple of 4; it is used as-is to place the
/// barrier immediately after it.
pub const fn bytes_needed(scratch_bytes: usize) -> usize {
    HEADER_BYTES + scratch_bytes + BARRIER_BYTES
}

fn validate(region: &SharedRegion, base: usize, scratch_bytes: usize) -> Result<()> {
    if base % 4 != 0 {
        return Err(Error::BadLayout {
            offset: base,
            bytes: bytes_needed(scratch_bytes),
            align: 4,
        });
    }
    let total = bytes_needed(scratch_bytes);
    if base.checked_add(total).map_or(true, |end| end > region.len()) {
        return Err(Error::OutOfBounds {
            offset: base,
            bytes: total,
            region_len: region.len(),
        });
    }
    Ok(())
}

/// An index space an [`MasterPar::invoke`] call fans out over.
pub enum IndexSpace {
    /// A 1D range `[0, n)`.
    OneD(u32),
    /// A 2D range `[0, n) x [0, m)`, the Cartesian product of two 1D slicings.
    TwoD(u32, u32),
}

/// The claimed range (or worker identity, for a broadcast) a remote function
/// is invoked with.
#[derive(Debug, Clone, Copy)]
pub enum Item {
    /// `[lo0, hi0)` of a 1D index space.
    OneD {
        /// Inclusive lower bound of the claimed range.
        lo0: u32,
        /// Exclusive upper bound of the claimed range.
        hi0: u32,
    },
    /// `[lo0, hi0) x [lo1, hi1)` of a 2D index space.
    TwoD {
        /// Inclusive lower bound on the first axis.
        lo0: u32,
        /// Exclusive upper bound on the first axis.
        hi0: u32,
        /// Inclusive lower bound on the second axis.
        lo1: u32,
        /// Exclusive upper bound on the second axis.
        hi1: u32,
    },
    /// A broadcast call, identified by which worker is running it.
    Broadcast {
        /// Stable identifier of the worker running this call.
        worker_id: u32,
    },
}

/// A function a worker has registered under a name the master can invoke by.
pub type RemoteFn = Arc<dyn Fn(Item, &[u8]) + Send + Sync>;

/// Slices `[0, n)` into `tiles` near-equal pieces, the leading `n mod tiles`
/// of them one element larger than the rest.
fn tiles_1d(n: u32, tiles: u32) -> Vec<(u32, u32)> {
    if tiles == 0 {
        return Vec::new();
    }
    let base = n / tiles;
    let rem = n % tiles;
    let mut out = Vec::with_capacity(tiles as usize);
    let mut cursor = 0;
    for t in 0..tiles {
        let size = base + u32::from(t < rem);
        out.push((cursor, cursor + size));
        cursor += size;
    }
    out
}

/// Read/write access to the fixed-layout reservation: shared by the master
/// (which writes the header and scratch area) and every worker (which only
/// ever reads the header/scratch and claims ranges via `items_next`).
struct ReservationView {
    region: SharedRegion,
    base: usize,
}

impl ReservationView {
    fn opcode_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + OPCODE_OFFSET)
    }
    fn item_size_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + ITEM_SIZE_OFFSET)
    }
    fn name_len_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + NAME_LEN_OFFSET)
    }
    fn items_next_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + ITEMS_NEXT_OFFSET)
    }
    fn items_limit_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + ITEMS_LIMIT_OFFSET)
    }
    fn args_len_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + ARGS_LEN_OFFSET)
    }
    fn scratch_base(&self) -> usize {
        self.base + HEADER_BYTES
    }
    fn item_word(&self, word_index: u32) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.scratch_base() + word_index as usize * 4)
    }

    fn check_fits(&self, name_len: usize, items_words: usize, args_len: usize, scratch_bytes: usize) -> Result<()> {
        if name_len > NAME_MAX {
            return Err(Error::NotEnoughScratch {
                needed: name_len,
                available: NAME_MAX,
            });
        }
        let needed = items_words * 4 + args_len;
        if needed > scratch_bytes {
            return Err(Error::NotEnoughScratch {
                needed,
                available: scratch_bytes,
            });
        }
        Ok(())
    }

    fn write_job(&self, opcode: u32, item_size: u32, name: &str, items: &[u32], args: &[u8]) {
        self.name_len_word().store(name.len() as u32, SeqCst);
        self.region
            .write_bytes(self.base + NAME_BYTES_OFFSET, name.as_bytes())
            .expect("name fits: checked by check_fits at submit time");
        for (i, word) in items.iter().enumerate() {
            self.item_word(i as u32).store(*word, SeqCst);
        }
        self.items_next_word().store(0, SeqCst);
        self.items_limit_word().store(items.len() as u32, SeqCst);
        self.args_len_word().store(args.len() as u32, SeqCst);
        self.region
            .write_bytes(self.scratch_base() + items.len() * 4, args)
            .expect("args fit: checked by check_fits at submit time");
        self.item_size_word().store(item_size, SeqCst);
        self.opcode_word().store(opcode, SeqCst);
    }

    fn read_name(&self) -> String {
        let len = self.name_len_word().load(SeqCst) as usize;
        let bytes = self
            .region
            .read_bytes(self.base + NAME_BYTES_OFFSET, len)
            .expect("name_len was written within bounds");
        String::from_utf8(bytes).expect("names are ASCII/UTF-8 by construction")
    }

    fn read_args(&self) -> Vec<u8> {
        let items_limit = self.items_limit_word().load(SeqCst) as usize;
        let args_len = self.args_len_word().load(SeqCst) as usize;
        self.region
            .read_bytes(self.scratch_base() + items_limit * 4, args_len)
            .expect("args_len was written within bounds")
    }
}

struct PendingJob {
    opcode: u32,
    item_size: u32,
    name: String,
    items: Vec<u32>,
    args: Vec<u8>,
    on_done: Box<dyn FnMut(&mut MasterLoop) + Send>,
}

struct Shared {
    view: ReservationView,
    scratch_bytes: usize,
    num_workers: u32,
    known_remotes: HashSet<String>,
    barrier: AsymmetricBarrier,
    pending: Mutex<VecDeque<PendingJob>>,
    in_flight: Mutex<Option<Box<dyn FnMut(&mut MasterLoop) + Send>>>,
    ready: Mutex<Option<Box<dyn FnMut(&mut MasterLoop) + Send>>>,
}

impl Shared {
    fn start(&self, job: PendingJob) {
        self.view.write_job(job.opcode, job.item_size, &job.name, &job.items, &job.args);
        *self.in_flight.lock().unwrap() = Some(job.on_done);
    }
}

/// The master side of the dispatcher: owns the reservation's header, the
/// in-flight/pending job bookkeeping, and the [`MasterLoop`] that drives
/// completion callbacks.
///
/// Per the scheduling model, the master never blocks: [`MasterPar::invoke`],
/// [`MasterPar::broadcast`], and [`MasterPar::eval`] return immediately,
/// queueing behind whatever job is already running; [`MasterPar::pump`] must
/// be called repeatedly (from the master's own event loop) to let completions
/// and the next queued job's activation actually happen.
pub struct MasterPar {
    shared: Arc<Shared>,
    master_loop: MasterLoop,
}

impl MasterPar {
    /// Initializes a dispatcher for `num_workers` workers, with `scratch_bytes`
    /// of packing room for the largest job's items-plus-args, tagged with
    /// `dispatcher_id` for its internal barrier. `remote_names` is the fixed
    /// catalog of function names workers are expected to register (the
    /// in-process stand-in for a dynamically loaded worker script); `invoke`/
    /// `broadcast` calls for names outside it fail fast with
    /// [`Error::UnknownRemote`] rather than waiting on a worker round-trip.
    /// `ready_cb` fires once, the first time all workers have reached the
    /// barrier.
    pub fn new(
        region: SharedRegion,
        base: usize,
        num_workers: u32,
        scratch_bytes: usize,
        dispatcher_id: u32,
        remote_names: &[&str],
        ready_cb: impl FnMut(&mut MasterLoop) + Send + 'static,
    ) -> Result<Self> {
        validate(&region, base, scratch_bytes)?;
        let mut master_loop = MasterLoop::new();
        let mailbox = master_loop.mailbox();
        let barrier_base = base + HEADER_BYTES + scratch_bytes;
        let barrier = AsymmetricBarrier::init(region.clone(), barrier_base, num_workers, dispatcher_id, mailbox)?;
        let view = ReservationView {
            region: region.clone(),
            base,
        };
        view.opcode_word().store(OPCODE_NONE, SeqCst);
        let shared = Arc::new(Shared {
            view,
            scratch_bytes,
            num_workers,
            known_remotes: remote_names.iter().map(|s| s.to_string()).collect(),
            barrier,
            pending: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(None),
            ready: Mutex::new(Some(Box::new(ready_cb))),
        });
        Self::install_callback(shared.clone(), &mut master_loop);
        Ok(Self { shared, master_loop })
    }

    fn install_callback(shared: Arc<Shared>, master_loop: &mut MasterLoop) {
        let id = shared.barrier.id();
        master_loop.register(id, move |_reason, master_loop| {
            let finished = shared.in_flight.lock().unwrap().take();
            match finished {
                Some(mut cb) => cb(master_loop),
                None => {
                    if let Some(mut ready) = shared.ready.lock().unwrap().take() {
                        ready(master_loop);
                    }
                }
            }
            match shared.pending.lock().unwrap().pop_front() {
                Some(job) => shared.start(job),
                None => shared.view.opcode_word().store(OPCODE_NONE, SeqCst),
            }
            shared.barrier.release();
            Self::install_callback(shared.clone(), master_loop);
        });
    }

    /// A cloneable handle workers' own [`AsymmetricBarrier`] send
    /// `BarrierArrived` through.
    pub fn mailbox(&self) -> Mailbox {
        self.master_loop.mailbox()
    }

    /// Drives this dispatcher's event loop by one step; see
    /// [`MasterLoop::run_once`].
    pub fn pump(&mut self) -> bool {
        self.master_loop.run_once()
    }

    /// Queues `job` behind whatever is already pending. Jobs are only ever
    /// written into the reservation and released from inside the barrier's
    /// completion callback (never from here directly): that callback is the
    /// only code that can be sure every worker is actually parked in
    /// `enter()` right now, so it's the only code that may safely publish
    /// the next opcode. This costs one idle round-trip when the dispatcher
    /// has nothing in flight and workers are spinning on `OPCODE_NONE`, in
    /// exchange for never racing a worker's opcode read against the
    /// master's write.
    fn submit(&self, job: PendingJob) -> Result<()> {
        self.shared
            .view
            .check_fits(job.name.len(), job.items.len(), job.args.len(), self.shared.scratch_bytes)?;
        if job.opcode != OPCODE_EXIT && !self.shared.known_remotes.contains(&job.name) {
            return Err(Error::UnknownRemote(job.name));
        }
        self.shared.pending.lock().unwrap().push_back(job);
        Ok(())
    }

    /// Invokes `name` once per claimed tile of `index_space`, `4 *
    /// num_workers` tiles sliced as evenly as possible (any remainder going
    /// to the leading tiles). `on_done` fires once every worker has returned
    /// to the barrier having exhausted the index space.
    pub fn invoke(
        &self,
        on_done: impl FnMut(&mut MasterLoop) + Send + 'static,
        name: impl Into<String>,
        index_space: IndexSpace,
        args: Vec<u8>,
    ) -> Result<()> {
        let tiles_per_axis = 4 * self.shared.num_workers.max(1);
        let (item_size, items) = match index_space {
            IndexSpace::OneD(n) => {
                let mut words = Vec::new();
                for (lo, hi) in tiles_1d(n, tiles_per_axis) {
                    words.push(lo);
                    words.push(hi);
                }
                (2, words)
            }
            IndexSpace::TwoD(n, m) => {
                let tx = tiles_1d(n, tiles_per_axis);
                let ty = tiles_1d(m, tiles_per_axis);
                let mut words = Vec::with_capacity(tx.len() * ty.len() * 4);
                for (lo0, hi0) in &tx {
                    for (lo1, hi1) in &ty {
                        words.extend_from_slice(&[*lo0, *hi0, *lo1, *hi1]);
                    }
                }
                (4, words)
            }
        };
        self.submit(PendingJob {
            opcode: OPCODE_INVOKE,
            item_size,
            name: name.into(),
            items,
            args,
            on_done: Box::new(on_done),
        })
    }

    /// Invokes `name` exactly once per worker, with no range to claim.
    pub fn broadcast(
        &self,
        on_done: impl FnMut(&mut MasterLoop) + Send + 'static,
        name: impl Into<String>,
        args: Vec<u8>,
    ) -> Result<()> {
        self.submit(PendingJob {
            opcode: OPCODE_BROADCAST,
            item_size: 0,
            name: name.into(),
            items: Vec::new(),
            args,
            on_done: Box::new(on_done),
        })
    }

    /// Broadcasts `source` to every worker's registered `"eval"` remote.
    /// This crate carries no script interpreter, so unlike the system this
    /// dispatcher is modeled on, `source` is opaque bytes; whatever a
    /// worker's own `"eval"` function does with them is up to that function.
    pub fn eval(&self, on_done: impl FnMut(&mut MasterLoop) + Send + 'static, source: Vec<u8>) -> Result<()> {
        self.broadcast(on_done, "eval", source)
    }

    /// Tells every worker to leave its dispatch loop once the current job (if
    /// any) finishes, so their threads can be joined. No further `invoke`/
    /// `broadcast`/`eval` call is valid once this has been submitted.
    pub fn shutdown(&self) -> Result<()> {
        self.submit(PendingJob {
            opcode: OPCODE_EXIT,
            item_size: 0,
            name: String::new(),
            items: Vec::new(),
            args: Vec::new(),
            on_done: Box::new(|_| {}),
        })
    }
}

/// The worker side: enters the dispatcher's barrier in a loop, claiming
/// index-space ranges (or running once, for a broadcast) against whichever
/// remote function the job names.
pub struct WorkerPar {
    view: ReservationView,
    barrier: AsymmetricBarrier,
    worker_id: u32,
    registry: HashMap<String, RemoteFn>,
}

impl WorkerPar {
    /// Attaches to a dispatcher another agent (the master) already
    /// initialized, as worker `worker_id` of `num_workers`.
    pub fn new(
        region: SharedRegion,
        base: usize,
        num_workers: u32,
        scratch_bytes: usize,
        dispatcher_id: u32,
        worker_id: u32,
        mailbox: Mailbox,
    ) -> Result<Self> {
        let barrier_base = base + HEADER_BYTES + scratch_bytes;
        let barrier = AsymmetricBarrier::at(region.clone(), barrier_base, num_workers, dispatcher_id, mailbox)?;
        Ok(Self {
            view: ReservationView { region, base },
            barrier,
            worker_id,
            registry: HashMap::new(),
        })
    }

    /// Registers `f` under `name`, the in-process stand-in for resolving a
    /// name in the worker's global scope.
    pub fn register(&mut self, name: impl Into<String>, f: RemoteFn) {
        self.registry.insert(name.into(), f);
    }

    /// Whether `message` is a dispatcher control message this worker
    /// consumes itself. Kept for interface parity with the original
    /// message-forwarding worker loop; in this rewrite all dispatcher
    /// coordination goes through the barrier and the shared reservation, so
    /// this never consumes anything.
    pub fn dispatch(&self, _message: &crate::message::Message) -> bool {
        false
    }

    fn run_invoke(&self, name: &str, item_size: u32, args: &[u8]) {
        let f = match self.registry.get(name) {
            Some(f) => f.clone(),
            None => return,
        };
        loop {
            let idx = self.view.items_next_word().fetch_add(item_size, SeqCst);
            let limit = self.view.items_limit_word().load(SeqCst);
            if idx >= limit {
                return;
            }
            let item = match item_size {
                2 => Item::OneD {
                    lo0: self.view.item_word(idx).load(SeqCst),
                    hi0: self.view.item_word(idx + 1).load(SeqCst),
                },
                4 => Item::TwoD {
                    lo0: self.view.item_word(idx).load(SeqCst),
                    hi0: self.view.item_word(idx + 1).load(SeqCst),
                    lo1: self.view.item_word(idx + 2).load(SeqCst),
                    hi1: self.view.item_word(idx + 3).load(SeqCst),
                },
                other => unreachable!("item_size is always 2 or 4, got {other}"),
            };
            f(item, args);
        }
    }

    fn run_broadcast(&self, name: &str, args: &[u8]) {
        if let Some(f) = self.registry.get(name) {
            f.clone()(Item::Broadcast { worker_id: self.worker_id }, args);
        }
    }

    /// Loops: enter the barrier, act on whatever opcode the master published,
    /// and repeat, until the master publishes `EXIT`.
    pub fn run(&self) {
        loop {
            self.barrier.enter();
            match self.view.opcode_word().load(SeqCst) {
                OPCODE_EXIT => return,
                OPCODE_INVOKE => {
                    let name = self.view.read_name();
                    let item_size = self.view.item_size_word().load(SeqCst);
                    let args = self.view.read_args();
                    self.run_invoke(&name, item_size, &args);
                }
                OPCODE_BROADCAST => {
                    let name = self.view.read_name();
                    let args = self.view.read_args();
                    self.run_broadcast(&name, &args);
                }
                _ => {}
            }
        }
    }
}


#[cfg(test)]
mod proptests {
    use super::tiles_1d;
    use proptest::prelude::*;

    proptest! {
        /// Every element of `[0, n)` lands in exactly one tile, tiles never
        /// differ in size by more than one, and the larger tiles always come
        /// first - true for any `n` and any tile count, not just the fixed
        /// grid sizes the dispatcher's own integration tests use.
        #[test]
        fn tiling_covers_every_index_exactly_once(n in 0u32..5000, tiles in 1u32..64) {
            let slices = tiles_1d(n, tiles);
            prop_assert_eq!(slices.len(), tiles as usize);

            let mut covered = vec![false; n as usize];
            let mut prev_size: Option<u32> = None;
            let mut cursor = 0u32;
            for (lo, hi) in slices {
                prop_assert_eq!(lo, cursor);
                prop_assert!(hi >= lo);
                let size = hi - lo;
                if let Some(prev) = prev_size {
                    prop_assert!(prev >= size, "leading tiles must not be smaller than later ones");
                }
                prev_size = Some(size);
                cursor = hi;
                for i in lo..hi {
                    prop_assert!(!covered[i as usize], "index {} claimed twice", i);
                    covered[i as usize] = true;
                }
            }
            prop_assert_eq!(cursor, n);
            prop_assert!(covered.into_iter().all(|c| c));
        }
    }
}
