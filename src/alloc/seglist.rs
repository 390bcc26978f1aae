//! The segregated-freelist allocator (L8): a spinlock-guarded global pool of
//! 4096-byte blocks feeding per-agent size-segregated object freelists.
//!
//! Two tiers, per the data model: [`BlockPool`] is the global,
//! address-coalescing block allocator every agent shares through a
//! spinlock; [`SegList`] is the per-agent object allocator built on top of
//! it, with its own freelists, a refill budget, and a freed-bytes-triggered
//! coalesce pass.

use crate::agent::NONE;
use crate::error::{Error, Result};
use crate::region::{Layout, SharedRegion};
use core::sync::atomic::Ordering::SeqCst;

/// Size of a block handed out by the global pool.
pub const BLOCK_SIZE: u32 = 4096;
const NUMGLISTS: usize = 8;
const NUMLLISTS: usize = 22;
const HEADER_BYTES: u32 = 8;
const MIN_OBJECT: u32 = 16;
const ALLOC_POISON: u32 = 0xA110_C000;
const FREE_POISON: u32 = 0xF4EE_0000;
const BLOCK_BUDGET_INIT: u32 = 16;
const COALESCE_THRESHOLD_BYTES: u32 = 4 * BLOCK_SIZE;

const ALL_CLASSES: [u32; NUMLLISTS] = [
    16, 24, 32, 40, 48, 56, 64, 72, 80, 88, 96, 104, 112, 120, 128, 256, 384, 512, 640, 768, 896,
    1024,
];

fn ceil_class_index(size: u32) -> usize {
    ALL_CLASSES
        .iter()
        .position(|&c| c >= size)
        .unwrap_or(NUMLLISTS - 1)
}

fn floor_class_index(size: u32) -> usize {
    let mut idx = 0;
    for (i, &c) in ALL_CLASSES.iter().enumerate() {
        if c <= size {
            idx = i;
        } else {
            break;
        }
    }
    idx
}

fn bucket_for_blocks(blocks: u32) -> usize {
    if blocks <= 1 {
        0
    } else {
        ((32 - (blocks - 1).leading_zeros()) as usize).min(NUMGLISTS - 1)
    }
}

const SPIN_OFFSET: usize = 0;
const HEADS_OFFSET: usize = 4;
const ARENA_TOP_OFFSET: usize = HEADS_OFFSET + NUMGLISTS * 4;

fn spin_acquire(word: &core::sync::atomic::AtomicU32) {
    while word.compare_exchange_weak(0, 1, SeqCst, SeqCst).is_err() {
        core::hint::spin_loop();
    }
}

fn spin_release(word: &core::sync::atomic::AtomicU32) {
    word.store(0, SeqCst);
}

/// The global pool of 4096-byte blocks, address-coalescing on free.
///
/// Free blocks carry their own two-word `{size_in_blocks, next}` header
/// written into the block's own bytes, the same "free objects double as
/// their own list nodes" trick as the park table and the list-based mutex.
pub struct BlockPool {
    region: SharedRegion,
    base: usize,
    arena_base: u32,
    arena_limit: u32,
}

impl Layout for BlockPool {
    const BYTES: usize = (NUMGLISTS + 1 + 1) * 4;
    const ALIGN: usize = 4;
}

impl BlockPool {
    /// Initializes an empty pool whose blocks are minted from
    /// `[arena_base, arena_base + arena_bytes)` as address-coalesced
    /// freelists run dry. `arena_base` must be block-aligned.
    pub fn init(
        region: SharedRegion,
        base: usize,
        arena_base: u32,
        arena_bytes: u32,
    ) -> Result<Self> {
        region.validate::<Self>(base)?;
        debug_assert_eq!(arena_base % BLOCK_SIZE, 0);
        let this = Self {
            region,
            base,
            arena_base,
            arena_limit: arena_base + arena_bytes,
        };
        this.spin().store(0, SeqCst);
        for i in 0..NUMGLISTS {
            this.head_word(i).store(NONE, SeqCst);
        }
        this.arena_top().store(arena_base, SeqCst);
        Ok(this)
    }

    /// Attaches to a pool another agent already initialized.
    pub fn at(region: SharedRegion, base: usize, arena_base: u32, arena_bytes: u32) -> Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self {
            region,
            base,
            arena_base,
            arena_limit: arena_base + arena_bytes,
        })
    }

    fn spin(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + SPIN_OFFSET)
    }
    fn head_word(&self, bucket: usize) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + HEADS_OFFSET + bucket * 4)
    }
    fn arena_top(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + ARENA_TOP_OFFSET)
    }

    fn block_size_word(&self, block_base: u32) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(block_base as usize)
    }
    fn block_next_word(&self, block_base: u32) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(block_base as usize + 4)
    }

    fn unlink(&self, bucket: usize, target: u32) {
        let mut prev = NONE;
        let mut cur = self.head_word(bucket).load(SeqCst);
        while cur != NONE {
            let next = self.block_next_word(cur).load(SeqCst);
            if cur == target {
                if prev == NONE {
                    self.head_word(bucket).store(next, SeqCst);
                } else {
                    self.block_next_word(prev).store(next, SeqCst);
                }
                return;
            }
            prev = cur;
            cur = next;
        }
    }

    fn push(&self, block_base: u32, size_in_blocks: u32) {
        let bucket = bucket_for_blocks(size_in_blocks);
        self.block_size_word(block_base).store(size_in_blocks, SeqCst);
        self.block_next_word(block_base)
            .store(self.head_word(bucket).load(SeqCst), SeqCst);
        self.head_word(bucket).store(block_base, SeqCst);
    }

    /// Detaches `k` contiguous blocks from the pool (splitting a larger free
    /// block, or minting fresh ones from the arena, as needed).
    pub fn alloc_blocks(&self, k: u32) -> Result<u32> {
        spin_acquire(self.spin());
        for bucket in bucket_for_blocks(k)..NUMGLISTS {
            let mut cur = self.head_word(bucket).load(SeqCst);
            while cur != NONE {
                let size = self.block_size_word(cur).load(SeqCst);
                if size >= k {
                    self.unlink(bucket, cur);
                    if size > k {
                        self.push(cur + k * BLOCK_SIZE, size - k);
                    }
                    spin_release(self.spin());
                    return Ok(cur);
                }
                cur = self.block_next_word(cur).load(SeqCst);
            }
        }
        let top = self.arena_top().load(SeqCst);
        let new_top = top + k * BLOCK_SIZE;
        if new_top > self.arena_limit {
            spin_release(self.spin());
            return Err(Error::OutOfMemory);
        }
        self.arena_top().store(new_top, SeqCst);
        spin_release(self.spin());
        Ok(top)
    }

    /// Returns `k` contiguous blocks starting at `addr`, merging with an
    /// adjacent free neighbor whenever one is found (repeated until no
    /// further merge is possible).
    pub fn free_blocks(&self, addr: u32, k: u32) {
        spin_acquire(self.spin());
        let mut base = addr;
        let mut size = k;
        loop {
            let mut merged = None;
            'search: for bucket in 0..NUMGLISTS {
                let mut cur = self.head_word(bucket).load(SeqCst);
                while cur != NONE {
                    let cur_size = self.block_size_word(cur).load(SeqCst);
                    if cur + cur_size * BLOCK_SIZE == base {
                        merged = Some((bucket, cur, cur, cur_size));
                        break 'search;
                    }
                    if base + size * BLOCK_SIZE == cur {
                        merged = Some((bucket, cur, base, cur_size));
                        break 'search;
                    }
                    cur = self.block_next_word(cur).load(SeqCst);
                }
            }
            match merged {
                Some((bucket, unlink_target, new_base, extra_size)) => {
                    self.unlink(bucket, unlink_target);
                    base = new_base.min(base);
                    size += extra_size;
                }
                None => break,
            }
        }
        self.push(base, size);
        spin_release(self.spin());
    }
}

const RECORD_WORDS: usize = NUMLLISTS + 2; // heads + block_budget + freed_bytes
const RECORD_BYTES: usize = RECORD_WORDS * 4;
const BUDGET_WORD: usize = NUMLLISTS;
const FREED_BYTES_WORD: usize = NUMLLISTS + 1;

/// A per-agent small-object allocator layered over a shared [`BlockPool`].
pub struct SegList {
    blocks: BlockPool,
    region: SharedRegion,
    agents_base: usize,
    capacity: u32,
}

impl SegList {
    /// Bytes the per-agent record table needs for `capacity` agents (in
    /// addition to the [`BlockPool`]'s own `(NUMGLISTS+1+1)*4`-byte header).
    pub const fn agent_table_bytes(capacity: u32) -> usize {
        capacity as usize * RECORD_BYTES
    }

    /// Initializes a fresh allocator: a [`BlockPool`] at `pool_base` and an
    /// empty per-agent record table at `agents_base` for up to `capacity`
    /// agents.
    pub fn init(
        region: SharedRegion,
        pool_base: usize,
        agents_base: usize,
        capacity: u32,
        arena_base: u32,
        arena_bytes: u32,
    ) -> Result<Self> {
        let blocks = BlockPool::init(region.clone(), pool_base, arena_base, arena_bytes)?;
        let table_bytes = Self::agent_table_bytes(capacity);
        if agents_base % 4 != 0 {
            return Err(Error::BadLayout {
                offset: agents_base,
                bytes: table_bytes,
                align: 4,
            });
        }
        if agents_base
            .checked_add(table_bytes)
            .map_or(true, |end| end > region.len())
        {
            return Err(Error::OutOfBounds {
                offset: agents_base,
                bytes: table_bytes,
                region_len: region.len(),
            });
        }
        let this = Self {
            blocks,
            region,
            agents_base,
            capacity,
        };
        for id in 0..capacity {
            for w in 0..NUMLLISTS {
                this.head_word(id, w).store(NONE, SeqCst);
            }
            this.budget_word(id).store(BLOCK_BUDGET_INIT, SeqCst);
            this.freed_bytes_word(id).store(0, SeqCst);
        }
        Ok(this)
    }

    /// Attaches to an allocator another agent already initialized.
    pub fn at(
        region: SharedRegion,
        pool_base: usize,
        agents_base: usize,
        capacity: u32,
        arena_base: u32,
        arena_bytes: u32,
    ) -> Result<Self> {
        let blocks = BlockPool::at(region.clone(), pool_base, arena_base, arena_bytes)?;
        Ok(Self {
            blocks,
            region,
            agents_base,
            capacity,
        })
    }

    fn record_base(&self, id: u32) -> usize {
        debug_assert!(id < self.capacity);
        self.agents_base + id as usize * RECORD_BYTES
    }
    fn head_word(&self, id: u32, list: usize) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.record_base(id) + list * 4)
    }
    fn budget_word(&self, id: u32) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.record_base(id) + BUDGET_WORD * 4)
    }
    fn freed_bytes_word(&self, id: u32) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.record_base(id) + FREED_BYTES_WORD * 4)
    }

    fn object_size_word(&self, base: u32) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(base as usize)
    }
    fn object_poison_word(&self, base: u32) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(base as usize + 4)
    }
    fn object_next_word(&self, base: u32) -> &core::sync::atomic::AtomicU32 {
        // Reuses the (unused while free) payload's first word as the
        // freelist link, same convention as `BlockPool`'s in-place headers.
        self.region.atomic_u32(base as usize + HEADER_BYTES as usize)
    }

    fn pop_llist(&self, id: u32, list: usize) -> Option<u32> {
        let head = self.head_word(id, list).load(SeqCst);
        if head == NONE {
            return None;
        }
        let next = self.object_next_word(head).load(SeqCst);
        self.head_word(id, list).store(next, SeqCst);
        Some(head)
    }

    fn push_llist(&self, id: u32, list: usize, base: u32) {
        self.object_next_word(base)
            .store(self.head_word(id, list).load(SeqCst), SeqCst);
        self.head_word(id, list).store(base, SeqCst);
    }

    fn refill(&self, id: u32) -> Result<()> {
        if self.budget_word(id).load(SeqCst) == 0 {
            self.coalesce(id);
            self.budget_word(id).store(BLOCK_BUDGET_INIT, SeqCst);
        }
        let block = self.blocks.alloc_blocks(1)?;
        self.budget_word(id).fetch_sub(1, SeqCst);
        let class = ALL_CLASSES[NUMLLISTS - 1];
        let chunks = BLOCK_SIZE / class;
        for i in 0..chunks {
            let base = block + i * class;
            self.object_size_word(base).store(class, SeqCst);
            self.object_poison_word(base).store(FREE_POISON, SeqCst);
            self.push_llist(id, NUMLLISTS - 1, base);
        }
        Ok(())
    }

    fn alloc_large(&self, total: u32) -> Result<u32> {
        let blocks_needed = total.div_ceil(BLOCK_SIZE);
        let base = self.blocks.alloc_blocks(blocks_needed)?;
        self.object_size_word(base).store(total, SeqCst);
        self.object_poison_word(base).store(ALLOC_POISON, SeqCst);
        Ok(base + HEADER_BYTES)
    }

    /// Allocates at least `n_bytes` for agent `id`, returning the payload
    /// offset (past the object's header), or `0` if the pool is exhausted.
    pub fn alloc(&self, id: u32, n_bytes: u32) -> u32 {
        let total = (n_bytes + HEADER_BYTES).max(MIN_OBJECT);
        if total > ALL_CLASSES[NUMLLISTS - 1] {
            return self.alloc_large(total).unwrap_or(0);
        }
        let idx = ceil_class_index(total);
        let class_size = ALL_CLASSES[idx];

        if let Some(base) = self.pop_llist(id, idx) {
            self.object_size_word(base).store(class_size, SeqCst);
            self.object_poison_word(base).store(ALLOC_POISON, SeqCst);
            return base + HEADER_BYTES;
        }
        for j in (idx + 1)..NUMLLISTS {
            if let Some(base) = self.pop_llist(id, j) {
                let bigger = ALL_CLASSES[j];
                let remainder = bigger - class_size;
                let allocated_size = if remainder >= MIN_OBJECT {
                    let rem_base = base + class_size;
                    let rem_idx = floor_class_index(remainder);
                    self.object_size_word(rem_base).store(remainder, SeqCst);
                    self.object_poison_word(rem_base).store(FREE_POISON, SeqCst);
                    self.push_llist(id, rem_idx, rem_base);
                    class_size
                } else {
                    bigger
                };
                self.object_size_word(base).store(allocated_size, SeqCst);
                self.object_poison_word(base).store(ALLOC_POISON, SeqCst);
                return base + HEADER_BYTES;
            }
        }
        if self.refill(id).is_err() {
            return 0;
        }
        // One retry: refill always seeds the top (1024-byte) bucket, which
        // the loop above would have reached had it not been empty.
        if let Some(base) = self.pop_llist(id, NUMLLISTS - 1) {
            let bigger = ALL_CLASSES[NUMLLISTS - 1];
            let remainder = bigger - class_size;
            let allocated_size = if remainder >= MIN_OBJECT {
                let rem_base = base + class_size;
                let rem_idx = floor_class_index(remainder);
                self.object_size_word(rem_base).store(remainder, SeqCst);
                self.object_poison_word(rem_base).store(FREE_POISON, SeqCst);
                self.push_llist(id, rem_idx, rem_base);
                class_size
            } else {
                bigger
            };
            self.object_size_word(base).store(allocated_size, SeqCst);
            self.object_poison_word(base).store(ALLOC_POISON, SeqCst);
            return base + HEADER_BYTES;
        }
        0
    }

    /// Frees a payload offset previously returned by [`SegList::alloc`] for
    /// agent `id`. Errors if `p` doesn't carry a live allocation's poison tag.
    pub fn free(&self, id: u32, p: u32) -> Result<()> {
        let base = p - HEADER_BYTES;
        let size = self.object_size_word(base).load(SeqCst);
        let poison = self.object_poison_word(base).load(SeqCst);
        if poison != ALLOC_POISON {
            return Err(Error::InvalidPointer(p));
        }
        self.object_poison_word(base).store(FREE_POISON, SeqCst);
        if size > ALL_CLASSES[NUMLLISTS - 1] {
            let blocks_needed = size.div_ceil(BLOCK_SIZE);
            self.blocks.free_blocks(base, blocks_needed);
            return Ok(());
        }
        let idx = floor_class_index(size);
        self.push_llist(id, idx, base);
        let freed = self.freed_bytes_word(id).fetch_add(size, SeqCst) + size;
        if freed >= COALESCE_THRESHOLD_BYTES {
            self.coalesce(id);
            self.freed_bytes_word(id).store(0, SeqCst);
        }
        Ok(())
    }

    /// Best-effort coalesce pass: groups this agent's free small objects by
    /// their containing (4096-aligned) block, and for any block whose free
    /// bytes sum to exactly `BLOCK_SIZE` - i.e. the entire block is free and
    /// every cell of it happens to be on this agent's own lists - unlinks
    /// those objects and returns the block to the global pool.
    ///
    /// This is the part the design notes call out as "sketched but not
    /// implemented" upstream; grouping strictly by this agent's own lists
    /// (never touching another agent's in-use cells) is what keeps this safe
    /// even though small objects are allowed to cross block boundaries that
    /// were allocated by a different agent.
    fn coalesce(&self, id: u32) {
        use std::collections::HashMap;
        let mut by_block: HashMap<u32, Vec<(usize, u32)>> = HashMap::new();
        let mut free_bytes: HashMap<u32, u32> = HashMap::new();
        for list in 0..NUMLLISTS {
            let mut cur = self.head_word(id, list).load(SeqCst);
            while cur != NONE {
                let next = self.object_next_word(cur).load(SeqCst);
                let size = self.object_size_word(cur).load(SeqCst);
                let block_base = cur - (cur % BLOCK_SIZE);
                by_block.entry(block_base).or_default().push((list, cur));
                *free_bytes.entry(block_base).or_insert(0) += size;
                cur = next;
            }
        }
        for (block_base, bytes) in free_bytes {
            if bytes != BLOCK_SIZE {
                continue;
            }
            for &(list, obj) in &by_block[&block_base] {
                self.unlink_llist(id, list, obj);
            }
            self.blocks.free_blocks(block_base, 1);
        }
    }

    fn unlink_llist(&self, id: u32, list: usize, target: u32) {
        let mut prev = NONE;
        let mut cur = self.head_word(id, list).load(SeqCst);
        while cur != NONE {
            let next = self.object_next_word(cur).load(SeqCst);
            if cur == target {
                if prev == NONE {
                    self.head_word(id, list).store(next, SeqCst);
                } else {
                    self.object_next_word(prev).store(next, SeqCst);
                }
                return;
            }
            prev = cur;
            cur = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn new_pool(arena_bytes: u32) -> (Arc<SharedRegion>, usize) {
        let pool_base = 0;
        let region = Arc::new(SharedRegion::new(
            BlockPool::BYTES + BLOCK_SIZE as usize + arena_bytes as usize,
        ));
        (region, pool_base)
    }

    #[test]
    fn alloc_blocks_then_free_blocks_reuses_space() {
        let (region, base) = new_pool(16 * BLOCK_SIZE);
        let arena_base = (base + BlockPool::BYTES).div_ceil(BLOCK_SIZE as usize) as u32 * BLOCK_SIZE;
        let pool = BlockPool::init((*region).clone(), base, arena_base, 16 * BLOCK_SIZE).unwrap();
        let a = pool.alloc_blocks(2).unwrap();
        pool.free_blocks(a, 2);
        let b = pool.alloc_blocks(2).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn adjacent_free_blocks_merge_into_one() {
        let (region, base) = new_pool(16 * BLOCK_SIZE);
        let arena_base = (base + BlockPool::BYTES).div_ceil(BLOCK_SIZE as usize) as u32 * BLOCK_SIZE;
        let pool = BlockPool::init((*region).clone(), base, arena_base, 16 * BLOCK_SIZE).unwrap();
        let a = pool.alloc_blocks(1).unwrap();
        let b = pool.alloc_blocks(1).unwrap();
        assert_eq!(b, a + BLOCK_SIZE);
        pool.free_blocks(a, 1);
        pool.free_blocks(b, 1);
        let merged = pool.alloc_blocks(2).unwrap();
        assert_eq!(merged, a);
    }

    fn new_seglist(capacity: u32, arena_blocks: u32) -> (Arc<SharedRegion>, SegList) {
        let pool_base = 0;
        let agents_base = BlockPool::BYTES;
        let arena_base =
            ((agents_base + SegList::agent_table_bytes(capacity)).div_ceil(BLOCK_SIZE as usize)) as u32
                * BLOCK_SIZE;
        let region = Arc::new(SharedRegion::new(
            arena_base as usize + (arena_blocks * BLOCK_SIZE) as usize,
        ));
        let seglist = SegList::init(
            (*region).clone(),
            pool_base,
            agents_base,
            capacity,
            arena_base,
            arena_blocks * BLOCK_SIZE,
        )
        .unwrap();
        (region, seglist)
    }

    #[test]
    fn alloc_then_free_then_alloc_round_trips() {
        let (_region, seglist) = new_seglist(4, 8);
        let p = seglist.alloc(0, 32);
        assert_ne!(p, 0);
        seglist.free(0, p).unwrap();
        let q = seglist.alloc(0, 32);
        assert_ne!(q, 0);
    }

    #[test]
    fn free_of_unallocated_pointer_is_rejected() {
        let (_region, seglist) = new_seglist(4, 8);
        assert!(matches!(seglist.free(0, 1234), Err(Error::InvalidPointer(1234))));
    }

    #[test]
    fn concurrent_alloc_free_never_aliases_live_regions() {
        let (region, seglist) = new_seglist(4, 64);
        let seglist = Arc::new(seglist);
        let handles: Vec<_> = (0..4u32)
            .map(|id| {
                let seglist = seglist.clone();
                let region = region.clone();
                thread::spawn(move || {
                    let sizes = [16u32, 64, 256, 1024];
                    for round in 0..2000u32 {
                        let size = sizes[(round as usize) % sizes.len()];
                        let p = seglist.alloc(id, size);
                        assert_ne!(p, 0, "allocator exhausted unexpectedly");
                        let pattern = (id << 24) | round;
                        region.atomic_u32(p as usize).store(pattern, SeqCst);
                        assert_eq!(region.atomic_u32(p as usize).load(SeqCst), pattern);
                        seglist.free(id, p).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::{ceil_class_index, floor_class_index, ALL_CLASSES, MIN_OBJECT};
    use proptest::prelude::*;

    proptest! {
        /// The coalescing invariant this module's own doc comment names as
        /// safe: a free object is always inserted under a class no larger
        /// than its real size (floor), and a lookup always starts at a class
        /// no smaller than the request (ceil). Together, any object a lookup
        /// finds in its starting bucket or higher is big enough to satisfy
        /// the request - the property that lets coalescing skip re-reading
        /// an object's own header before reusing it.
        #[test]
        fn ceil_and_floor_bracket_the_requested_size(size in MIN_OBJECT..4096) {
            let max_class = *ALL_CLASSES.last().unwrap();
            let ceil_idx = ceil_class_index(size);
            if size > max_class {
                prop_assert_eq!(ceil_idx, ALL_CLASSES.len() - 1);
            } else {
                prop_assert!(ALL_CLASSES[ceil_idx] >= size);
            }

            let insert_size = size.min(max_class);
            let floor_idx = floor_class_index(insert_size);
            prop_assert!(ALL_CLASSES[floor_idx] <= insert_size);

            // Any class at or above the floor-mapped insertion bucket is
            // large enough for a request whose ceil lookup starts there too.
            if floor_idx >= ceil_idx {
                prop_assert!(ALL_CLASSES[floor_idx] >= size.min(max_class));
            }
        }
    }
}
