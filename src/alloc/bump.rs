//! The bump allocator (L7): a lock-free, monotonically growing linear
//! allocator over a span of the shared region, with `mark`/`release` for
//! stack-discipline bulk frees.

use crate::region::{Layout, SharedRegion};
use core::sync::atomic::Ordering::SeqCst;

const TOP_OFFSET: usize = 0;
const LIMIT_OFFSET: usize = 4;
// 8 bytes reserved, rounding the control block to the 16-byte metadata size.

const ALIGN_TO: u32 = 8;

fn round_up(n: u32, to: u32) -> u32 {
    (n + to - 1) / to * to
}

/// A lock-free bump allocator over `[arena_base, arena_base + arena_bytes)`.
///
/// Offset `0` is never handed out: it is the crate-wide "null" sentinel (see
/// [`crate::error::Error::InvalidPointer`] and the segregated allocator),
/// so a pool that starts at byte `0` of the region has its first allocatable
/// byte bumped to `ALIGN_TO` instead.
pub struct BumpAllocator {
    region: SharedRegion,
    base: usize,
}

impl Layout for BumpAllocator {
    const BYTES: usize = 16;
    const ALIGN: usize = 4;
}

impl BumpAllocator {
    /// Initializes a new allocator whose control block lives at `base` and
    /// which hands out offsets from `[arena_base, arena_base + arena_bytes)`.
    pub fn init(
        region: SharedRegion,
        base: usize,
        arena_base: u32,
        arena_bytes: u32,
    ) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        let this = Self { region, base };
        let start = if arena_base == 0 { ALIGN_TO } else { arena_base };
        this.top_word().store(start, SeqCst);
        this.limit_word().store(arena_base + arena_bytes, SeqCst);
        Ok(this)
    }

    /// Attaches to an allocator another agent already initialized.
    pub fn at(region: SharedRegion, base: usize) -> crate::error::Result<Self> {
        region.validate::<Self>(base)?;
        Ok(Self { region, base })
    }

    fn top_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + TOP_OFFSET)
    }

    fn limit_word(&self) -> &core::sync::atomic::AtomicU32 {
        self.region.atomic_u32(self.base + LIMIT_OFFSET)
    }

    /// Allocates `n_bytes` (rounded up to an 8-byte multiple), returning the
    /// offset of the first byte, or `0` if the arena is exhausted.
    pub fn alloc(&self, n_bytes: u32) -> u32 {
        let n = round_up(n_bytes, ALIGN_TO);
        let limit = self.limit_word().load(SeqCst);
        loop {
            let top = self.top_word().load(SeqCst);
            let new = match top.checked_add(n) {
                Some(v) => v,
                None => return 0,
            };
            if new > limit {
                return 0;
            }
            if self
                .top_word()
                .compare_exchange(top, new, SeqCst, SeqCst)
                .is_ok()
            {
                return top;
            }
        }
    }

    /// Snapshots the current allocation mark, for a later [`BumpAllocator::release`].
    pub fn mark(&self) -> u32 {
        self.top_word().load(SeqCst)
    }

    /// Resets `top` back to `p`, a value previously returned by
    /// [`BumpAllocator::mark`] (or an earlier [`BumpAllocator::alloc`]).
    /// Fails (without effect) if `p` is ahead of the current `top` - that
    /// would move the mark forward, not release anything.
    pub fn release(&self, p: u32) -> bool {
        loop {
            let current = self.top_word().load(SeqCst);
            if p > current {
                return false;
            }
            if self
                .top_word()
                .compare_exchange(current, p, SeqCst, SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }
}
