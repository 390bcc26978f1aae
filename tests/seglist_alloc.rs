//! Integration coverage for the segregated-freelist allocator (L8),
//! exercised only through `agent_mesh_sync`'s public API.

use agent_mesh_sync::alloc::{BlockPool, SegList};
use agent_mesh_sync::region::Layout;
use agent_mesh_sync::SharedRegion;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;
use std::thread;

const BLOCK_SIZE: u32 = 4096;

fn new_seglist(capacity: u32, arena_blocks: u32) -> (Arc<SharedRegion>, SegList) {
    let pool_base = 0;
    let agents_base = BlockPool::BYTES;
    let arena_base = ((agents_base + SegList::agent_table_bytes(capacity)).div_ceil(BLOCK_SIZE as usize)) as u32
        * BLOCK_SIZE;
    let region = Arc::new(SharedRegion::new(arena_base as usize + (arena_blocks * BLOCK_SIZE) as usize));
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

/// Six agents, each cycling through every size class the allocator offers,
/// for long enough to force both the refill-from-`BlockPool` path and the
/// freed-bytes-triggered coalesce pass - a larger agent count and mixed size
/// sweep than the crate's own inline `concurrent_alloc_free_never_aliases_live_regions`
/// test, which fixes both at smaller values. Scaled down from the scenario's
/// literal per-agent allocation count so the full sweep still finishes
/// quickly under `cargo test`.
#[test]
fn six_agents_cycle_every_size_class_without_aliasing() {
    let (region, seglist) = new_seglist(6, 128);
    let seglist = Arc::new(seglist);
    let sizes = [16u32, 32, 64, 128, 256, 512, 1024, 2048];

    let handles: Vec<_> = (0..6u32)
        .map(|id| {
            let seglist = seglist.clone();
            let region = region.clone();
            thread::spawn(move || {
                for round in 0..3000u32 {
                    let size = sizes[(round as usize + id as usize) % sizes.len()];
                    let p = seglist.alloc(id, size);
                    assert_ne!(p, 0, "allocator exhausted unexpectedly");
                    let pattern = (id << 24) | (round & 0x00FF_FFFF);
                    region.atomic_u32(p as usize).store(pattern, SeqCst);
                    // Touch the tail of the object too, to catch an
                    // undersized split.
                    region.atomic_u32(p as usize + size as usize - 4).store(pattern, SeqCst);
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

/// An object larger than the biggest size class falls through to
/// `BlockPool`-backed large-object allocation, and frees cleanly back to it.
#[test]
fn oversized_allocation_falls_through_to_the_block_pool() {
    let (region, seglist) = new_seglist(2, 16);
    let big = 3 * BLOCK_SIZE;
    let p = seglist.alloc(0, big);
    assert_ne!(p, 0);
    region.atomic_u32(p as usize).store(0xDEAD_BEEF, SeqCst);
    seglist.free(0, p).unwrap();

    // The freed large object's blocks are back in the pool, so a
    // same-sized request is satisfiable again.
    let q = seglist.alloc(0, big);
    assert_ne!(q, 0);
}

/// Freeing a pointer that was never handed out (or was already freed) is
/// rejected rather than corrupting another live allocation.
#[test]
fn double_free_is_rejected() {
    let (_region, seglist) = new_seglist(2, 8);
    let p = seglist.alloc(0, 48);
    assert_ne!(p, 0);
    seglist.free(0, p).unwrap();
    assert!(seglist.free(0, p).is_err());
}
