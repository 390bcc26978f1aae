//! Shared-region memory allocators (L7, L8): a lock-free [`bump::BumpAllocator`]
//! for stack-discipline scratch space, and a [`seglist::SegList`]
//! segregated-freelist allocator for longer-lived, individually freed
//! objects.

pub mod bump;
pub mod seglist;

pub use bump::BumpAllocator;
pub use seglist::{BlockPool, SegList};
