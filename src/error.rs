//! Error kinds shared by every primitive in this crate.

use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Failure modes a coordination primitive can report.
///
/// Construction-time and API-misuse errors (`BadLayout`, `OutOfBounds`,
/// `WrongAgent`, `UnknownRemote`, `NotEnoughScratch`) indicate a programmer
/// error and are meant to be propagated, logged, and treated as fatal by the
/// caller. `OutOfMemory` and `Overlong` are recoverable and must be handled.
/// `Timeout` is not really an error - see [`crate::park::ParkResult`] and the
/// `wait_for_*` methods, which return it as a normal, non-exceptional value.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A cell's offset or the region's length violates the cell's required
    /// `{bytes, align}` layout.
    #[error("layout violation: offset {offset} is not valid for a {bytes}-byte, {align}-byte aligned cell")]
    BadLayout {
        /// Byte offset that was requested.
        offset: usize,
        /// Size in bytes the cell needs.
        bytes: usize,
        /// Required alignment in bytes.
        align: usize,
    },

    /// A cell would read or write past the end of the region.
    #[error("offset {offset} + {bytes} bytes is out of bounds for a region of {region_len} bytes")]
    OutOfBounds {
        /// Byte offset that was requested.
        offset: usize,
        /// Size in bytes the cell needs.
        bytes: usize,
        /// Size of the backing region.
        region_len: usize,
    },

    /// `free`/`free_blocks` was called with a pointer that was never handed
    /// out by the matching allocator, or was already freed.
    #[error("invalid pointer passed to free: {0:#x}")]
    InvalidPointer(u32),

    /// An allocator has no space left; `alloc` returns the zero sentinel
    /// instead of raising this, but callers that need a typed error (e.g.
    /// `alloc_blocks`) surface it.
    #[error("allocator exhausted")]
    OutOfMemory,

    /// A queue item is longer than the queue's entire backing buffer, so it
    /// could never be inserted regardless of current occupancy.
    #[error("item of {item_words} words can never fit in a {capacity_words}-word queue")]
    Overlong {
        /// Length of the rejected item, in words.
        item_words: u32,
        /// Capacity of the queue, in words.
        capacity_words: u32,
    },

    /// A master-only (or worker-only) API was called from the wrong side.
    #[error("{method} may only be called by {expected}")]
    WrongAgent {
        /// Name of the offending method.
        method: &'static str,
        /// Which side was allowed to call it.
        expected: &'static str,
    },

    /// The dispatcher was asked to invoke a function name that no worker has
    /// registered.
    #[error("no remote function named {0:?} is registered")]
    UnknownRemote(String),

    /// The dispatcher's scratch area cannot fit the packed job (function
    /// name, item table, and marshaled arguments).
    #[error("job needs {needed} bytes of scratch but only {available} are free")]
    NotEnoughScratch {
        /// Bytes the job needed.
        needed: usize,
        /// Bytes actually available.
        available: usize,
    },
}
