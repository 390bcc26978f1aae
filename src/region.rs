//! The shared region: a contiguous byte buffer that every agent addresses by
//! the same offsets, plus the typed atomic views layered on top of it.
//!
//! Every coordination primitive in this crate (synchronics, mutexes,
//! barriers, queues, allocators, ...) is a small value type that carries a
//! [`SharedRegion`] handle and a `base` byte offset; none of them own any
//! state of their own. Fields are reconstructed as `&AtomicU32`/`&AtomicU8`
//! references from the region on every access, per the design notes: "a
//! family of value types each carrying `{region, base_offset}`".
//!
//! Agents in this crate are OS threads in one process that all hold a clone
//! of the same [`SharedRegion`], which stands in for the `SharedArrayBuffer`
//! of the systems this crate's primitives are modeled on.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8};
use std::sync::Arc;

/// `{bytes, align}` pair describing how much space a primitive needs in the
/// shared region and what alignment its base offset requires.
pub trait Layout {
    /// Size in bytes.
    const BYTES: usize;
    /// Required alignment in bytes; always a power of two.
    const ALIGN: usize;
}

struct Storage {
    // Boxed so the heap allocation's address is stable across moves of the
    // `Arc`; every typed view computes raw pointers into this allocation
    // and all access to it goes through atomic operations, never through a
    // plain `&`/`&mut [u8]`.
    bytes: Box<[u8]>,
}

unsafe impl Send for Storage {}
unsafe impl Sync for Storage {}

/// A contiguous byte buffer, shared by reference across every agent.
///
/// Cloning a `SharedRegion` is cheap (it's an `Arc` clone) and gives the
/// clone access to the exact same bytes; this is how a newly spawned worker
/// thread is handed the region its master constructed.
#[derive(Clone)]
pub struct SharedRegion {
    storage: Arc<Storage>,
}

impl SharedRegion {
    /// Allocates a zero-initialized region of `len` bytes.
    ///
    /// Offset 0 is reserved as a "page-zero" sentinel by allocators built on
    /// top of this region (see [`crate::alloc`]); callers that need the
    /// sentinel to be unusable should reserve at least a word at offset 0.
    pub fn new(len: usize) -> Self {
        Self {
            storage: Arc::new(Storage {
                bytes: vec![0u8; len].into_boxed_slice(),
            }),
        }
    }

    /// Total length of the region in bytes.
    pub fn len(&self) -> usize {
        self.storage.bytes.len()
    }

    /// Whether the region has zero length.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base pointer of the region's storage. Only ever dereferenced through
    /// `Atomic*::from_ptr`.
    fn base_ptr(&self) -> *mut u8 {
        self.storage.bytes.as_ptr() as *mut u8
    }

    fn check(&self, offset: usize, bytes: usize, align: usize) -> Result<*mut u8> {
        if offset % align != 0 {
            return Err(Error::BadLayout {
                offset,
                bytes,
                align,
            });
        }
        let end = offset.checked_add(bytes).ok_or(Error::OutOfBounds {
            offset,
            bytes,
            region_len: self.len(),
        })?;
        if end > self.len() {
            return Err(Error::OutOfBounds {
                offset,
                bytes,
                region_len: self.len(),
            });
        }
        // SAFETY: `offset + bytes <= len`.
        Ok(unsafe { self.base_ptr().add(offset) })
    }

    /// Validates that a `T`-shaped cell (per its [`Layout`]) fits at `offset`.
    pub fn validate<T: Layout>(&self, offset: usize) -> Result<()> {
        self.check(offset, T::BYTES, T::ALIGN)?;
        Ok(())
    }

    /// Returns a `&'static`-lifetime-free atomic view of the `u32` at
    /// `offset`. The reference borrows `self`, so it can't outlive the
    /// region it points into.
    pub fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= self.len());
        // SAFETY: offset validated by every primitive's constructor; bounds
        // and alignment are invariants of the typed view that called us.
        unsafe { AtomicU32::from_ptr(self.base_ptr().add(offset) as *mut u32) }
    }

    /// Atomic view of the `u16` at `offset`.
    pub fn atomic_u16(&self, offset: usize) -> &AtomicU16 {
        debug_assert!(offset % 2 == 0 && offset + 2 <= self.len());
        unsafe { AtomicU16::from_ptr(self.base_ptr().add(offset) as *mut u16) }
    }

    /// Atomic view of the `u8` at `offset`.
    pub fn atomic_u8(&self, offset: usize) -> &AtomicU8 {
        debug_assert!(offset < self.len());
        unsafe { AtomicU8::from_ptr(self.base_ptr().add(offset)) }
    }

    /// Copies `len` bytes out of the region starting at `offset`, for
    /// marshaling read-only argument blocks into a worker's own stack. Racy
    /// with concurrent writers by design - callers are expected to only use
    /// this once they've synchronized with the writer (e.g. after a barrier
    /// release).
    pub fn read_bytes(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        let ptr = self.check(offset, len, 1)?;
        let mut out = vec![0u8; len];
        for (i, b) in out.iter_mut().enumerate() {
            *b = self.atomic_u8(offset + i).load(std::sync::atomic::Ordering::Relaxed);
        }
        let _ = ptr;
        Ok(out)
    }

    /// Writes `data` into the region starting at `offset`.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) -> Result<()> {
        self.check(offset, data.len(), 1)?;
        for (i, b) in data.iter().enumerate() {
            self.atomic_u8(offset + i).store(*b, std::sync::atomic::Ordering::Relaxed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_misaligned_offset() {
        let region = SharedRegion::new(64);
        assert!(matches!(
            region.check(2, 4, 4),
            Err(Error::BadLayout { .. })
        ));
    }

    #[test]
    fn rejects_out_of_bounds() {
        let region = SharedRegion::new(16);
        assert!(matches!(
            region.check(12, 8, 4),
            Err(Error::OutOfBounds { .. })
        ));
    }

    #[test]
    fn round_trips_bytes() {
        let region = SharedRegion::new(32);
        region.write_bytes(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(region.read_bytes(4, 4).unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn clone_shares_storage() {
        let region = SharedRegion::new(16);
        let clone = region.clone();
        region.atomic_u32(0).store(42, std::sync::atomic::Ordering::SeqCst);
        assert_eq!(clone.atomic_u32(0).load(std::sync::atomic::Ordering::SeqCst), 42);
    }
}
