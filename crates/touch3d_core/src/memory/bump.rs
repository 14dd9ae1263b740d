//! # Bump Allocator
//!
//! A monotonic allocator for scratch allocations that all die together.

use std::sync::Arc;

use crate::error::{MemoryError, MemoryResult};
use crate::memory::platform::{align_up, CommitPolicy, PlatformMemory, Protection, Region};

/// Alignment of every bump allocation.
pub const BUMP_ALIGNMENT: usize = 8;

/// An allocation handed out by a [`BumpAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BumpPtr {
    /// Offset from the reservation base.
    offset: usize,
    /// Bytes requested (before alignment).
    len: usize,
}

impl BumpPtr {
    /// Offset from the reservation base.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        self.offset
    }

    /// Bytes requested.
    #[inline]
    #[must_use]
    pub const fn len(self) -> usize {
        self.len
    }

    /// Whether zero bytes were requested.
    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.len == 0
    }
}

/// A bump-pointer allocator over a single fixed reservation.
///
/// Allocations are fast (just bump an offset). There is no per-object
/// free: memory is reclaimed all at once by [`reset`](Self::reset) or
/// handed back to the OS by [`free_all`](Self::free_all).
///
/// # Thread Safety
///
/// This allocator is NOT shared. Use one per thread or per task.
///
/// # Example
///
/// ```rust,ignore
/// let mut scratch = BumpAllocator::with_capacity(platform, 1024 * 1024)?;
///
/// let verts = scratch.allocate(64 * 12)?;
/// scratch.bytes_mut(verts)?.fill(0);
///
/// // Everything goes at once
/// scratch.reset();
/// ```
pub struct BumpAllocator {
    /// Where the reservation comes from.
    platform: Arc<dyn PlatformMemory>,
    /// The reservation, once initialized.
    region: Option<Region>,
    /// Bytes handed out.
    used: usize,
}

impl BumpAllocator {
    /// Creates an allocator with no reservation yet.
    #[must_use]
    pub fn new(platform: Arc<dyn PlatformMemory>) -> Self {
        Self {
            platform,
            region: None,
            used: 0,
        }
    }

    /// Creates an allocator and reserves `capacity` bytes.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the platform refuses the reservation.
    pub fn with_capacity(platform: Arc<dyn PlatformMemory>, capacity: usize) -> MemoryResult<Self> {
        let mut bump = Self::new(platform);
        bump.init(capacity)?;
        Ok(bump)
    }

    /// Reserves and commits `capacity` bytes in one call.
    ///
    /// A previous reservation is released first.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the platform refuses the reservation.
    pub fn init(&mut self, capacity: usize) -> MemoryResult<()> {
        self.free_all()?;
        let region = self.platform.reserve_virtual(
            None,
            capacity,
            Protection::ReadWrite,
            CommitPolicy::Eager,
        )?;
        self.region = Some(region);
        Ok(())
    }

    /// Whether a reservation is held.
    #[inline]
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.region.is_some()
    }

    /// Total capacity in bytes.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.region.as_ref().map_or(0, Region::committed)
    }

    /// Bytes handed out since the last reset.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Bytes still available.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.used
    }

    /// Allocates `size` bytes, rounded up to 8.
    ///
    /// # Errors
    ///
    /// - `NotInitialized` before [`init`](Self::init).
    /// - `CapacityExceeded` when the reservation is used up. Scratch arenas
    ///   are sized by the caller, so this is reported and not retried.
    pub fn allocate(&mut self, size: usize) -> MemoryResult<BumpPtr> {
        let capacity = match &self.region {
            Some(region) => region.committed(),
            None => return Err(MemoryError::NotInitialized),
        };

        let end = align_up(size, BUMP_ALIGNMENT)
            .and_then(|aligned| self.used.checked_add(aligned))
            .filter(|&end| end <= capacity);

        let Some(end) = end else {
            let remaining = capacity - self.used;
            tracing::error!(size, remaining, capacity, "bump allocator exhausted");
            return Err(MemoryError::CapacityExceeded {
                requested: size,
                remaining,
            });
        };

        let ptr = BumpPtr {
            offset: self.used,
            len: size,
        };
        self.used = end;
        Ok(ptr)
    }

    /// Rewinds to the start of the reservation.
    ///
    /// All previous allocations become invalid. The reservation is kept.
    #[inline]
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Rewinds and returns the whole reservation to the OS.
    ///
    /// # Errors
    ///
    /// Propagates a platform release failure.
    pub fn free_all(&mut self) -> MemoryResult<()> {
        self.used = 0;
        match self.region.take() {
            Some(region) => self.platform.release_virtual(region),
            None => Ok(()),
        }
    }

    /// The bytes of an allocation.
    ///
    /// # Errors
    ///
    /// `NotInitialized` without a reservation, `InvalidPointer` if the
    /// allocation lies beyond the current bump offset.
    pub fn bytes(&self, ptr: BumpPtr) -> MemoryResult<&[u8]> {
        let range = self.checked_range(ptr)?;
        let region = self.region.as_ref().ok_or(MemoryError::NotInitialized)?;
        Ok(&region.as_bytes()[range])
    }

    /// The bytes of an allocation, writable.
    ///
    /// # Errors
    ///
    /// Same as [`bytes`](Self::bytes).
    pub fn bytes_mut(&mut self, ptr: BumpPtr) -> MemoryResult<&mut [u8]> {
        let range = self.checked_range(ptr)?;
        let region = self.region.as_mut().ok_or(MemoryError::NotInitialized)?;
        Ok(&mut region.as_bytes_mut()[range])
    }

    fn checked_range(&self, ptr: BumpPtr) -> MemoryResult<std::ops::Range<usize>> {
        if self.region.is_none() {
            return Err(MemoryError::NotInitialized);
        }
        let end = ptr.offset + ptr.len;
        if end > self.used {
            return Err(MemoryError::InvalidPointer(ptr.offset));
        }
        Ok(ptr.offset..end)
    }
}

impl Drop for BumpAllocator {
    fn drop(&mut self) {
        if let Err(err) = self.free_all() {
            tracing::error!(%err, "failed to release bump reservation");
        }
    }
}

impl std::fmt::Debug for BumpAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BumpAllocator")
            .field("capacity", &self.capacity())
            .field("used", &self.used)
            .finish_non_exhaustive()
    }
}
