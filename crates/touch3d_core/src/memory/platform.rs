//! # Platform Memory
//!
//! Portable reserve/commit virtual memory.
//!
//! Every allocator in this crate gets its backing bytes from a [`Region`].
//! A region reserves address space once and then commits a prefix of it,
//! moving a "break" up and down the way `sbrk` does on Linux. The same
//! abstraction is used on every platform, so allocator semantics never
//! branch by OS.
//!
//! ```text
//!   0                 break                         reserved
//!   ├─────────────────┼─────────────────────────────┤
//!   │   committed     │      reserved, untouched    │
//!   └─────────────────┴─────────────────────────────┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{MemoryError, MemoryResult};

/// Machine word in bytes. Regions are committed in whole words.
pub const WORD: usize = std::mem::size_of::<u64>();

/// Rounds `value` up to a multiple of `align` (a power of two).
///
/// Returns `None` on overflow.
#[inline]
#[must_use]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Access rights of a region's committed bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Protection {
    /// Readable and writable.
    #[default]
    ReadWrite,
    /// Readable only. Mutable access is a programmer error.
    ReadOnly,
}

/// When a reservation's bytes become usable.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CommitPolicy {
    /// Reserve only. Bytes are committed by moving the break.
    #[default]
    Lazy,
    /// Commit the whole reservation immediately.
    Eager,
}

/// A single reservation of address space with a movable commit break.
///
/// Storage is word-backed, so any offset that is a multiple of [`WORD`]
/// is 8-byte aligned. The backing capacity is reserved once and never
/// reallocated while the region lives.
#[derive(Debug)]
pub struct Region {
    /// Committed words. Capacity is the reservation.
    words: Vec<u64>,
    /// Reserved bytes (a multiple of [`WORD`]).
    reserved: usize,
    /// Access rights.
    protection: Protection,
}

impl Region {
    /// Reserves `length` bytes (rounded up to whole words) of backing
    /// storage. [`PlatformMemory`] implementations build regions with this.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the backing storage cannot be reserved.
    pub fn reserve(length: usize, protection: Protection, policy: CommitPolicy) -> MemoryResult<Self> {
        let reserved = align_up(length, WORD).ok_or(MemoryError::OutOfMemory {
            requested: length,
            available: 0,
        })?;
        let word_count = reserved / WORD;

        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|_| MemoryError::OutOfMemory {
                requested: length,
                available: 0,
            })?;
        if policy == CommitPolicy::Eager {
            words.resize(word_count, 0);
        }

        Ok(Self {
            words,
            reserved,
            protection,
        })
    }

    /// Total reserved bytes.
    #[inline]
    #[must_use]
    pub const fn reserved(&self) -> usize {
        self.reserved
    }

    /// Committed bytes, i.e. the current break.
    #[inline]
    #[must_use]
    pub fn committed(&self) -> usize {
        self.words.len() * WORD
    }

    /// Bytes that can still be committed.
    #[inline]
    #[must_use]
    pub fn uncommitted(&self) -> usize {
        self.reserved - self.committed()
    }

    /// Access rights of this region.
    #[inline]
    #[must_use]
    pub const fn protection(&self) -> Protection {
        self.protection
    }

    /// Moves the break by `delta` bytes and returns the new break.
    ///
    /// Positive deltas commit (rounded up to whole words), negative deltas
    /// decommit. Bytes committed again after a shrink read as zero.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the break would pass the reservation, `Corrupted`
    /// if it would drop below zero.
    pub fn grow_or_shrink_break(&mut self, delta: isize) -> MemoryResult<usize> {
        let current = self.committed();
        let magnitude = delta.unsigned_abs();

        let target = if delta >= 0 {
            current
                .checked_add(magnitude)
                .and_then(|t| align_up(t, WORD))
                .filter(|&t| t <= self.reserved)
                .ok_or(MemoryError::OutOfMemory {
                    requested: magnitude,
                    available: self.uncommitted(),
                })?
        } else {
            current.checked_sub(magnitude).ok_or_else(|| {
                MemoryError::Corrupted(format!(
                    "break underflow: shrinking {magnitude} bytes from {current}"
                ))
            })? / WORD
                * WORD
        };

        // Within the reserved capacity, so this never moves the storage.
        self.words.resize(target / WORD, 0);
        Ok(self.committed())
    }

    /// Committed bytes.
    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    /// Committed bytes, writable.
    ///
    /// # Panics
    ///
    /// Debug builds panic if the region is [`Protection::ReadOnly`].
    #[inline]
    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        debug_assert_eq!(
            self.protection,
            Protection::ReadWrite,
            "write access to a read-only region"
        );
        bytemuck::cast_slice_mut(&mut self.words)
    }
}

/// OS primitives an allocator consumes to obtain raw backing storage.
pub trait PlatformMemory: Send + Sync {
    /// Reserves `length` bytes of address space.
    ///
    /// `addr_hint` is advisory, like a non-fixed `mmap` hint.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the reservation cannot be made.
    fn reserve_virtual(
        &self,
        addr_hint: Option<usize>,
        length: usize,
        protection: Protection,
        policy: CommitPolicy,
    ) -> MemoryResult<Region>;

    /// Returns a reservation to the OS.
    ///
    /// # Errors
    ///
    /// `Corrupted` if the region was not reserved through this platform.
    fn release_virtual(&self, region: Region) -> MemoryResult<()>;
}

/// Portable [`PlatformMemory`] with a process-wide reservation budget.
///
/// The sum of live reservations never exceeds `budget`. This plays the
/// role of the OS refusing to grow the data segment.
#[derive(Debug)]
pub struct VirtualMemory {
    /// Maximum bytes reserved at once.
    budget: usize,
    /// Bytes currently reserved.
    reserved: AtomicUsize,
    /// Live reservations.
    regions: AtomicUsize,
}

impl VirtualMemory {
    /// Creates a platform that will reserve at most `budget` bytes at once.
    #[must_use]
    pub const fn new(budget: usize) -> Self {
        Self {
            budget,
            reserved: AtomicUsize::new(0),
            regions: AtomicUsize::new(0),
        }
    }

    /// Reservation budget in bytes.
    #[inline]
    #[must_use]
    pub const fn budget(&self) -> usize {
        self.budget
    }

    /// Bytes currently reserved across all live regions.
    #[inline]
    #[must_use]
    pub fn reserved_bytes(&self) -> usize {
        self.reserved.load(Ordering::Acquire)
    }

    /// Number of live regions.
    #[inline]
    #[must_use]
    pub fn reservation_count(&self) -> usize {
        self.regions.load(Ordering::Acquire)
    }

    /// Claims `bytes` of budget, failing if it would overflow.
    fn claim(&self, bytes: usize) -> MemoryResult<()> {
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(bytes).filter(|&total| total <= self.budget)
            })
            .map(|_| ())
            .map_err(|current| MemoryError::OutOfMemory {
                requested: bytes,
                available: self.budget.saturating_sub(current),
            })
    }
}

impl PlatformMemory for VirtualMemory {
    fn reserve_virtual(
        &self,
        addr_hint: Option<usize>,
        length: usize,
        protection: Protection,
        policy: CommitPolicy,
    ) -> MemoryResult<Region> {
        let bytes = align_up(length, WORD).ok_or(MemoryError::OutOfMemory {
            requested: length,
            available: 0,
        })?;
        self.claim(bytes)?;

        match Region::reserve(bytes, protection, policy) {
            Ok(region) => {
                self.regions.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(bytes, ?addr_hint, ?policy, "reserved region");
                Ok(region)
            }
            Err(err) => {
                self.reserved.fetch_sub(bytes, Ordering::AcqRel);
                Err(err)
            }
        }
    }

    fn release_virtual(&self, region: Region) -> MemoryResult<()> {
        let bytes = region.reserved();
        self.reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(bytes)
            })
            .map_err(|current| {
                MemoryError::Corrupted(format!(
                    "releasing {bytes} bytes but only {current} are reserved"
                ))
            })?;
        self.regions.fetch_sub(1, Ordering::AcqRel);
        tracing::debug!(bytes, "released region");
        Ok(())
    }
}
