//! # Heap Allocator
//!
//! General purpose `allocate`/`deallocate`/`reallocate` over a first-fit
//! list of variable sized blocks carved from one lazily committed region.
//!
//! ## Layout
//!
//! Every block occupies `HEADER_SIZE + size` bytes of the arena. The header
//! bytes are accounted for but never read: block metadata lives in a side
//! table, so walking the list never touches caller data.
//!
//! ```text
//!   arena:  [hdr|  data A  ][hdr| data B (free) ][hdr|  data C  ]  <- break
//!   table:   A{used} <──────> B{free} <──────────> C{used}
//! ```
//!
//! ## Invariants
//!
//! - Blocks tile the committed arena with no gaps, in address order.
//! - No two neighbouring blocks are both free.
//! - The tail block is never free. A freed tail goes back to the OS.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{invalid_pointer, MemoryError, MemoryResult};
use crate::memory::platform::{align_up, CommitPolicy, PlatformMemory, Protection, Region, WORD};

/// Bytes of arena accounted to each block's header.
pub const HEADER_SIZE: usize = 32;

/// Smallest payload worth splitting off into its own block.
pub const MIN_PAYLOAD: usize = WORD;

/// Alignment used when the caller does not ask for one.
pub const DEFAULT_ALIGNMENT: usize = WORD;

/// Largest supported alignment.
pub const MAX_ALIGNMENT: usize = HEADER_SIZE;

/// Leftover space at which a block is split in two.
const SPLIT_THRESHOLD: usize = HEADER_SIZE + MIN_PAYLOAD;

/// Logical pointer to the first usable byte of a heap block.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeapPtr(usize);

impl HeapPtr {
    /// Offset of the first usable byte from the arena base.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

/// Index of a block in the side table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
struct BlockId(usize);

/// One carved region of the arena.
#[derive(Clone, Debug)]
struct MemoryBlock {
    /// Offset of the header.
    offset: usize,
    /// Usable bytes after the header.
    size: usize,
    /// Left neighbour in address order.
    prev: Option<BlockId>,
    /// Right neighbour in address order.
    next: Option<BlockId>,
    /// Not handed to a caller.
    free: bool,
}

impl MemoryBlock {
    #[inline]
    const fn data_start(&self) -> usize {
        self.offset + HEADER_SIZE
    }

    #[inline]
    const fn end(&self) -> usize {
        self.data_start() + self.size
    }
}

/// Counters describing heap activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Successful `allocate` calls (including relocations).
    pub allocations: u64,
    /// Successful `deallocate` calls (including relocations).
    pub deallocations: u64,
    /// Successful `reallocate` calls.
    pub reallocations: u64,
    /// Usable bytes currently handed out.
    pub live_bytes: usize,
    /// Largest committed arena size seen.
    pub peak_arena: usize,
}

/// First-fit heap allocator with splitting and coalescing.
///
/// # Thread Safety
///
/// Not synchronized. Share it through
/// [`MemoryContext`](crate::context::MemoryContext), which wraps it in a mutex.
///
/// # Example
///
/// ```rust,ignore
/// let platform = Arc::new(VirtualMemory::new(1 << 20));
/// let mut heap = HeapAllocator::new(platform, 64 * 1024)?;
///
/// let ptr = heap.allocate(100, DEFAULT_ALIGNMENT)?;
/// heap.bytes_mut(ptr)?[0] = 7;
/// let ptr = heap.reallocate(Some(ptr), 400)?;
/// heap.deallocate(ptr)?;
/// ```
pub struct HeapAllocator {
    /// Where the arena came from, and where it goes back to.
    platform: Arc<dyn PlatformMemory>,
    /// The arena. Only `None` while dropping.
    region: Option<Region>,
    /// Block side table. Vacant slots are `None`.
    blocks: Vec<Option<MemoryBlock>>,
    /// Vacant slots in `blocks`, reused before growing the table.
    vacant: Vec<BlockId>,
    /// Lowest-address block.
    head: Option<BlockId>,
    /// Highest-address block.
    tail: Option<BlockId>,
    /// `data_start` -> block, for every block in the list.
    by_data: HashMap<usize, BlockId>,
    /// Activity counters.
    stats: HeapStats,
}

impl HeapAllocator {
    /// Creates a heap whose arena may grow up to `arena_limit` bytes.
    ///
    /// Nothing is committed until the first allocation.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the platform refuses the reservation.
    pub fn new(platform: Arc<dyn PlatformMemory>, arena_limit: usize) -> MemoryResult<Self> {
        let region = platform.reserve_virtual(
            None,
            arena_limit,
            Protection::ReadWrite,
            CommitPolicy::Lazy,
        )?;

        Ok(Self {
            platform,
            region: Some(region),
            blocks: Vec::new(),
            vacant: Vec::new(),
            head: None,
            tail: None,
            by_data: HashMap::new(),
            stats: HeapStats::default(),
        })
    }

    /// Bytes currently committed to the arena.
    #[inline]
    #[must_use]
    pub fn arena_size(&self) -> usize {
        self.region.as_ref().map_or(0, Region::committed)
    }

    /// Bytes the arena may grow to.
    #[inline]
    #[must_use]
    pub fn arena_limit(&self) -> usize {
        self.region.as_ref().map_or(0, Region::reserved)
    }

    /// Number of blocks in the list, free or not.
    #[inline]
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.by_data.len()
    }

    /// Number of free blocks in the list.
    #[must_use]
    pub fn free_block_count(&self) -> usize {
        self.iter_blocks().filter(|block| block.free).count()
    }

    /// Activity counters.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Allocates at least `size` bytes.
    ///
    /// `size` is rounded up to `alignment` (and to at least one word).
    /// The first free block large enough is reused, split when the
    /// leftover can hold another block. Otherwise the arena grows.
    ///
    /// `alignment` only rounds the size. Returned offsets are aligned to
    /// [`WORD`] and no further, so `allocate(16, 16)` may return an offset
    /// that is not a multiple of 16.
    ///
    /// # Errors
    ///
    /// - `InvalidAlignment` if `alignment` is not a power of two up to
    ///   [`MAX_ALIGNMENT`].
    /// - `OutOfMemory` if the rounded size overflows or the arena cannot
    ///   grow.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> MemoryResult<HeapPtr> {
        let size = Self::round_size(size, alignment)?;

        let id = match self.find_first_fit(size) {
            Some(id) => {
                self.split(id, size);
                self.block_mut(id).free = false;
                id
            }
            None => self.extend(size)?,
        };

        let (data_start, granted) = {
            let block = self.block(id);
            (block.data_start(), block.size)
        };
        self.stats.allocations += 1;
        self.stats.live_bytes += granted;
        Ok(HeapPtr(data_start))
    }

    /// Allocates like [`allocate`](Self::allocate) and zero-fills the block.
    ///
    /// # Errors
    ///
    /// Same as [`allocate`](Self::allocate).
    pub fn allocate_zeroed(&mut self, size: usize, alignment: usize) -> MemoryResult<HeapPtr> {
        let ptr = self.allocate(size, alignment)?;
        self.bytes_mut(ptr)?.fill(0);
        Ok(ptr)
    }

    /// Returns a block to the heap.
    ///
    /// The block merges with a free left neighbour, then with a free right
    /// neighbour. If the result is the tail, its bytes go back to the OS.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` (release builds only; debug builds panic) if `ptr`
    /// is not a live allocation of this heap.
    pub fn deallocate(&mut self, ptr: HeapPtr) -> MemoryResult<()> {
        let mut id = self.lookup_live(ptr)?;

        let size = self.block(id).size;
        self.block_mut(id).free = true;
        self.stats.deallocations += 1;
        self.stats.live_bytes -= size;

        if let Some(prev) = self.block(id).prev {
            if self.block(prev).free {
                self.absorb_next(prev);
                id = prev;
            }
        }
        if let Some(next) = self.block(id).next {
            if self.block(next).free {
                self.absorb_next(id);
            }
        }
        if self.block(id).next.is_none() {
            self.release_tail(id)?;
        }
        Ok(())
    }

    /// Resizes an allocation, moving it only when it cannot grow in place.
    ///
    /// `None` behaves like [`allocate`](Self::allocate). Shrinking keeps the
    /// pointer and splits off the excess. Growing first tries to absorb a
    /// free right neighbour, then falls back to allocate, copy, free.
    ///
    /// # Errors
    ///
    /// - `OutOfMemory` if a relocation is needed and the arena cannot grow.
    ///   The original allocation is left untouched.
    /// - `InvalidPointer` as for [`deallocate`](Self::deallocate).
    pub fn reallocate(&mut self, ptr: Option<HeapPtr>, new_size: usize) -> MemoryResult<HeapPtr> {
        let Some(ptr) = ptr else {
            return self.allocate(new_size, DEFAULT_ALIGNMENT);
        };

        let id = self.lookup_live(ptr)?;
        let size = Self::round_size(new_size, DEFAULT_ALIGNMENT)?;
        let old_size = self.block(id).size;

        if old_size >= size {
            self.shrink_in_place(id, size)?;
            self.stats.reallocations += 1;
            self.stats.live_bytes = self.stats.live_bytes - old_size + self.block(id).size;
            return Ok(ptr);
        }

        if let Some(next) = self.block(id).next {
            let neighbour = self.block(next);
            if neighbour.free && old_size + HEADER_SIZE + neighbour.size >= size {
                self.absorb_next(id);
                self.shrink_in_place(id, size)?;
                self.stats.reallocations += 1;
                self.stats.live_bytes = self.stats.live_bytes - old_size + self.block(id).size;
                return Ok(ptr);
            }
        }

        let new_ptr = self.allocate(size, DEFAULT_ALIGNMENT)?;
        let len = old_size.min(size);
        self.region_mut()?
            .as_bytes_mut()
            .copy_within(ptr.0..ptr.0 + len, new_ptr.0);
        self.deallocate(ptr)?;
        self.stats.reallocations += 1;

        tracing::trace!(from = ptr.0, to = new_ptr.0, len, "relocated heap block");
        Ok(new_ptr)
    }

    /// Like [`reallocate`](Self::reallocate), but frees the original block
    /// when the reallocation fails.
    ///
    /// # Errors
    ///
    /// Same as [`reallocate`](Self::reallocate).
    pub fn reallocate_or_free(
        &mut self,
        ptr: Option<HeapPtr>,
        new_size: usize,
    ) -> MemoryResult<HeapPtr> {
        match self.reallocate(ptr, new_size) {
            Err(err @ MemoryError::OutOfMemory { .. }) => {
                if let Some(ptr) = ptr {
                    self.deallocate(ptr)?;
                }
                Err(err)
            }
            other => other,
        }
    }

    /// Usable bytes of a live allocation.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` as for [`deallocate`](Self::deallocate).
    pub fn usable_size(&self, ptr: HeapPtr) -> MemoryResult<usize> {
        let id = self.lookup_live(ptr)?;
        Ok(self.block(id).size)
    }

    /// The usable bytes of a live allocation.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` as for [`deallocate`](Self::deallocate).
    pub fn bytes(&self, ptr: HeapPtr) -> MemoryResult<&[u8]> {
        let id = self.lookup_live(ptr)?;
        let block = self.block(id);
        let range = block.data_start()..block.end();
        let region = self.region.as_ref().ok_or(MemoryError::NotInitialized)?;
        Ok(&region.as_bytes()[range])
    }

    /// The usable bytes of a live allocation, writable.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` as for [`deallocate`](Self::deallocate).
    pub fn bytes_mut(&mut self, ptr: HeapPtr) -> MemoryResult<&mut [u8]> {
        let id = self.lookup_live(ptr)?;
        let block = self.block(id);
        let range = block.data_start()..block.end();
        Ok(&mut self.region_mut()?.as_bytes_mut()[range])
    }

    /// Walks the block list and checks every structural invariant.
    ///
    /// # Errors
    ///
    /// `Corrupted` describing the first violation found.
    pub fn check_invariants(&self) -> MemoryResult<()> {
        let corrupted = |what: String| Err(MemoryError::Corrupted(what));

        let mut expected_offset = 0;
        let mut expected_prev = None;
        let mut previous_free = false;
        let mut seen = 0;
        let mut cursor = self.head;

        while let Some(id) = cursor {
            let block = self.block(id);
            if block.offset != expected_offset {
                return corrupted(format!(
                    "block at {:#x} leaves a gap after {expected_offset:#x}",
                    block.offset
                ));
            }
            if block.prev != expected_prev {
                return corrupted(format!("block at {:#x} has a stale prev link", block.offset));
            }
            if block.free && previous_free {
                return corrupted(format!(
                    "free block at {:#x} follows another free block",
                    block.offset
                ));
            }
            if self.by_data.get(&block.data_start()) != Some(&id) {
                return corrupted(format!("block at {:#x} is not indexed", block.offset));
            }
            previous_free = block.free;
            expected_offset = block.end();
            expected_prev = Some(id);
            seen += 1;
            cursor = block.next;
        }

        if self.tail != expected_prev {
            return corrupted("tail does not match the last block".to_string());
        }
        if let Some(tail) = self.tail {
            if self.block(tail).free {
                return corrupted("tail block is free".to_string());
            }
        }
        if expected_offset != self.arena_size() {
            return corrupted(format!(
                "blocks end at {expected_offset:#x} but the break is at {:#x}",
                self.arena_size()
            ));
        }
        if seen != self.by_data.len() {
            return corrupted(format!(
                "{seen} blocks linked but {} indexed",
                self.by_data.len()
            ));
        }
        Ok(())
    }

    fn round_size(size: usize, alignment: usize) -> MemoryResult<usize> {
        if !alignment.is_power_of_two() || alignment > MAX_ALIGNMENT {
            return Err(MemoryError::InvalidAlignment(alignment));
        }
        align_up(size.max(1), alignment.max(WORD)).ok_or(MemoryError::OutOfMemory {
            requested: size,
            available: 0,
        })
    }

    fn iter_blocks(&self) -> impl Iterator<Item = &MemoryBlock> {
        std::iter::successors(self.head.map(|id| self.block(id)), move |block| {
            block.next.map(|id| self.block(id))
        })
    }

    fn find_first_fit(&self, size: usize) -> Option<BlockId> {
        let mut cursor = self.head;
        while let Some(id) = cursor {
            let block = self.block(id);
            if block.free && block.size >= size {
                return Some(id);
            }
            cursor = block.next;
        }
        None
    }

    /// Grows the arena by one block of `size` bytes linked after the tail.
    fn extend(&mut self, size: usize) -> MemoryResult<BlockId> {
        let region = self.region_mut()?;
        let offset = region.committed();
        let available = region.uncommitted();
        let out_of_memory = MemoryError::OutOfMemory {
            requested: size,
            available,
        };
        let total = HEADER_SIZE
            .checked_add(size)
            .ok_or_else(|| out_of_memory.clone())?;
        let delta = isize::try_from(total).map_err(|_| out_of_memory.clone())?;
        region
            .grow_or_shrink_break(delta)
            .map_err(|_| out_of_memory)?;
        let arena = region.committed();

        let prev = self.tail;
        let id = self.insert(MemoryBlock {
            offset,
            size,
            prev,
            next: None,
            free: false,
        });
        match prev {
            Some(prev) => self.block_mut(prev).next = Some(id),
            None => self.head = Some(id),
        }
        self.tail = Some(id);
        self.stats.peak_arena = self.stats.peak_arena.max(arena);

        tracing::debug!(grow = total, arena, "heap arena extended");
        Ok(id)
    }

    /// Splits `id` at `size`, leaving a free block with the remainder.
    ///
    /// Returns the new block, if the leftover was large enough to split.
    fn split(&mut self, id: BlockId, size: usize) -> Option<BlockId> {
        let block = self.block(id).clone();
        let leftover = block.size - size;
        if leftover < SPLIT_THRESHOLD {
            return None;
        }

        let remainder = self.insert(MemoryBlock {
            offset: block.data_start() + size,
            size: leftover - HEADER_SIZE,
            prev: Some(id),
            next: block.next,
            free: true,
        });
        match block.next {
            Some(next) => self.block_mut(next).prev = Some(remainder),
            None => self.tail = Some(remainder),
        }
        let block = self.block_mut(id);
        block.size = size;
        block.next = Some(remainder);
        Some(remainder)
    }

    /// Shrinks a used block to `size`, keeping the free-list invariants.
    fn shrink_in_place(&mut self, id: BlockId, size: usize) -> MemoryResult<()> {
        let Some(remainder) = self.split(id, size) else {
            return Ok(());
        };
        if let Some(next) = self.block(remainder).next {
            if self.block(next).free {
                self.absorb_next(remainder);
            }
        }
        if self.block(remainder).next.is_none() {
            self.release_tail(remainder)?;
        }
        Ok(())
    }

    /// Merges the right neighbour of `id` into `id`.
    fn absorb_next(&mut self, id: BlockId) {
        let Some(next) = self.block(id).next else {
            return;
        };
        let absorbed = self.remove(next);
        match absorbed.next {
            Some(after) => self.block_mut(after).prev = Some(id),
            None => self.tail = Some(id),
        }
        let block = self.block_mut(id);
        block.size += HEADER_SIZE + absorbed.size;
        block.next = absorbed.next;
    }

    /// Unlinks the tail block and hands its bytes back to the OS.
    fn release_tail(&mut self, id: BlockId) -> MemoryResult<()> {
        debug_assert_eq!(self.tail, Some(id), "only the tail can be released");
        let block = self.block(id).clone();
        debug_assert_eq!(block.end(), self.arena_size(), "tail must end at the break");

        let total = HEADER_SIZE + block.size;
        let delta = isize::try_from(total)
            .map_err(|_| MemoryError::Corrupted(format!("tail of {total} bytes")))?;
        let arena = self.region_mut()?.grow_or_shrink_break(-delta)?;

        self.remove(id);
        match block.prev {
            Some(prev) => self.block_mut(prev).next = None,
            None => self.head = None,
        }
        self.tail = block.prev;

        tracing::debug!(shrink = total, arena, "heap arena shrunk");
        Ok(())
    }

    fn lookup_live(&self, ptr: HeapPtr) -> MemoryResult<BlockId> {
        if ptr.0 < HEADER_SIZE || ptr.0 >= self.arena_size() {
            return Err(invalid_pointer("heap", ptr.0));
        }
        self.by_data
            .get(&ptr.0)
            .copied()
            .filter(|&id| !self.block(id).free)
            .ok_or_else(|| invalid_pointer("heap", ptr.0))
    }

    fn insert(&mut self, block: MemoryBlock) -> BlockId {
        let data_start = block.data_start();
        let id = match self.vacant.pop() {
            Some(id) => {
                self.blocks[id.0] = Some(block);
                id
            }
            None => {
                self.blocks.push(Some(block));
                BlockId(self.blocks.len() - 1)
            }
        };
        self.by_data.insert(data_start, id);
        id
    }

    fn remove(&mut self, id: BlockId) -> MemoryBlock {
        let block = self.blocks[id.0]
            .take()
            .unwrap_or_else(|| panic!("heap block list references vacant slot {}", id.0));
        self.by_data.remove(&block.data_start());
        self.vacant.push(id);
        block
    }

    fn block(&self, id: BlockId) -> &MemoryBlock {
        self.blocks[id.0]
            .as_ref()
            .unwrap_or_else(|| panic!("heap block list references vacant slot {}", id.0))
    }

    fn block_mut(&mut self, id: BlockId) -> &mut MemoryBlock {
        self.blocks[id.0]
            .as_mut()
            .unwrap_or_else(|| panic!("heap block list references vacant slot {}", id.0))
    }

    fn region_mut(&mut self) -> MemoryResult<&mut Region> {
        self.region.as_mut().ok_or(MemoryError::NotInitialized)
    }
}

impl Drop for HeapAllocator {
    fn drop(&mut self) {
        if let Some(region) = self.region.take() {
            if let Err(err) = self.platform.release_virtual(region) {
                tracing::error!(%err, "failed to release heap arena");
            }
        }
    }
}

impl std::fmt::Debug for HeapAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapAllocator")
            .field("arena_size", &self.arena_size())
            .field("arena_limit", &self.arena_limit())
            .field("blocks", &self.block_count())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::platform::VirtualMemory;

    fn heap(limit: usize) -> HeapAllocator {
        HeapAllocator::new(Arc::new(VirtualMemory::new(limit)), limit).unwrap()
    }

    #[test]
    fn test_first_allocation_extends_arena() {
        let mut heap = heap(4096);
        let ptr = heap.allocate(100, DEFAULT_ALIGNMENT).unwrap();

        assert_eq!(ptr.offset(), HEADER_SIZE);
        assert_eq!(heap.usable_size(ptr).unwrap(), 104);
        assert_eq!(heap.arena_size(), HEADER_SIZE + 104);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_size_rounds_to_alignment() {
        let mut heap = heap(4096);
        let ptr = heap.allocate(17, 16).unwrap();
        assert_eq!(heap.usable_size(ptr).unwrap(), 32);

        let zero = heap.allocate(0, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(heap.usable_size(zero).unwrap(), WORD);
    }

    #[test]
    fn test_unsupported_alignment_is_rejected() {
        let mut heap = heap(4096);
        assert_eq!(
            heap.allocate(8, 3),
            Err(MemoryError::InvalidAlignment(3))
        );
        assert_eq!(
            heap.allocate(8, 64),
            Err(MemoryError::InvalidAlignment(64))
        );
    }

    #[test]
    fn test_alignment_rounds_size_not_offset() {
        let mut heap = heap(4096);
        let _a = heap.allocate(8, DEFAULT_ALIGNMENT).unwrap();
        let b = heap.allocate(16, 16).unwrap();

        assert_eq!(b.offset(), 2 * HEADER_SIZE + 8);
        assert_eq!(b.offset() % WORD, 0);
        assert_eq!(heap.usable_size(b).unwrap(), 16);
    }

    #[test]
    fn test_huge_request_is_out_of_memory() {
        let mut heap = heap(4096);
        let err = heap.allocate(usize::MAX - 10, DEFAULT_ALIGNMENT).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));

        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let err = heap.allocate(usize::MAX - 10, DEFAULT_ALIGNMENT).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));
        let err = heap.reallocate(Some(a), usize::MAX - 10).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));

        assert_eq!(heap.usable_size(a).unwrap(), 64);
        assert_eq!(heap.arena_size(), HEADER_SIZE + 64);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_freed_tail_returns_to_os() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let b = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();

        heap.deallocate(b).unwrap();
        assert_eq!(heap.arena_size(), HEADER_SIZE + 64);
        assert_eq!(heap.block_count(), 1);

        heap.deallocate(a).unwrap();
        assert_eq!(heap.arena_size(), 0);
        assert_eq!(heap.block_count(), 0);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_first_fit_reuses_freed_block() {
        let mut heap = heap(4096);
        let a = heap.allocate(256, DEFAULT_ALIGNMENT).unwrap();
        let _b = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        heap.deallocate(a).unwrap();

        let c = heap.allocate(128, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(c, a);
        // 256 - 128 leaves room for a header plus payload: split.
        assert_eq!(heap.usable_size(c).unwrap(), 128);
        assert_eq!(heap.block_count(), 3);
        assert_eq!(heap.free_block_count(), 1);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_small_leftover_is_not_split() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let _b = heap.allocate(8, DEFAULT_ALIGNMENT).unwrap();
        heap.deallocate(a).unwrap();

        // 64 - 32 = 32 < HEADER_SIZE + MIN_PAYLOAD.
        let c = heap.allocate(32, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(c, a);
        assert_eq!(heap.usable_size(c).unwrap(), 64);
        assert_eq!(heap.block_count(), 2);
    }

    #[test]
    fn test_coalesces_both_neighbours() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let b = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let c = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let _d = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();

        heap.deallocate(a).unwrap();
        heap.deallocate(c).unwrap();
        assert_eq!(heap.free_block_count(), 2);

        heap.deallocate(b).unwrap();
        assert_eq!(heap.free_block_count(), 1);
        assert_eq!(heap.block_count(), 2);

        // The merged block spans a, b and c plus two absorbed headers.
        let big = heap.allocate(64 * 3 + HEADER_SIZE * 2, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(big, a);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_out_of_memory_leaves_heap_usable() {
        let mut heap = heap(256);
        let a = heap.allocate(128, DEFAULT_ALIGNMENT).unwrap();

        let err = heap.allocate(128, DEFAULT_ALIGNMENT).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { requested: 128, .. }));
        assert_eq!(heap.arena_size(), HEADER_SIZE + 128);

        heap.deallocate(a).unwrap();
        assert!(heap.allocate(128, DEFAULT_ALIGNMENT).is_ok());
    }

    #[test]
    fn test_reallocate_none_allocates() {
        let mut heap = heap(4096);
        let ptr = heap.reallocate(None, 40).unwrap();
        assert_eq!(heap.usable_size(ptr).unwrap(), 40);
    }

    #[test]
    fn test_reallocate_shrink_keeps_pointer_and_bytes() {
        let mut heap = heap(4096);
        let ptr = heap.allocate(256, DEFAULT_ALIGNMENT).unwrap();
        let _guard = heap.allocate(8, DEFAULT_ALIGNMENT).unwrap();
        for (i, byte) in heap.bytes_mut(ptr).unwrap().iter_mut().enumerate() {
            *byte = i as u8;
        }

        let shrunk = heap.reallocate(Some(ptr), 64).unwrap();
        assert_eq!(shrunk, ptr);
        assert_eq!(heap.usable_size(ptr).unwrap(), 64);
        let bytes = heap.bytes(ptr).unwrap();
        assert!(bytes.iter().enumerate().all(|(i, &b)| b == i as u8));
        assert_eq!(heap.free_block_count(), 1);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_reallocate_shrink_of_tail_releases_remainder() {
        let mut heap = heap(4096);
        let ptr = heap.allocate(256, DEFAULT_ALIGNMENT).unwrap();
        heap.reallocate(Some(ptr), 64).unwrap();

        assert_eq!(heap.arena_size(), HEADER_SIZE + 64);
        assert_eq!(heap.block_count(), 1);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_reallocate_grows_into_free_neighbour() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let b = heap.allocate(256, DEFAULT_ALIGNMENT).unwrap();
        let _c = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        heap.bytes_mut(a).unwrap().fill(0x5A);
        heap.deallocate(b).unwrap();

        let grown = heap.reallocate(Some(a), 128).unwrap();
        assert_eq!(grown, a);
        assert_eq!(heap.usable_size(a).unwrap(), 128);
        assert!(heap.bytes(a).unwrap()[..64].iter().all(|&x| x == 0x5A));
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_reallocate_relocates_and_copies() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let _b = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        for (i, byte) in heap.bytes_mut(a).unwrap().iter_mut().enumerate() {
            *byte = (i * 3) as u8;
        }

        let moved = heap.reallocate(Some(a), 512).unwrap();
        assert_ne!(moved, a);
        let bytes = heap.bytes(moved).unwrap();
        assert!(bytes[..64].iter().enumerate().all(|(i, &b)| b == (i * 3) as u8));
        assert_eq!(heap.stats().reallocations, 1);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_reallocate_failure_keeps_original() {
        let mut heap = heap(256);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        heap.bytes_mut(a).unwrap().fill(9);

        assert!(heap.reallocate(Some(a), 1024).is_err());
        assert!(heap.bytes(a).unwrap().iter().all(|&b| b == 9));
    }

    #[test]
    fn test_reallocate_or_free_releases_on_failure() {
        let mut heap = heap(256);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();

        assert!(heap.reallocate_or_free(Some(a), 1024).is_err());
        assert_eq!(heap.block_count(), 0);
        assert_eq!(heap.arena_size(), 0);
    }

    #[test]
    fn test_allocate_zeroed_clears_reused_bytes() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let _b = heap.allocate(8, DEFAULT_ALIGNMENT).unwrap();
        heap.bytes_mut(a).unwrap().fill(0xFF);
        heap.deallocate(a).unwrap();

        let z = heap.allocate_zeroed(64, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(z, a);
        assert!(heap.bytes(z).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_stats_track_live_bytes() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let b = heap.allocate(32, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(heap.stats().live_bytes, 96);

        heap.deallocate(a).unwrap();
        heap.deallocate(b).unwrap();
        let stats = heap.stats();
        assert_eq!(stats.live_bytes, 0);
        assert_eq!(stats.allocations, 2);
        assert_eq!(stats.deallocations, 2);
        assert_eq!(stats.peak_arena, 2 * HEADER_SIZE + 96);
    }

    #[test]
    fn test_drop_returns_reservation() {
        let platform = Arc::new(VirtualMemory::new(4096));
        {
            let mut heap = HeapAllocator::new(platform.clone(), 2048).unwrap();
            heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
            assert_eq!(platform.reserved_bytes(), 2048);
        }
        assert_eq!(platform.reserved_bytes(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invalid heap pointer")]
    fn test_double_free_is_fatal_in_debug() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let _b = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        heap.deallocate(a).unwrap();
        let _ = heap.deallocate(a);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invalid heap pointer")]
    fn test_interior_pointer_is_fatal_in_debug() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        let _ = heap.deallocate(HeapPtr(a.offset() + 8));
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_invalid_pointer_is_an_error_in_release() {
        let mut heap = heap(4096);
        let a = heap.allocate(64, DEFAULT_ALIGNMENT).unwrap();
        assert_eq!(
            heap.deallocate(HeapPtr(a.offset() + 8)),
            Err(MemoryError::InvalidPointer(a.offset() + 8))
        );
    }
}
