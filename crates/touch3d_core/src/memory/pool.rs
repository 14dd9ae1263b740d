//! # Pool Allocator
//!
//! First-fit allocator over one large heap reservation, for many small
//! objects that share the pool's lifetime.
//!
//! Allocations are tracked by a side table of descriptors rather than
//! headers in the pool bytes. The table itself lives in heap memory and
//! grows through [`HeapAllocator::reallocate`].
//!
//! ## Limitations
//!
//! Descriptors are never removed, only marked free, and neighbouring free
//! descriptors are never merged. Fragmentation only grows over a pool's
//! lifetime; size pools for one phase of work and release them after.

use bytemuck::{Pod, Zeroable};

use crate::error::{invalid_pointer, MemoryError, MemoryResult};
use crate::memory::heap::{HeapAllocator, HeapPtr, DEFAULT_ALIGNMENT};
use crate::memory::platform::{align_up, WORD};

/// Size of one descriptor record in the table.
pub const DESCRIPTOR_SIZE: usize = std::mem::size_of::<PoolAllocationDescriptor>();

/// Table capacity used when the caller asks for zero.
const MIN_DESCRIPTOR_CAPACITY: usize = 8;

/// One logical allocation inside a pool.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PoolAllocationDescriptor {
    /// Capacity in bytes.
    pub size: u64,
    /// Bytes logically requested. Zero while free.
    pub used_size: u64,
    /// Offset of the first byte inside the pool.
    pub data: u64,
    /// Non-zero while free.
    free: u64,
}

impl PoolAllocationDescriptor {
    fn used(data: usize, size: usize, used_size: usize) -> Self {
        Self {
            size: size as u64,
            used_size: used_size as u64,
            data: data as u64,
            free: 0,
        }
    }

    /// Whether the descriptor is available for reuse.
    #[inline]
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.free != 0
    }

    /// Capacity left after the used bytes.
    #[inline]
    #[must_use]
    pub const fn spare(&self) -> u64 {
        self.size - self.used_size
    }
}

/// Handle to an allocation inside a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolPtr(usize);

impl PoolPtr {
    /// Offset from the start of the pool.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

/// Where an allocation request will be served from.
enum Placement {
    /// Reuse a free descriptor.
    Reuse(usize),
    /// Carve the spare tail of a used descriptor.
    Carve(usize),
    /// Take fresh bytes from the untouched end of the pool, moving the
    /// cursor to the given end.
    Tail(usize),
}

/// First-fit pool allocator with an out-of-line descriptor table.
///
/// # Thread Safety
///
/// Not synchronized. Every operation borrows the heap that owns the pool
/// bytes; [`MemoryContext`](crate::context::MemoryContext) locks pool then
/// heap.
///
/// # Example
///
/// ```rust,ignore
/// let mut pool = PoolAllocator::new();
/// pool.init(&mut heap, 64 * 1024, 100)?;
///
/// let a = pool.allocate(&mut heap, 48)?;
/// pool.bytes_mut(&mut heap, a)?.fill(1);
/// pool.free(&mut heap, a)?;
/// ```
#[derive(Debug, Default)]
pub struct PoolAllocator {
    /// The pool bytes.
    memory: Option<HeapPtr>,
    /// The descriptor table.
    descriptors: Option<HeapPtr>,
    /// Pool size in bytes.
    size: usize,
    /// End of the last allocation carved from the untouched tail.
    tail: usize,
    /// Descriptors in use.
    descriptor_count: usize,
    /// Descriptors the table can hold.
    descriptor_capacity: usize,
}

impl PoolAllocator {
    /// Creates a pool with no reservation yet.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            memory: None,
            descriptors: None,
            size: 0,
            tail: 0,
            descriptor_count: 0,
            descriptor_capacity: 0,
        }
    }

    /// Reserves `total_size` bytes and a table of `descriptor_capacity`
    /// descriptors, both from `heap`.
    ///
    /// A previous reservation is released first.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the heap cannot supply either block.
    pub fn init(
        &mut self,
        heap: &mut HeapAllocator,
        total_size: usize,
        descriptor_capacity: usize,
    ) -> MemoryResult<()> {
        self.release(heap)?;

        let descriptor_capacity = descriptor_capacity.max(MIN_DESCRIPTOR_CAPACITY);
        let table_size = descriptor_capacity
            .checked_mul(DESCRIPTOR_SIZE)
            .ok_or(MemoryError::OutOfMemory {
                requested: descriptor_capacity,
                available: 0,
            })?;
        let memory = heap.allocate(total_size, DEFAULT_ALIGNMENT)?;
        let descriptors = match heap.allocate(table_size, WORD) {
            Ok(ptr) => ptr,
            Err(err) => {
                heap.deallocate(memory)?;
                return Err(err);
            }
        };

        *self = Self {
            memory: Some(memory),
            descriptors: Some(descriptors),
            size: total_size,
            tail: 0,
            descriptor_count: 0,
            descriptor_capacity,
        };
        tracing::debug!(total_size, descriptor_capacity, "pool initialized");
        Ok(())
    }

    /// Returns the pool bytes and the descriptor table to the heap.
    ///
    /// # Errors
    ///
    /// Propagates heap errors.
    pub fn release(&mut self, heap: &mut HeapAllocator) -> MemoryResult<()> {
        let memory = self.memory.take();
        let descriptors = self.descriptors.take();
        *self = Self::new();
        if let Some(ptr) = memory {
            heap.deallocate(ptr)?;
        }
        if let Some(ptr) = descriptors {
            heap.deallocate(ptr)?;
        }
        Ok(())
    }

    /// Whether a reservation is held.
    #[inline]
    #[must_use]
    pub const fn is_initialized(&self) -> bool {
        self.memory.is_some()
    }

    /// Pool size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// End of the untouched tail cursor.
    #[inline]
    #[must_use]
    pub const fn tail(&self) -> usize {
        self.tail
    }

    /// Number of descriptors ever created (free or used).
    #[inline]
    #[must_use]
    pub const fn descriptor_count(&self) -> usize {
        self.descriptor_count
    }

    /// Current capacity of the descriptor table.
    #[inline]
    #[must_use]
    pub const fn descriptor_capacity(&self) -> usize {
        self.descriptor_capacity
    }

    /// Copies out the descriptor table.
    ///
    /// # Errors
    ///
    /// `NotInitialized` before [`init`](Self::init).
    pub fn descriptors(&self, heap: &HeapAllocator) -> MemoryResult<Vec<PoolAllocationDescriptor>> {
        Ok(self.table(heap)?.to_vec())
    }

    /// Allocates `size` bytes (rounded up to 8).
    ///
    /// 1. First free descriptor large enough.
    /// 2. Else the spare tail of a used descriptor, carved into a new one.
    /// 3. Else fresh bytes from the untouched end of the pool.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if none of the above fits, or the descriptor table
    /// cannot grow. `NotInitialized` before [`init`](Self::init).
    pub fn allocate(&mut self, heap: &mut HeapAllocator, size: usize) -> MemoryResult<PoolPtr> {
        let size = align_up(size.max(1), WORD).ok_or(MemoryError::OutOfMemory {
            requested: size,
            available: 0,
        })?;

        match self.place(heap, size)? {
            Placement::Reuse(index) => {
                let table = self.table_mut(heap)?;
                let descriptor = &mut table[index];
                descriptor.free = 0;
                descriptor.used_size = size as u64;
                Ok(PoolPtr(descriptor.data as usize))
            }
            Placement::Carve(index) => {
                let donor = self.table(heap)?[index];
                let data = (donor.data + donor.used_size) as usize;
                let spare = donor.spare() as usize;
                // The table may move or fail to grow; only shrink the donor
                // once the carved bytes have a descriptor of their own.
                self.push_descriptor(heap, PoolAllocationDescriptor::used(data, spare, size))?;
                let donor = &mut self.table_mut(heap)?[index];
                donor.size = donor.used_size;
                Ok(PoolPtr(data))
            }
            Placement::Tail(end) => {
                let data = self.tail;
                self.push_descriptor(heap, PoolAllocationDescriptor::used(data, size, size))?;
                self.tail = end;
                Ok(PoolPtr(data))
            }
        }
    }

    /// Marks an allocation free. Neighbours are not merged.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` (release builds only; debug builds panic) if `ptr`
    /// is not a live allocation of this pool.
    pub fn free(&mut self, heap: &mut HeapAllocator, ptr: PoolPtr) -> MemoryResult<()> {
        let table = self.table_mut(heap)?;
        let descriptor = table
            .iter_mut()
            .find(|d| !d.is_free() && d.data == ptr.0 as u64)
            .ok_or_else(|| invalid_pointer("pool", ptr.0))?;
        descriptor.free = 1;
        descriptor.used_size = 0;
        Ok(())
    }

    /// The requested bytes of an allocation.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` as for [`free`](Self::free).
    pub fn bytes<'h>(&self, heap: &'h HeapAllocator, ptr: PoolPtr) -> MemoryResult<&'h [u8]> {
        let range = self.live_range(heap, ptr)?;
        let memory = self.memory.ok_or(MemoryError::NotInitialized)?;
        Ok(&heap.bytes(memory)?[range])
    }

    /// The requested bytes of an allocation, writable.
    ///
    /// # Errors
    ///
    /// `InvalidPointer` as for [`free`](Self::free).
    pub fn bytes_mut<'h>(
        &self,
        heap: &'h mut HeapAllocator,
        ptr: PoolPtr,
    ) -> MemoryResult<&'h mut [u8]> {
        let range = self.live_range(heap, ptr)?;
        let memory = self.memory.ok_or(MemoryError::NotInitialized)?;
        Ok(&mut heap.bytes_mut(memory)?[range])
    }

    fn place(&self, heap: &HeapAllocator, size: usize) -> MemoryResult<Placement> {
        let table = self.table(heap)?;
        let wanted = size as u64;

        if let Some(index) = table.iter().position(|d| d.is_free() && d.size >= wanted) {
            return Ok(Placement::Reuse(index));
        }
        if let Some(index) = table.iter().position(|d| !d.is_free() && d.spare() >= wanted) {
            return Ok(Placement::Carve(index));
        }
        if let Some(end) = self.tail.checked_add(size).filter(|&end| end <= self.size) {
            return Ok(Placement::Tail(end));
        }
        Err(MemoryError::OutOfMemory {
            requested: size,
            available: self.size - self.tail,
        })
    }

    fn live_range(&self, heap: &HeapAllocator, ptr: PoolPtr) -> MemoryResult<std::ops::Range<usize>> {
        let descriptor = self
            .table(heap)?
            .iter()
            .find(|d| !d.is_free() && d.data == ptr.0 as u64)
            .ok_or_else(|| invalid_pointer("pool", ptr.0))?;
        let start = descriptor.data as usize;
        Ok(start..start + descriptor.used_size as usize)
    }

    /// Appends a descriptor, doubling the table when it is full.
    fn push_descriptor(
        &mut self,
        heap: &mut HeapAllocator,
        descriptor: PoolAllocationDescriptor,
    ) -> MemoryResult<()> {
        if self.descriptor_count == self.descriptor_capacity {
            let capacity = self.descriptor_capacity * 2;
            let table = heap.reallocate(self.descriptors, capacity * DESCRIPTOR_SIZE)?;
            self.descriptors = Some(table);
            self.descriptor_capacity = capacity;
            tracing::debug!(capacity, "pool descriptor table grown");
        }

        self.descriptor_count += 1;
        let index = self.descriptor_count - 1;
        self.table_mut(heap)?[index] = descriptor;
        Ok(())
    }

    fn table<'h>(&self, heap: &'h HeapAllocator) -> MemoryResult<&'h [PoolAllocationDescriptor]> {
        let ptr = self.descriptors.ok_or(MemoryError::NotInitialized)?;
        let len = self.descriptor_count * DESCRIPTOR_SIZE;
        let bytes = heap
            .bytes(ptr)?
            .get(..len)
            .ok_or_else(|| MemoryError::Corrupted("descriptor table truncated".to_string()))?;
        bytemuck::try_cast_slice(bytes)
            .map_err(|err| MemoryError::Corrupted(format!("descriptor table: {err}")))
    }

    fn table_mut<'h>(
        &self,
        heap: &'h mut HeapAllocator,
    ) -> MemoryResult<&'h mut [PoolAllocationDescriptor]> {
        let ptr = self.descriptors.ok_or(MemoryError::NotInitialized)?;
        let len = self.descriptor_count * DESCRIPTOR_SIZE;
        let bytes = heap
            .bytes_mut(ptr)?
            .get_mut(..len)
            .ok_or_else(|| MemoryError::Corrupted("descriptor table truncated".to_string()))?;
        bytemuck::try_cast_slice_mut(bytes)
            .map_err(|err| MemoryError::Corrupted(format!("descriptor table: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::platform::VirtualMemory;
    use std::sync::Arc;

    fn setup(pool_size: usize, descriptors: usize) -> (HeapAllocator, PoolAllocator) {
        let mut heap = HeapAllocator::new(Arc::new(VirtualMemory::new(1 << 20)), 1 << 20).unwrap();
        let mut pool = PoolAllocator::new();
        pool.init(&mut heap, pool_size, descriptors).unwrap();
        (heap, pool)
    }

    #[test]
    fn test_descriptor_is_four_words() {
        assert_eq!(DESCRIPTOR_SIZE, 4 * WORD);
    }

    #[test]
    fn test_pool_allocate_free() {
        let (mut heap, mut pool) = setup(1024, 8);

        let a = pool.allocate(&mut heap, 40).unwrap();
        let b = pool.allocate(&mut heap, 16).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 40);
        assert_eq!(pool.tail(), 56);

        pool.free(&mut heap, a).unwrap();
        let table = pool.descriptors(&heap).unwrap();
        assert!(table[0].is_free());
        assert_eq!(table[0].used_size, 0);
    }

    #[test]
    fn test_pool_reuse() {
        let (mut heap, mut pool) = setup(1024, 8);

        let a = pool.allocate(&mut heap, 64).unwrap();
        let _b = pool.allocate(&mut heap, 8).unwrap();
        pool.free(&mut heap, a).unwrap();

        let c = pool.allocate(&mut heap, 32).unwrap();
        assert_eq!(c, a); // Same descriptor reused
        assert_eq!(pool.descriptor_count(), 2);
        assert_eq!(pool.descriptors(&heap).unwrap()[0].used_size, 32);
    }

    #[test]
    fn test_pool_carves_spare_capacity() {
        let (mut heap, mut pool) = setup(1024, 8);

        let a = pool.allocate(&mut heap, 64).unwrap();
        let _b = pool.allocate(&mut heap, 8).unwrap();
        pool.free(&mut heap, a).unwrap();
        let c = pool.allocate(&mut heap, 16).unwrap();
        assert_eq!(c, a);

        // Descriptor 0 has 48 spare bytes after its 16 used.
        let d = pool.allocate(&mut heap, 24).unwrap();
        assert_eq!(d.offset(), 16);

        let table = pool.descriptors(&heap).unwrap();
        assert_eq!(table[0].size, 16);
        assert_eq!(table[2].size, 48);
        assert_eq!(table[2].used_size, 24);
        assert_eq!(pool.tail(), 72);
    }

    #[test]
    fn test_pool_full() {
        let (mut heap, mut pool) = setup(64, 8);

        pool.allocate(&mut heap, 32).unwrap();
        pool.allocate(&mut heap, 32).unwrap();
        assert_eq!(
            pool.allocate(&mut heap, 8),
            Err(MemoryError::OutOfMemory {
                requested: 8,
                available: 0
            })
        );
    }

    #[test]
    fn test_pool_tail_request_must_fit() {
        let (mut heap, mut pool) = setup(64, 8);

        pool.allocate(&mut heap, 48).unwrap();
        assert!(pool.allocate(&mut heap, 32).is_err());
        assert!(pool.allocate(&mut heap, 16).is_ok());
    }

    #[test]
    fn test_pool_huge_request_is_out_of_memory() {
        let (mut heap, mut pool) = setup(1024, 8);

        pool.allocate(&mut heap, 8).unwrap();
        let err = pool.allocate(&mut heap, usize::MAX - 10).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));
        assert_eq!(pool.tail(), 8);
        assert_eq!(pool.descriptor_count(), 1);

        let b = pool.allocate(&mut heap, 16).unwrap();
        assert_eq!(b.offset(), 8);
    }

    #[test]
    fn test_failed_carve_keeps_donor_capacity() {
        // Room for the pool and its 8-entry table, not for a doubled table.
        let mut heap = HeapAllocator::new(Arc::new(VirtualMemory::new(1400)), 1400).unwrap();
        let mut pool = PoolAllocator::new();
        pool.init(&mut heap, 1024, 8).unwrap();

        let a = pool.allocate(&mut heap, 64).unwrap();
        for _ in 0..7 {
            pool.allocate(&mut heap, 8).unwrap();
        }
        assert_eq!(pool.descriptor_count(), pool.descriptor_capacity());
        pool.free(&mut heap, a).unwrap();
        assert_eq!(pool.allocate(&mut heap, 16).unwrap(), a);

        let err = pool.allocate(&mut heap, 24).unwrap_err();
        assert!(matches!(err, MemoryError::OutOfMemory { .. }));

        let table = pool.descriptors(&heap).unwrap();
        assert_eq!(table.len(), 8);
        assert_eq!(table[0].size, 64);
        assert_eq!(table[0].used_size, 16);
        assert_eq!(table[0].spare(), 48);
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_descriptor_table_grows() {
        let (mut heap, mut pool) = setup(4096, 8);
        assert_eq!(pool.descriptor_capacity(), 8);

        let ptrs: Vec<_> = (0..20).map(|_| pool.allocate(&mut heap, 8).unwrap()).collect();
        assert_eq!(pool.descriptor_count(), 20);
        assert!(pool.descriptor_capacity() >= 20);

        for (i, ptr) in ptrs.iter().enumerate() {
            assert_eq!(ptr.offset(), i * 8);
        }
        heap.check_invariants().unwrap();
    }

    #[test]
    fn test_pool_bytes_are_isolated() {
        let (mut heap, mut pool) = setup(256, 8);

        let a = pool.allocate(&mut heap, 8).unwrap();
        let b = pool.allocate(&mut heap, 8).unwrap();
        pool.bytes_mut(&mut heap, a).unwrap().fill(0xAA);
        pool.bytes_mut(&mut heap, b).unwrap().fill(0xBB);

        assert!(pool.bytes(&heap, a).unwrap().iter().all(|&x| x == 0xAA));
        assert!(pool.bytes(&heap, b).unwrap().iter().all(|&x| x == 0xBB));
    }

    #[test]
    fn test_release_returns_memory_to_heap() {
        let (mut heap, mut pool) = setup(1024, 8);
        pool.allocate(&mut heap, 100).unwrap();

        pool.release(&mut heap).unwrap();
        assert!(!pool.is_initialized());
        assert_eq!(heap.block_count(), 0);
        assert_eq!(
            pool.allocate(&mut heap, 8),
            Err(MemoryError::NotInitialized)
        );
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "invalid pool pointer")]
    fn test_double_free_is_fatal_in_debug() {
        let (mut heap, mut pool) = setup(1024, 8);
        let a = pool.allocate(&mut heap, 8).unwrap();
        pool.free(&mut heap, a).unwrap();
        let _ = pool.free(&mut heap, a);
    }
}
