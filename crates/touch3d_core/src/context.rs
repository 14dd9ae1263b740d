//! # Core Context
//!
//! The allocators and the worker pool, built once at process start and
//! passed to whatever needs them. There is no global state.
//!
//! ## Locking
//!
//! The heap and the pool are not internally synchronized, so each sits
//! behind its own mutex. Pool operations write into heap memory and take
//! both locks, always pool first, then heap.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{CoreConfig, MemoryConfig};
use crate::error::{CoreResult, MemoryResult, WorkerError};
use crate::memory::{
    BumpAllocator, HeapAllocator, HeapPtr, PoolAllocator, PoolPtr, VirtualMemory,
    DEFAULT_ALIGNMENT,
};
use crate::sync::WorkerPool;

/// Shared allocators.
pub struct MemoryContext {
    platform: Arc<VirtualMemory>,
    /// Lock order: `pool` before `heap`.
    heap: Mutex<HeapAllocator>,
    pool: Mutex<PoolAllocator>,
    scratch_capacity: usize,
}

impl MemoryContext {
    /// Reserves the heap arena and carves the shared pool out of it.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the budget cannot hold the arena or the pool.
    pub fn new(config: &MemoryConfig) -> MemoryResult<Self> {
        let platform = Arc::new(VirtualMemory::new(config.reservation_budget));
        let mut heap = HeapAllocator::new(platform.clone(), config.heap_arena_limit)?;
        let mut pool = PoolAllocator::new();
        pool.init(&mut heap, config.pool_size, config.pool_descriptor_capacity)?;

        Ok(Self {
            platform,
            heap: Mutex::new(heap),
            pool: Mutex::new(pool),
            scratch_capacity: config.scratch_capacity,
        })
    }

    /// The reservation source every allocator draws from.
    #[inline]
    #[must_use]
    pub fn platform(&self) -> &Arc<VirtualMemory> {
        &self.platform
    }

    /// Allocates from the shared heap.
    ///
    /// # Errors
    ///
    /// See [`HeapAllocator::allocate`].
    pub fn allocate(&self, size: usize) -> MemoryResult<HeapPtr> {
        self.heap.lock().allocate(size, DEFAULT_ALIGNMENT)
    }

    /// Returns a heap allocation.
    ///
    /// # Errors
    ///
    /// See [`HeapAllocator::deallocate`].
    pub fn deallocate(&self, ptr: HeapPtr) -> MemoryResult<()> {
        self.heap.lock().deallocate(ptr)
    }

    /// Resizes a heap allocation.
    ///
    /// # Errors
    ///
    /// See [`HeapAllocator::reallocate`].
    pub fn reallocate(&self, ptr: Option<HeapPtr>, new_size: usize) -> MemoryResult<HeapPtr> {
        self.heap.lock().reallocate(ptr, new_size)
    }

    /// Allocates from the shared pool.
    ///
    /// # Errors
    ///
    /// See [`PoolAllocator::allocate`].
    pub fn pool_allocate(&self, size: usize) -> MemoryResult<PoolPtr> {
        self.with_pool(|pool, heap| pool.allocate(heap, size))
    }

    /// Returns a pool allocation.
    ///
    /// # Errors
    ///
    /// See [`PoolAllocator::free`].
    pub fn pool_free(&self, ptr: PoolPtr) -> MemoryResult<()> {
        self.with_pool(|pool, heap| pool.free(heap, ptr))
    }

    /// Runs `f` with the heap locked.
    pub fn with_heap<R>(&self, f: impl FnOnce(&mut HeapAllocator) -> R) -> R {
        f(&mut self.heap.lock())
    }

    /// Runs `f` with the pool and the heap locked.
    pub fn with_pool<R>(&self, f: impl FnOnce(&mut PoolAllocator, &mut HeapAllocator) -> R) -> R {
        let mut pool = self.pool.lock();
        let mut heap = self.heap.lock();
        f(&mut pool, &mut heap)
    }

    /// A fresh scratch allocator owned by the caller.
    ///
    /// # Errors
    ///
    /// `OutOfMemory` if the budget cannot hold another scratch arena.
    pub fn scratch(&self) -> MemoryResult<BumpAllocator> {
        BumpAllocator::with_capacity(self.platform.clone(), self.scratch_capacity)
    }
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext")
            .field("reserved", &self.platform.reserved_bytes())
            .field("budget", &self.platform.budget())
            .field("scratch_capacity", &self.scratch_capacity)
            .finish_non_exhaustive()
    }
}

/// Everything the engine core owns: allocators plus workers.
///
/// # Example
///
/// ```rust,ignore
/// let core = CoreContext::new(CoreConfig::default())?;
/// core.submit_with_memory(|memory| {
///     let ptr = memory.allocate(256).unwrap();
///     memory.deallocate(ptr).unwrap();
/// })?;
/// core.workers().wait_idle();
/// ```
#[derive(Debug)]
pub struct CoreContext {
    workers: WorkerPool,
    memory: Arc<MemoryContext>,
    config: CoreConfig,
}

impl CoreContext {
    /// Validates `config`, then builds the allocators and starts the
    /// workers.
    ///
    /// # Errors
    ///
    /// `Config` if validation fails, `Memory` if the reservations fail,
    /// `Worker` if a thread cannot be spawned.
    pub fn new(config: CoreConfig) -> CoreResult<Self> {
        config.validate()?;
        let memory = Arc::new(MemoryContext::new(&config.memory)?);
        let workers = WorkerPool::new(&config.workers)?;
        Ok(Self {
            workers,
            memory,
            config,
        })
    }

    /// Shared allocators.
    #[inline]
    #[must_use]
    pub fn memory(&self) -> &Arc<MemoryContext> {
        &self.memory
    }

    /// The worker pool.
    #[inline]
    #[must_use]
    pub fn workers(&self) -> &WorkerPool {
        &self.workers
    }

    /// The configuration this context was built from.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Queues a task on the worker pool.
    ///
    /// # Errors
    ///
    /// `ShutDown` after [`shutdown`](Self::shutdown).
    pub fn submit<F>(&self, task: F) -> Result<(), WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.workers.submit(task)
    }

    /// Queues a task that receives the shared allocators.
    ///
    /// # Errors
    ///
    /// `ShutDown` after [`shutdown`](Self::shutdown).
    pub fn submit_with_memory<F>(&self, task: F) -> Result<(), WorkerError>
    where
        F: FnOnce(&MemoryContext) + Send + 'static,
    {
        let memory = Arc::clone(&self.memory);
        self.workers.submit(move || task(&memory))
    }

    /// Stops the worker pool. The allocators stay usable.
    pub fn shutdown(&self) {
        self.workers.shutdown();
    }
}
