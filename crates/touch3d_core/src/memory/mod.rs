//! # Memory Management
//!
//! Allocators for the engine core. The process heap is never touched for
//! engine data; every allocator draws from a [`PlatformMemory`] reservation.
//!
//! ## Allocators
//!
//! - [`HeapAllocator`]: general purpose first-fit heap with coalescing
//! - [`BumpAllocator`]: scratch memory that is reset all at once
//! - [`PoolAllocator`]: many small objects inside one heap block

pub mod bump;
pub mod heap;
pub mod platform;
pub mod pool;

pub use bump::{BumpAllocator, BumpPtr, BUMP_ALIGNMENT};
pub use heap::{HeapAllocator, HeapPtr, HeapStats, DEFAULT_ALIGNMENT, HEADER_SIZE, MAX_ALIGNMENT};
pub use platform::{CommitPolicy, PlatformMemory, Protection, Region, VirtualMemory, WORD};
pub use pool::{PoolAllocationDescriptor, PoolAllocator, PoolPtr, DESCRIPTOR_SIZE};
