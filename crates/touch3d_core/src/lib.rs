//! # touch3d Core
//!
//! Memory management and task scheduling for the touch3d engine:
//! - General purpose heap over a lazily committed arena
//! - Bump allocators for per-task scratch memory
//! - Pool allocator for many small same-lifetime objects
//! - Fixed-size worker pool fed by a bounded FIFO
//!
//! ## Architecture Rules
//!
//! 1. **No globals** - Everything hangs off a [`CoreContext`] built at startup
//! 2. **Metadata out of line** - Allocator bookkeeping never lives in caller bytes
//! 3. **Offsets, not addresses** - Allocations are handles into a region
//!
//! ## Example
//!
//! ```rust,ignore
//! use touch3d_core::{CoreConfig, CoreContext};
//!
//! let core = CoreContext::new(CoreConfig::load("touch3d.toml")?)?;
//! let ptr = core.memory().allocate(1024)?;
//! core.memory().deallocate(ptr)?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]
#![allow(clippy::cast_possible_truncation, clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod memory;
pub mod sync;

pub use config::{CoreConfig, MemoryConfig, WorkerPoolConfig};
pub use context::{CoreContext, MemoryContext};
pub use error::{ConfigError, CoreError, CoreResult, MemoryError, MemoryResult, WorkerError};
pub use memory::{
    BumpAllocator, BumpPtr, HeapAllocator, HeapPtr, HeapStats, PlatformMemory, PoolAllocator,
    PoolPtr, VirtualMemory,
};
pub use sync::{BoundedQueue, Task, WorkerPool, WorkerState};
