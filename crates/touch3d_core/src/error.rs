//! # Core Error Types
//!
//! All errors that can occur in the allocators, the worker pool and the
//! configuration layer.

use thiserror::Error;

/// Errors that can occur in the allocators.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// The arena or reservation cannot grow to satisfy the request.
    #[error("out of memory: requested {requested} bytes, {available} bytes available")]
    OutOfMemory {
        /// Bytes requested by the caller.
        requested: usize,
        /// Bytes still available in the reservation.
        available: usize,
    },

    /// A pointer that is not a live allocation of this allocator.
    #[error("invalid pointer: offset {0:#x} is not owned by this allocator")]
    InvalidPointer(usize),

    /// A bump allocator ran past the end of its reservation.
    #[error("capacity exceeded: requested {requested} bytes, {remaining} bytes remaining")]
    CapacityExceeded {
        /// Bytes requested by the caller.
        requested: usize,
        /// Bytes left in the reservation.
        remaining: usize,
    },

    /// Alignment is not a supported power of two.
    #[error("unsupported alignment: {0}")]
    InvalidAlignment(usize),

    /// The allocator has no reservation yet (or it was released).
    #[error("allocator is not initialized")]
    NotInitialized,

    /// Allocator bookkeeping is inconsistent.
    #[error("allocator metadata corrupted: {0}")]
    Corrupted(String),
}

/// Result type for allocator operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors that can occur in the worker pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The pool no longer accepts tasks.
    #[error("worker pool is shut down")]
    ShutDown,

    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread {name}: {reason}")]
    Spawn {
        /// Name of the thread that failed to start.
        name: String,
        /// OS error message.
        reason: String,
    },
}

/// Errors that can occur while loading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// Config file is not valid TOML for [`crate::CoreConfig`].
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config parsed but describes an unusable setup.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Any error produced while building or running the core.
#[derive(Error, Debug)]
pub enum CoreError {
    /// Allocator failure.
    #[error(transparent)]
    Memory(#[from] MemoryError),

    /// Worker pool failure.
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Result type for context-level operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Reports a pointer that the allocator does not own.
///
/// Continuing after a bad free risks corrupting the block list, so debug
/// builds stop here. Release builds log and hand the error back.
#[track_caller]
pub(crate) fn invalid_pointer(allocator: &'static str, offset: usize) -> MemoryError {
    tracing::error!(allocator, offset, "pointer is not a live allocation");
    if cfg!(debug_assertions) {
        panic!("invalid {allocator} pointer {offset:#x}");
    }
    MemoryError::InvalidPointer(offset)
}
