//! # Core Configuration
//!
//! Loaded once at startup from TOML. Every field has a default, so an
//! empty file (or no file) is a valid configuration.
//!
//! ```toml
//! [memory]
//! heap_arena_limit = 268435456
//! pool_size = 16777216
//!
//! [workers]
//! thread_count = 8
//! queue_capacity = 256
//! ```

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::memory::{DESCRIPTOR_SIZE, HEADER_SIZE};
use crate::sync::available_parallelism;

const MIB: usize = 1024 * 1024;

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Allocator sizing.
    pub memory: MemoryConfig,
    /// Worker pool sizing.
    pub workers: WorkerPoolConfig,
}

/// Allocator sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Total bytes all reservations together may claim.
    pub reservation_budget: usize,
    /// Largest size the heap arena may grow to.
    pub heap_arena_limit: usize,
    /// Bytes reserved for the shared pool.
    pub pool_size: usize,
    /// Initial capacity of the pool's descriptor table.
    pub pool_descriptor_capacity: usize,
    /// Capacity of each scratch bump allocator.
    pub scratch_capacity: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            reservation_budget: 1024 * MIB,
            heap_arena_limit: 256 * MIB,
            pool_size: 16 * MIB,
            pool_descriptor_capacity: 100,
            scratch_capacity: MIB,
        }
    }
}

/// Worker pool sizing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Worker threads. `0` uses the available hardware parallelism.
    pub thread_count: usize,
    /// Slots in the task queue (one is always kept empty).
    pub queue_capacity: usize,
    /// Thread name prefix; workers are named `{thread_name}-{index}`.
    pub thread_name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            thread_count: 0,
            queue_capacity: 256,
            thread_name: "touch3d-worker".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    /// Thread count with `0` replaced by the available parallelism.
    #[must_use]
    pub fn resolved_thread_count(&self) -> usize {
        match self.thread_count {
            0 => available_parallelism(),
            n => n,
        }
    }
}

impl CoreConfig {
    /// Parses a TOML document and validates it.
    ///
    /// # Errors
    ///
    /// `Parse` on malformed TOML, `Invalid` if validation fails.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a TOML file.
    ///
    /// # Errors
    ///
    /// `Io` if the file cannot be read, otherwise as
    /// [`from_toml_str`](Self::from_toml_str).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), "loaded core config");
        Ok(config)
    }

    /// Checks that the configuration describes a usable setup.
    ///
    /// # Errors
    ///
    /// `Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let memory = &self.memory;
        let invalid = |what: String| Err(ConfigError::Invalid(what));

        if memory.heap_arena_limit > memory.reservation_budget {
            return invalid(format!(
                "memory.heap_arena_limit ({}) exceeds memory.reservation_budget ({})",
                memory.heap_arena_limit, memory.reservation_budget
            ));
        }
        if memory.pool_size == 0 {
            return invalid("memory.pool_size must be non-zero".to_string());
        }
        // Pool bytes, its table and two block headers must fit in the arena.
        let pool_footprint = memory
            .pool_size
            .saturating_add(memory.pool_descriptor_capacity.saturating_mul(DESCRIPTOR_SIZE))
            .saturating_add(2 * HEADER_SIZE);
        if pool_footprint > memory.heap_arena_limit {
            return invalid(format!(
                "memory.pool_size ({}) does not fit in memory.heap_arena_limit ({})",
                memory.pool_size, memory.heap_arena_limit
            ));
        }
        if memory.scratch_capacity == 0 {
            return invalid("memory.scratch_capacity must be non-zero".to_string());
        }
        if self.workers.queue_capacity < 2 {
            return invalid(format!(
                "workers.queue_capacity must be at least 2, got {}",
                self.workers.queue_capacity
            ));
        }
        if self.workers.thread_name.is_empty() {
            return invalid("workers.thread_name must not be empty".to_string());
        }
        Ok(())
    }
}
