//! # Core Stress
//!
//! Soak test for the allocators and the worker pool.
//!
//! ```text
//! core_stress [CONFIG.toml] [TASKS]
//! ```
//!
//! Every task drives a seeded random mix of heap, pool and scratch
//! operations against the shared context, checking its own bytes as it
//! goes. The run fails if any task sees corrupted data or the heap fails
//! its invariant check afterwards.

use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use touch3d::logging::{init_logging, LogConfig};
use touch3d::{CoreConfig, CoreContext, CoreError, HeapPtr, MemoryContext, MemoryResult, PoolPtr};

const DEFAULT_TASKS: usize = 2_000;
const OPS_PER_TASK: usize = 64;
const SEED: u64 = 0x7043_3d00;

fn main() -> ExitCode {
    if let Err(err) = init_logging(LogConfig::default()) {
        eprintln!("failed to initialize logging: {err}");
    }

    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!(%err, "core stress aborted");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<bool, CoreError> {
    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => CoreConfig::load(path)?,
        None => CoreConfig::default(),
    };
    let tasks = args
        .next()
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(DEFAULT_TASKS);

    let core = CoreContext::new(config)?;
    tracing::info!(
        tasks,
        threads = core.workers().thread_count(),
        "starting core stress"
    );

    let failures = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    for task in 0..tasks {
        let failures = Arc::clone(&failures);
        core.submit_with_memory(move |memory| {
            let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ task as u64);
            match churn(memory, &mut rng) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::error!(task, "task observed corrupted bytes");
                    failures.fetch_add(1, Ordering::Relaxed);
                }
                Err(err) => {
                    tracing::error!(task, %err, "task allocation failed");
                    failures.fetch_add(1, Ordering::Relaxed);
                }
            }
        })?;
    }

    core.workers().wait_idle();
    let elapsed = started.elapsed();

    let memory = core.memory();
    memory.with_heap(|heap| heap.check_invariants())?;
    let stats = memory.with_heap(|heap| heap.stats());
    let descriptors = memory.with_pool(|pool, _| pool.descriptor_count());
    let failures = failures.load(Ordering::Relaxed);

    tracing::info!(
        elapsed_ms = elapsed.as_millis() as u64,
        completed = core.workers().completed_count(),
        panicked = core.workers().panicked_count(),
        failures,
        allocations = stats.allocations,
        reallocations = stats.reallocations,
        peak_arena = stats.peak_arena,
        pool_descriptors = descriptors,
        reserved = memory.platform().reserved_bytes(),
        "core stress finished"
    );

    core.shutdown();
    Ok(failures == 0 && core.workers().panicked_count() == 0)
}

/// One live heap or pool allocation and the byte it holds.
enum Held {
    Heap { ptr: HeapPtr, len: usize, tag: u8 },
    Pool { ptr: PoolPtr, tag: u8 },
}

/// Runs one task's operation mix. `Ok(false)` means a byte check failed.
///
/// Whatever is still held when the mix ends, early on an error or not, is
/// handed back to the shared context before returning.
fn churn(memory: &MemoryContext, rng: &mut ChaCha8Rng) -> MemoryResult<bool> {
    let mut held: Vec<Held> = Vec::new();
    let outcome = mix(memory, rng, &mut held);

    let mut intact = true;
    let mut first_error = None;
    for item in held {
        if outcome.is_ok() {
            match verify(memory, &item) {
                Ok(ok) => intact &= ok,
                Err(err) => {
                    first_error.get_or_insert(err);
                }
            }
        }
        if let Err(err) = release(memory, item) {
            first_error.get_or_insert(err);
        }
    }

    let mixed = outcome?;
    match first_error {
        Some(err) => Err(err),
        None => Ok(mixed && intact),
    }
}

fn mix(memory: &MemoryContext, rng: &mut ChaCha8Rng, held: &mut Vec<Held>) -> MemoryResult<bool> {
    let mut scratch = memory.scratch()?;
    let mut intact = true;

    for _ in 0..OPS_PER_TASK {
        let tag: u8 = rng.gen_range(1..=255);
        match rng.gen_range(0..6) {
            0 | 1 => {
                let len = rng.gen_range(1..4096);
                let ptr = memory.allocate(len)?;
                held.push(Held::Heap { ptr, len, tag });
                memory.with_heap(|heap| heap.bytes_mut(ptr).map(|b| b[..len].fill(tag)))?;
            }
            2 => {
                let len = rng.gen_range(1..256);
                let ptr = memory.pool_allocate(len)?;
                held.push(Held::Pool { ptr, tag });
                memory.with_pool(|pool, heap| pool.bytes_mut(heap, ptr).map(|b| b.fill(tag)))?;
            }
            3 if !held.is_empty() => {
                let index = rng.gen_range(0..held.len());
                if let Held::Heap { ptr, len, tag } = held[index] {
                    let new_len = rng.gen_range(1..8192);
                    let ptr = memory.reallocate(Some(ptr), new_len)?;
                    held[index] = Held::Heap {
                        ptr,
                        len: len.min(new_len),
                        tag,
                    };
                }
            }
            4 if !held.is_empty() => {
                let index = rng.gen_range(0..held.len());
                let gone = held.swap_remove(index);
                let verified = verify(memory, &gone);
                release(memory, gone)?;
                intact &= verified?;
            }
            _ => {
                let len = rng.gen_range(1..1024);
                let ptr = match scratch.allocate(len) {
                    Ok(ptr) => ptr,
                    Err(_) => {
                        scratch.reset();
                        scratch.allocate(len)?
                    }
                };
                scratch.bytes_mut(ptr)?.fill(tag);
                intact &= scratch.bytes(ptr)?.iter().all(|&b| b == tag);
            }
        }
    }
    Ok(intact)
}

fn verify(memory: &MemoryContext, item: &Held) -> MemoryResult<bool> {
    match *item {
        Held::Heap { ptr, len, tag } => memory.with_heap(|heap| {
            heap.bytes(ptr).map(|b| b[..len].iter().all(|&x| x == tag))
        }),
        Held::Pool { ptr, tag } => memory.with_pool(|pool, heap| {
            pool.bytes(heap, ptr).map(|b| b.iter().all(|&x| x == tag))
        }),
    }
}

fn release(memory: &MemoryContext, item: Held) -> MemoryResult<()> {
    match item {
        Held::Heap { ptr, .. } => memory.deallocate(ptr),
        Held::Pool { ptr, .. } => memory.pool_free(ptr),
    }
}
