//! # Worker Pool
//!
//! Fixed set of named OS threads draining one [`BoundedQueue`] of tasks.
//!
//! ## Waking
//!
//! ```text
//!   submit ──push──> [BoundedQueue] <──pop── worker 0..N
//!      │                                        ▲
//!      └──lock wake_lock, notify_one────────────┘ (parked while empty)
//! ```
//!
//! Workers park on the condvar only while the pool is running and the
//! queue is empty, and re-check both under `wake_lock`. Submitters notify
//! while holding the same lock, so a push can never slip between a
//! worker's check and its wait.
//!
//! Tasks start in submission order. With more than one worker they may
//! finish in any order.

use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};

use crate::config::WorkerPoolConfig;
use crate::error::WorkerError;
use crate::sync::ring::BoundedQueue;

/// A unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// What a worker thread is doing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum WorkerState {
    /// Polling or parked.
    Idle = 0,
    /// Executing a task.
    Running = 1,
    /// Exited after shutdown.
    Terminated = 2,
}

impl WorkerState {
    const fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Running,
            _ => Self::Terminated,
        }
    }
}

/// State shared between the pool handle and its workers.
struct Shared {
    queue: BoundedQueue<Task>,
    /// Guards the park/notify handshake.
    wake_lock: Mutex<()>,
    wake: Condvar,
    running: AtomicBool,
    submitted: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
    /// Tasks still queued at shutdown, never run.
    discarded: AtomicU64,
    states: Box<[AtomicU8]>,
}

impl Shared {
    fn set_state(&self, index: usize, state: WorkerState) {
        self.states[index].store(state as u8, Ordering::Release);
    }
}

/// Fixed-size pool of worker threads.
///
/// # Example
///
/// ```rust,ignore
/// let pool = WorkerPool::new(&WorkerPoolConfig::default())?;
/// let hits = Arc::new(AtomicUsize::new(0));
///
/// for _ in 0..1000 {
///     let hits = Arc::clone(&hits);
///     pool.submit(move || {
///         hits.fetch_add(1, Ordering::Relaxed);
///     })?;
/// }
/// pool.wait_idle();
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    thread_count: usize,
}

impl WorkerPool {
    /// Starts the worker threads.
    ///
    /// # Errors
    ///
    /// `Spawn` if the OS refuses a thread. Threads already started are
    /// shut down first.
    pub fn new(config: &WorkerPoolConfig) -> Result<Self, WorkerError> {
        let thread_count = config.resolved_thread_count();
        let shared = Arc::new(Shared {
            queue: BoundedQueue::new(config.queue_capacity),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
            running: AtomicBool::new(true),
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
            states: (0..thread_count)
                .map(|_| AtomicU8::new(WorkerState::Idle as u8))
                .collect(),
        });

        let pool = Self {
            shared,
            handles: Mutex::new(Vec::with_capacity(thread_count)),
            thread_count,
        };

        for index in 0..thread_count {
            let name = format!("{}-{index}", config.thread_name);
            let shared = Arc::clone(&pool.shared);
            let spawned = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(&shared, index));

            match spawned {
                Ok(handle) => pool.handles.lock().push(handle),
                Err(err) => {
                    pool.shutdown();
                    return Err(WorkerError::Spawn {
                        name,
                        reason: err.to_string(),
                    });
                }
            }
        }

        tracing::info!(
            threads = thread_count,
            queue_capacity = config.queue_capacity,
            name = %config.thread_name,
            "worker pool started"
        );
        Ok(pool)
    }

    /// Queues a task.
    ///
    /// When the queue is full this wakes a worker and yields until a slot
    /// frees up. It never parks.
    ///
    /// The running check, the count and the push happen under `wake_lock`,
    /// the lock [`shutdown`](Self::shutdown) holds while it stops the
    /// pool. An accepted task is therefore either run or discarded.
    ///
    /// # Errors
    ///
    /// `ShutDown` once [`shutdown`](Self::shutdown) has begun.
    pub fn submit<F>(&self, task: F) -> Result<(), WorkerError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut task: Task = Box::new(task);
        loop {
            {
                let _guard = self.shared.wake_lock.lock();
                if !self.shared.running.load(Ordering::Acquire) {
                    return Err(WorkerError::ShutDown);
                }
                self.shared.submitted.fetch_add(1, Ordering::AcqRel);
                match self.shared.queue.push(task) {
                    Ok(()) => {
                        self.shared.wake.notify_one();
                        return Ok(());
                    }
                    Err(back) => {
                        self.shared.submitted.fetch_sub(1, Ordering::AcqRel);
                        task = back;
                        self.shared.wake.notify_one();
                    }
                }
            }
            thread::yield_now();
        }
    }

    /// Whether any submitted task has not finished yet.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        let done = self.shared.completed.load(Ordering::Acquire)
            + self.shared.discarded.load(Ordering::Acquire);
        done < self.shared.submitted.load(Ordering::Acquire)
    }

    /// Yields until every submitted task has finished.
    pub fn wait_idle(&self) {
        while self.is_busy() {
            thread::yield_now();
        }
    }

    /// Number of worker threads.
    #[inline]
    #[must_use]
    pub const fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Tasks accepted by [`submit`](Self::submit).
    #[must_use]
    pub fn submitted_count(&self) -> u64 {
        self.shared.submitted.load(Ordering::Acquire)
    }

    /// Tasks that ran to completion or panicked.
    #[must_use]
    pub fn completed_count(&self) -> u64 {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Tasks that panicked.
    #[must_use]
    pub fn panicked_count(&self) -> u64 {
        self.shared.panicked.load(Ordering::Acquire)
    }

    /// Tasks dropped unrun at shutdown.
    #[must_use]
    pub fn discarded_count(&self) -> u64 {
        self.shared.discarded.load(Ordering::Acquire)
    }

    /// Snapshot of every worker's state.
    #[must_use]
    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.shared
            .states
            .iter()
            .map(|state| WorkerState::from_u8(state.load(Ordering::Acquire)))
            .collect()
    }

    /// Whether the pool still accepts tasks.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stops the workers and joins them.
    ///
    /// Running tasks finish; queued tasks are dropped without running.
    /// Calling it again is a no-op. Must not be called from a task.
    pub fn shutdown(&self) {
        {
            let _guard = self.shared.wake_lock.lock();
            if !self.shared.running.swap(false, Ordering::AcqRel) {
                return;
            }
            self.shared.wake.notify_all();
        }

        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if handle.join().is_err() {
                tracing::error!("worker thread exited with a panic");
            }
        }

        let mut discarded = 0u64;
        while self.shared.queue.pop().is_some() {
            discarded += 1;
        }
        if discarded > 0 {
            self.shared.discarded.fetch_add(discarded, Ordering::AcqRel);
            tracing::warn!(discarded, "worker pool shut down with queued tasks");
        }

        tracing::info!(
            completed = self.completed_count(),
            panicked = self.panicked_count(),
            "worker pool stopped"
        );
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("thread_count", &self.thread_count)
            .field("running", &self.is_running())
            .field("submitted", &self.submitted_count())
            .field("completed", &self.completed_count())
            .finish_non_exhaustive()
    }
}

fn worker_loop(shared: &Shared, index: usize) {
    while shared.running.load(Ordering::Acquire) {
        if let Some(task) = shared.queue.pop() {
            shared.set_state(index, WorkerState::Running);
            run_task(shared, task);
            shared.set_state(index, WorkerState::Idle);
            continue;
        }

        let mut guard = shared.wake_lock.lock();
        while shared.running.load(Ordering::Acquire) && shared.queue.is_empty() {
            shared.wake.wait(&mut guard);
        }
    }

    shared.set_state(index, WorkerState::Terminated);
    tracing::trace!(worker = index, "worker exited");
}

fn run_task(shared: &Shared, task: Task) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::error!(%message, "task panicked");
        shared.panicked.fetch_add(1, Ordering::AcqRel);
    }
    shared.completed.fetch_add(1, Ordering::AcqRel);
}

/// Number of hardware threads, or 1 if it cannot be determined.
pub(crate) fn available_parallelism() -> usize {
    thread::available_parallelism().map_or(1, NonZeroUsize::get)
}
