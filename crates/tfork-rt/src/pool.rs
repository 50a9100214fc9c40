// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Growable worker pool.
//!
//! A job never waits for a busy worker: if no worker is idle a new thread
//! is started. Fork bodies block inside awaits while the awaited job runs
//! on another worker, so a fixed-size pool could deadlock. Idle workers
//! exit after `keep_alive`.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::error::{ForkError, ForkResult, panic_message};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Prefix for worker thread names; the worker id is appended.
    pub thread_name: String,
    /// How long an idle worker waits for work before exiting.
    pub keep_alive: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            thread_name: "tfork-worker".to_string(),
            keep_alive: Duration::from_secs(60),
        }
    }
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    /// Signalled when a job is queued or the pool shuts down.
    work_available: Condvar,
    options: PoolOptions,
}

#[derive(Default)]
struct PoolState {
    queue: VecDeque<Job>,
    /// Workers alive (busy or idle).
    workers: usize,
    /// Workers parked on `work_available`.
    idle: usize,
    next_id: usize,
    shutdown: bool,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkerPool {
    pub fn new(options: PoolOptions) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState::default()),
                work_available: Condvar::new(),
                options,
            }),
        }
    }

    /// Queue a job, starting a new worker if none is idle.
    pub fn execute<F>(&self, job: F) -> ForkResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut state = self.shared.lock();
        if state.shutdown {
            return Err(ForkError::PoolShutdown);
        }
        state.queue.push_back(Box::new(job));

        // Parked workers each take one job; start another thread for the rest.
        if state.queue.len() > state.idle {
            let id = state.next_id;
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-{}", self.shared.options.thread_name, id))
                .spawn(move || worker_loop(id, &shared));
            match spawned {
                Ok(_) => {
                    state.next_id += 1;
                    state.workers += 1;
                }
                Err(e) => {
                    if state.workers == 0 {
                        state.queue.pop_back();
                        return Err(ForkError::Spawn(e));
                    }
                    tracing::warn!(error = %e, "worker spawn failed, job queued for a busy worker");
                }
            }
        }
        drop(state);
        self.shared.work_available.notify_one();
        Ok(())
    }

    pub fn worker_count(&self) -> usize {
        self.shared.lock().workers
    }

    pub fn idle_count(&self) -> usize {
        self.shared.lock().idle
    }

    /// Refuse new jobs. Queued and running jobs still finish; idle workers
    /// exit. Does not join.
    pub fn shutdown(&self) {
        self.shared.lock().shutdown = true;
        self.shared.work_available.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.lock().shutdown
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(PoolOptions::default())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: &PoolShared) {
    tracing::trace!(worker = id, "worker started");
    let mut state = shared.lock();
    loop {
        if let Some(job) = state.queue.pop_front() {
            drop(state);
            run_job(id, job);
            state = shared.lock();
            continue;
        }
        if state.shutdown {
            break;
        }

        state.idle += 1;
        let (next, wait) = shared
            .work_available
            .wait_timeout(state, shared.options.keep_alive)
            .unwrap_or_else(PoisonError::into_inner);
        state = next;
        state.idle -= 1;

        if wait.timed_out() && state.queue.is_empty() {
            break;
        }
    }
    state.workers -= 1;
    tracing::trace!(worker = id, "worker exited");
}

/// Run one job; a panic is logged and the worker keeps going.
fn run_job(id: usize, job: Job) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
        tracing::error!(
            worker = id,
            panic = %panic_message(payload.as_ref()),
            "pool job panicked"
        );
    }
}
