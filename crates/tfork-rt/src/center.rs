// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fork dispatch: worker pool plus live-fork accounting.
//!
//! Forks are the governed unit. Awaits nested inside a fork run on the
//! same pool without being counted.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::SharedConfig;
use crate::error::{ForkError, ForkResult};
use crate::pool::{PoolOptions, WorkerPool};

pub struct ForkCenter {
    pool: WorkerPool,
    live: Arc<AtomicUsize>,
    next_fork_id: AtomicU64,
    config: SharedConfig,
}

/// One counted live fork. Dropping it releases the slot, whether the fork
/// body returned, panicked, or never got to run.
pub struct LiveFork {
    live: Arc<AtomicUsize>,
}

impl Drop for LiveFork {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ForkCenter {
    pub fn new(config: SharedConfig, options: PoolOptions) -> Self {
        Self {
            pool: WorkerPool::new(options),
            live: Arc::new(AtomicUsize::new(0)),
            next_fork_id: AtomicU64::new(0),
            config,
        }
    }

    /// Dispatch a fork body. Fails without running `job` when the live
    /// count would go past `max_forks`. The job receives its `LiveFork`
    /// slot and may release it early; otherwise it is released on return.
    pub fn execute_fork<F>(&self, job: F) -> ForkResult<()>
    where
        F: FnOnce(LiveFork) + Send + 'static,
    {
        let (warning, max) = self.config.read(|c| (c.warning_forks, c.max_forks));

        // Check and increment in one step; a refused dispatch never touches
        // the counter.
        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        let live = match reserved {
            Ok(previous) => previous + 1,
            Err(current) => {
                let live = current + 1;
                tracing::error!(live, max, "fork refused, live fork limit reached");
                return Err(ForkError::TooManyForks { live, max });
            }
        };
        let guard = LiveFork {
            live: self.live.clone(),
        };

        if live > warning {
            tracing::warn!(live, warning, max, "live fork count above warning threshold");
        }

        // On failure the pool drops the job, and the guard with it.
        self.pool.execute(move || job(guard))
    }

    /// Dispatch an await body. Not counted.
    pub fn execute<F>(&self, job: F) -> ForkResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.pool.execute(job)
    }

    pub fn live_forks(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn next_fork_id(&self) -> u64 {
        self.next_fork_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn config(&self) -> &SharedConfig {
        &self.config
    }

    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}
