// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! `fork` entry point.
//!
//! A fork body runs on a pool thread against a fresh `ForkController`.
//! Errors leaving the body go to the fork-level handler:
//!
//! | handler        | timeout               | other error           |
//! |----------------|-----------------------|-----------------------|
//! | none           | logged, swallowed     | logged, re-raised     |
//! | returns true   | swallowed             | swallowed             |
//! | returns false  | re-raised             | re-raised             |
//!
//! A re-raised error is what `ForkHandle::join` returns.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::center::ForkCenter;
use crate::config::{ForkConfig, SharedConfig};
use crate::controller::ForkController;
use crate::error::{ForkError, ForkResult};
use crate::owner::{OwnerExecutor, OwnerThread};
use crate::pool::PoolOptions;
use crate::waiter::{AsyncWaiter, Outcome, Resolution};

/// Handler for errors leaving a fork body: `(error, is_timeout) -> handled`.
pub type ForkHandler = Box<dyn FnOnce(&ForkError, bool) -> bool + Send + 'static>;

/// Entry point: owns the dispatch center and the owner executor.
#[derive(Clone)]
pub struct ForkRuntime {
    center: Arc<ForkCenter>,
    owner: Arc<dyn OwnerExecutor>,
}

impl ForkRuntime {
    pub fn new(config: SharedConfig, owner: Arc<dyn OwnerExecutor>) -> Self {
        Self::with_options(config, owner, PoolOptions::default())
    }

    pub fn with_options(
        config: SharedConfig,
        owner: Arc<dyn OwnerExecutor>,
        options: PoolOptions,
    ) -> Self {
        Self {
            center: Arc::new(ForkCenter::new(config, options)),
            owner,
        }
    }

    /// Runtime with a dedicated owner thread named `tfork-owner`.
    pub fn with_owner_thread(config: ForkConfig) -> ForkResult<Self> {
        let owner = OwnerThread::spawn("tfork-owner")?;
        Ok(Self::new(SharedConfig::new(config), Arc::new(owner)))
    }

    /// Run `body` on a worker thread with no fork-level handler.
    pub fn fork<F>(&self, body: F) -> ForkResult<ForkHandle>
    where
        F: FnOnce(&mut ForkController) -> ForkResult<()> + Send + 'static,
    {
        self.dispatch(body, None)
    }

    /// Run `body` on a worker thread; errors leaving it go to `handler`.
    pub fn fork_with<F, H>(&self, body: F, handler: H) -> ForkResult<ForkHandle>
    where
        F: FnOnce(&mut ForkController) -> ForkResult<()> + Send + 'static,
        H: FnOnce(&ForkError, bool) -> bool + Send + 'static,
    {
        self.dispatch(body, Some(Box::new(handler)))
    }

    fn dispatch<F>(&self, body: F, handler: Option<ForkHandler>) -> ForkResult<ForkHandle>
    where
        F: FnOnce(&mut ForkController) -> ForkResult<()> + Send + 'static,
    {
        let fork_id = self.center.next_fork_id();
        let done = AsyncWaiter::unbounded();
        let deliverer = done.deliverer();
        let mut controller = ForkController::new(fork_id, self.center.clone(), self.owner.clone());

        self.center.execute_fork(move |slot| {
            let span = tracing::debug_span!("fork", id = fork_id);
            let _enter = span.enter();

            let result = match panic::catch_unwind(AssertUnwindSafe(|| body(&mut controller))) {
                Ok(result) => result,
                Err(payload) => Err(ForkError::from_panic(payload)),
            };
            let result = match result {
                Ok(()) => Ok(()),
                Err(err) => settle_fork_error(fork_id, err, handler),
            };
            tracing::debug!(blocks = controller.blocks_issued(), ok = result.is_ok(), "fork finished");
            // Release the slot first so a joined fork is no longer counted.
            drop(slot);
            deliverer.deliver(result);
        })?;

        tracing::debug!(fork = fork_id, "fork dispatched");
        Ok(ForkHandle { fork_id, done })
    }

    pub fn live_forks(&self) -> usize {
        self.center.live_forks()
    }

    pub fn config(&self) -> &SharedConfig {
        self.center.config()
    }

    /// Stop accepting forks. Running forks finish normally.
    pub fn shutdown(&self) {
        self.center.shutdown();
    }
}

fn settle_fork_error(fork_id: u64, err: ForkError, handler: Option<ForkHandler>) -> ForkResult<()> {
    let is_timeout = err.is_timeout();
    match handler {
        Some(handler) => match panic::catch_unwind(AssertUnwindSafe(|| handler(&err, is_timeout))) {
            Ok(true) => Ok(()),
            Ok(false) => {
                tracing::error!(fork = fork_id, error = %err, "fork failed, handler declined");
                Err(err)
            }
            // A panicking handler re-raises; the panic replaces the error.
            Err(payload) => {
                let panicked = ForkError::from_panic(payload);
                tracing::error!(fork = fork_id, error = %err, handler = %panicked, "fork handler panicked");
                Err(panicked)
            }
        },
        None if is_timeout => {
            tracing::warn!(fork = fork_id, error = %err, "fork ended by await timeout");
            Ok(())
        }
        None => {
            tracing::error!(fork = fork_id, error = %err, "fork failed with unhandled error");
            Err(err)
        }
    }
}

/// Handle to a dispatched fork. Dropping it detaches the fork.
pub struct ForkHandle {
    fork_id: u64,
    done: AsyncWaiter<(), ForkError>,
}

impl std::fmt::Debug for ForkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForkHandle")
            .field("fork_id", &self.fork_id)
            .finish_non_exhaustive()
    }
}

impl ForkHandle {
    pub fn fork_id(&self) -> u64 {
        self.fork_id
    }

    pub fn is_finished(&self) -> bool {
        self.done.outcome().is_some()
    }

    /// Block until the fork body has finished. Returns the error the fork
    /// re-raised, if any.
    ///
    /// Do not call this on the thread that pumps an `OwnerQueue` while the
    /// fork may still `ui_await`: nothing runs the posted work, so the fork
    /// stays blocked until that await times out (five minutes by default).
    /// Pump the queue until `is_finished()` instead, then join.
    pub fn join(self) -> ForkResult<()> {
        match self.done.wait() {
            Resolution::Value(()) => Ok(()),
            Resolution::Error(err) => Err(err),
            // Unbounded waiter; only reachable if the slot was already taken.
            Resolution::Timeout => Ok(()),
        }
    }

    /// Outcome so far, without blocking.
    pub fn outcome(&self) -> Option<Outcome> {
        self.done.outcome()
    }
}
