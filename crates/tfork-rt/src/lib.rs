// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fork/await thread coordination.
//!
//! A fork body runs on a pooled worker thread and may block on nested
//! asynchronous operations (`await_async`), or hand work to a single owner
//! ("UI") thread (`ui_await`, `ui`). Blocking is real OS-thread blocking
//! with a deadline; a timed-out producer keeps running and its late result
//! is dropped.
//!
//! Components:
//! - waiter: one-shot value/error cell with deadline
//! - callback: producer handle given to await bodies
//! - config: thresholds and default timeout, shared and mutable
//! - pool: growable worker pool
//! - center: fork dispatch with live-fork accounting
//! - owner: single-thread FIFO executors
//! - controller: await/ui operations inside a fork
//! - fork: `ForkRuntime::fork` entry point and `ForkHandle`
//!
//! ```no_run
//! use tfork_rt::{ForkConfig, ForkRuntime};
//!
//! let rt = ForkRuntime::with_owner_thread(ForkConfig::default())?;
//! let handle = rt.fork_with(
//!     |ctl| {
//!         let size = ctl.await_async(|cb| {
//!             std::thread::spawn(move || cb.succeed(1024_usize));
//!         })?;
//!         ctl.ui(move || println!("loaded {size} bytes"));
//!         Ok(())
//!     },
//!     |err, is_timeout| {
//!         eprintln!("fork failed (timeout: {is_timeout}): {err}");
//!         true
//!     },
//! )?;
//! handle.join()?;
//! # Ok::<(), tfork_rt::ForkError>(())
//! ```

pub mod callback;
pub mod center;
pub mod config;
pub mod controller;
pub mod error;
pub mod fork;
pub mod owner;
pub mod pool;
pub mod waiter;

pub use callback::ForkCallback;
pub use center::{ForkCenter, LiveFork};
pub use config::{ConfigError, ForkConfig, SharedConfig};
pub use controller::ForkController;
pub use error::{BlockKind, BoxError, ForkError, ForkResult};
pub use fork::{ForkHandle, ForkHandler, ForkRuntime};
pub use owner::{OwnerExecutor, OwnerQueue, OwnerTask, OwnerThread};
pub use pool::{PoolOptions, WorkerPool};
pub use waiter::{AsyncWaiter, Deliverer, Outcome, Resolution};
