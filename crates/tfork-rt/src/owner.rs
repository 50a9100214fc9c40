// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Owner ("UI") execution context.
//!
//! Work posted from forks runs one item at a time, in posting order, on a
//! single thread. `OwnerThread` owns a dedicated thread; `OwnerQueue` is
//! drained by whatever loop the host already runs on its main thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crate::error::{ForkError, ForkResult, panic_message};

pub type OwnerTask = Box<dyn FnOnce() + Send + 'static>;

/// A single-consumer FIFO executor.
pub trait OwnerExecutor: Send + Sync {
    /// Queue `task` to run after everything posted before it.
    fn post(&self, task: OwnerTask) -> ForkResult<()>;

    /// Whether the calling thread is the one that runs posted tasks.
    fn is_owner_thread(&self) -> bool;
}

fn run_task(task: OwnerTask) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(task)) {
        tracing::error!(panic = %panic_message(payload.as_ref()), "owner task panicked");
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Dedicated owner thread.
pub struct OwnerThread {
    sender: Mutex<Option<Sender<OwnerTask>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl OwnerThread {
    pub fn spawn(name: &str) -> ForkResult<Self> {
        let (tx, rx) = mpsc::channel::<OwnerTask>();
        let handle = thread::Builder::new().name(name.to_string()).spawn(move || {
            // Exits once every sender is gone and the queue is drained.
            while let Ok(task) = rx.recv() {
                run_task(task);
            }
        })?;
        Ok(Self {
            sender: Mutex::new(Some(tx)),
            thread_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop accepting tasks, run what is already queued, and join.
    pub fn shutdown(&self) {
        lock(&self.sender).take();
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Called from a task on the owner thread itself.
                return;
            }
            if handle.join().is_err() {
                tracing::error!("owner thread terminated abnormally");
            }
        }
    }
}

impl OwnerExecutor for OwnerThread {
    fn post(&self, task: OwnerTask) -> ForkResult<()> {
        match &*lock(&self.sender) {
            Some(tx) => tx.send(task).map_err(|_| ForkError::OwnerClosed),
            None => Err(ForkError::OwnerClosed),
        }
    }

    fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}

impl Drop for OwnerThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Owner queue drained by the host thread that created it.
pub struct OwnerQueue {
    sender: Mutex<Option<Sender<OwnerTask>>>,
    receiver: Mutex<Receiver<OwnerTask>>,
    thread_id: ThreadId,
}

impl OwnerQueue {
    /// Create a queue owned by the calling thread.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(rx),
            thread_id: thread::current().id(),
        }
    }

    /// Run tasks until the queue is empty. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = lock(&self.receiver).try_recv();
            match next {
                Ok(task) => {
                    run_task(task);
                    ran += 1;
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => return ran,
            }
        }
    }

    /// Wait up to `timeout` for one task and run it. Returns whether a task
    /// ran.
    pub fn run_next_timeout(&self, timeout: Duration) -> bool {
        let next = lock(&self.receiver).recv_timeout(timeout);
        match next {
            Ok(task) => {
                run_task(task);
                true
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => false,
        }
    }

    /// Refuse further posts. Already queued tasks can still be drained.
    pub fn close(&self) {
        lock(&self.sender).take();
    }
}

impl Default for OwnerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OwnerExecutor for OwnerQueue {
    fn post(&self, task: OwnerTask) -> ForkResult<()> {
        match &*lock(&self.sender) {
            Some(tx) => tx.send(task).map_err(|_| ForkError::OwnerClosed),
            None => Err(ForkError::OwnerClosed),
        }
    }

    fn is_owner_thread(&self) -> bool {
        thread::current().id() == self.thread_id
    }
}
