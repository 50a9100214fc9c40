// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-use wait cell with deadline.
//!
//! One producer resolves the cell with a value or an error; one consumer
//! blocks on it. Only the first delivery counts. If the deadline passes
//! first the cell is closed and late deliveries are dropped. The producer
//! itself is never interrupted.

use std::mem;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Final state of a waiter, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Error,
    Timeout,
}

/// What `AsyncWaiter::wait` hands back to the consumer.
#[derive(Debug)]
pub enum Resolution<T, E> {
    Value(T),
    Error(E),
    Timeout,
}

impl<T, E> Resolution<T, E> {
    pub fn outcome(&self) -> Outcome {
        match self {
            Resolution::Value(_) => Outcome::Success,
            Resolution::Error(_) => Outcome::Error,
            Resolution::Timeout => Outcome::Timeout,
        }
    }
}

enum Slot<T, E> {
    Pending,
    Value(T),
    Error(E),
    TimedOut,
    /// Payload already handed to the consumer.
    Taken(Outcome),
}

impl<T, E> Slot<T, E> {
    fn outcome(&self) -> Option<Outcome> {
        match self {
            Slot::Pending => None,
            Slot::Value(_) => Some(Outcome::Success),
            Slot::Error(_) => Some(Outcome::Error),
            Slot::TimedOut => Some(Outcome::Timeout),
            Slot::Taken(outcome) => Some(*outcome),
        }
    }
}

struct Cell<T, E> {
    slot: Mutex<Slot<T, E>>,
    resolved: Condvar,
}

impl<T, E> Cell<T, E> {
    fn lock(&self) -> MutexGuard<'_, Slot<T, E>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn resolve(&self, next: Slot<T, E>) -> bool {
        let mut slot = self.lock();
        if !matches!(*slot, Slot::Pending) {
            return false;
        }
        *slot = next;
        drop(slot);
        self.resolved.notify_all();
        true
    }
}

/// Consumer side. Create one per blocking call; hand `deliverer()` clones
/// to whoever produces the result.
pub struct AsyncWaiter<T, E> {
    cell: Arc<Cell<T, E>>,
    deadline: Option<Instant>,
}

impl<T, E> AsyncWaiter<T, E> {
    /// Waiter whose deadline is `timeout` from now. `Duration::ZERO` waits
    /// indefinitely.
    pub fn new(timeout: Duration) -> Self {
        let deadline = if timeout.is_zero() {
            None
        } else {
            Instant::now().checked_add(timeout)
        };
        Self {
            cell: Arc::new(Cell {
                slot: Mutex::new(Slot::Pending),
                resolved: Condvar::new(),
            }),
            deadline,
        }
    }

    pub fn unbounded() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn deliverer(&self) -> Deliverer<T, E> {
        Deliverer {
            cell: self.cell.clone(),
        }
    }

    /// Resolve with a value. Returns false if already resolved or timed out.
    pub fn deliver_value(&self, value: T) -> bool {
        self.cell.resolve(Slot::Value(value))
    }

    /// Resolve with an error. Returns false if already resolved or timed out.
    pub fn deliver_error(&self, error: E) -> bool {
        self.cell.resolve(Slot::Error(error))
    }

    /// Current outcome without blocking; `None` while pending.
    pub fn outcome(&self) -> Option<Outcome> {
        self.cell.lock().outcome()
    }

    /// Block until resolved or the deadline passes.
    pub fn wait(self) -> Resolution<T, E> {
        let mut slot = self.cell.lock();
        loop {
            if !matches!(*slot, Slot::Pending) {
                break;
            }
            match self.deadline {
                None => {
                    slot = self
                        .cell
                        .resolved
                        .wait(slot)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        *slot = Slot::TimedOut;
                        break;
                    }
                    // Spurious wakeups and early returns loop back to the
                    // deadline check.
                    slot = self
                        .cell
                        .resolved
                        .wait_timeout(slot, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        let outcome = slot.outcome().unwrap_or(Outcome::Timeout);
        match mem::replace(&mut *slot, Slot::Taken(outcome)) {
            Slot::Value(value) => Resolution::Value(value),
            Slot::Error(error) => Resolution::Error(error),
            Slot::Pending | Slot::TimedOut | Slot::Taken(_) => Resolution::Timeout,
        }
    }
}

/// Producer side of an `AsyncWaiter`. Cheap to clone; every clone shares
/// the same one-shot slot.
pub struct Deliverer<T, E> {
    cell: Arc<Cell<T, E>>,
}

impl<T, E> Clone for Deliverer<T, E> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<T, E> Deliverer<T, E> {
    pub fn deliver_value(&self, value: T) -> bool {
        self.cell.resolve(Slot::Value(value))
    }

    pub fn deliver_error(&self, error: E) -> bool {
        self.cell.resolve(Slot::Error(error))
    }

    pub fn deliver(&self, result: Result<T, E>) -> bool {
        match result {
            Ok(value) => self.deliver_value(value),
            Err(error) => self.deliver_error(error),
        }
    }

    pub fn is_resolved(&self) -> bool {
        !matches!(*self.cell.lock(), Slot::Pending)
    }
}
