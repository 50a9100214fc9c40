// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Result handle given to `await_async` bodies.

use crate::error::{BlockKind, BoxError, ForkError};
use crate::waiter::Deliverer;

/// One-shot result channel for an asynchronous block.
///
/// The block must call `succeed` or `fail` exactly once. If it never does,
/// the awaiting fork stays blocked until the await deadline.
pub struct ForkCallback<R> {
    deliverer: Deliverer<R, ForkError>,
    kind: BlockKind,
    block: usize,
}

impl<R> Clone for ForkCallback<R> {
    fn clone(&self) -> Self {
        Self {
            deliverer: self.deliverer.clone(),
            kind: self.kind,
            block: self.block,
        }
    }
}

impl<R> ForkCallback<R> {
    pub(crate) fn new(deliverer: Deliverer<R, ForkError>, kind: BlockKind, block: usize) -> Self {
        Self {
            deliverer,
            kind,
            block,
        }
    }

    /// Hand back the result. Ignored if the block already resolved or the
    /// await timed out.
    pub fn succeed(&self, value: R) {
        if !self.deliverer.deliver_value(value) {
            tracing::debug!(kind = %self.kind, block = self.block, "late result dropped");
        }
    }

    /// Hand back an error. Ignored if the block already resolved or the
    /// await timed out.
    pub fn fail(&self, error: impl Into<BoxError>) {
        let error = ForkError::Delivered {
            kind: self.kind,
            block: self.block,
            source: error.into(),
        };
        if !self.deliverer.deliver_error(error) {
            tracing::debug!(kind = %self.kind, block = self.block, "late error dropped");
        }
    }

    pub fn block(&self) -> usize {
        self.block
    }

    pub fn is_resolved(&self) -> bool {
        self.deliverer.is_resolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::{AsyncWaiter, Resolution};
    use std::time::Duration;

    #[test]
    fn fail_wraps_with_block_index() {
        let waiter: AsyncWaiter<u32, ForkError> = AsyncWaiter::new(Duration::from_secs(1));
        let cb = ForkCallback::new(waiter.deliverer(), BlockKind::Await, 4);
        assert_eq!(cb.block(), 4);
        cb.fail("disk on fire");
        assert!(cb.is_resolved());
        match waiter.wait() {
            Resolution::Error(err) => {
                assert_eq!(err.block(), Some(4));
                assert_eq!(err.to_string(), "await failed, block index 4: disk on fire");
            }
            other => panic!("expected error, got {:?}", other.outcome()),
        }
    }

    #[test]
    fn clones_share_one_slot() {
        let waiter: AsyncWaiter<u32, ForkError> = AsyncWaiter::new(Duration::from_secs(1));
        let cb = ForkCallback::new(waiter.deliverer(), BlockKind::Await, 0);
        let other = cb.clone();
        cb.succeed(1);
        other.succeed(2);
        other.fail("ignored");
        assert!(matches!(waiter.wait(), Resolution::Value(1)));
    }
}
