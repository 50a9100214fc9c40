// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Fork errors.

use std::any::Any;
use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Boxed error handed to a callback or returned from a fork body.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type ForkResult<T> = Result<T, ForkError>;

/// Which controller operation a block index refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Await,
    UiAwait,
    Ui,
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Await => write!(f, "await"),
            BlockKind::UiAwait => write!(f, "ui_await"),
            BlockKind::Ui => write!(f, "ui"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForkError {
    /// An await or ui_await deadline elapsed. Always unwinds the whole fork.
    #[error("{kind} timed out after {timeout:?}, block index {block}")]
    AwaitTimeout {
        kind: BlockKind,
        block: usize,
        timeout: Duration,
    },

    /// Error delivered through a callback, or raised inside a block body.
    #[error("{kind} failed, block index {block}: {source}")]
    Delivered {
        kind: BlockKind,
        block: usize,
        #[source]
        source: BoxError,
    },

    #[error("panicked: {message}")]
    Panicked { message: String },

    /// Live fork count went past `max_forks` at dispatch time.
    #[error("too many live forks ({live}), limit is {max}")]
    TooManyForks { live: usize, max: usize },

    #[error("owner executor is closed")]
    OwnerClosed,

    #[error("worker pool is shut down")]
    PoolShutdown,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] io::Error),

    /// Caller-domain error returned from a fork body.
    #[error(transparent)]
    Body(BoxError),
}

impl ForkError {
    pub fn body(err: impl Into<BoxError>) -> Self {
        ForkError::Body(err.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        ForkError::Panicked {
            message: panic_message(payload.as_ref()),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ForkError::AwaitTimeout { .. })
    }

    /// Block index of the await/ui call that failed, if any.
    pub fn block(&self) -> Option<usize> {
        match self {
            ForkError::AwaitTimeout { block, .. } | ForkError::Delivered { block, .. } => {
                Some(*block)
            }
            _ => None,
        }
    }

    /// The error originally handed to the callback, for downcasting.
    pub fn delivered_source(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        match self {
            ForkError::Delivered { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

/// Extract a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_carries_block_index() {
        let err = ForkError::AwaitTimeout {
            kind: BlockKind::UiAwait,
            block: 3,
            timeout: Duration::from_millis(50),
        };
        assert!(err.is_timeout());
        assert_eq!(err.block(), Some(3));
        assert_eq!(err.to_string(), "ui_await timed out after 50ms, block index 3");
    }

    #[test]
    fn delivered_source_downcasts() {
        let err = ForkError::Delivered {
            kind: BlockKind::Await,
            block: 0,
            source: Box::new(io::Error::new(io::ErrorKind::NotFound, "gone")),
        };
        assert!(!err.is_timeout());
        let io_err = err
            .delivered_source()
            .and_then(|e| e.downcast_ref::<io::Error>())
            .expect("io error source");
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn panic_payloads() {
        let err = ForkError::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "panicked: boom");
        let err = ForkError::from_panic(Box::new(String::from("bang")));
        assert_eq!(err.to_string(), "panicked: bang");
        let err = ForkError::from_panic(Box::new(7u8));
        assert_eq!(err.to_string(), "panicked: unknown panic");
    }

    #[test]
    fn body_error_is_transparent() {
        let err = ForkError::body("bad input");
        assert_eq!(err.to_string(), "bad input");
        assert_eq!(err.block(), None);
    }
}
