// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Operations available inside a fork body.
//!
//! Every call blocks the fork thread except `ui`. Each call takes the next
//! block index, which only shows up in errors and logs.
//!
//! Error flow: a delivered error (explicit `fail`, or a panic inside the
//! block) is offered to the per-call handler when one is given. A timeout
//! never is; it always propagates and ends the fork.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::callback::ForkCallback;
use crate::center::ForkCenter;
use crate::error::{BlockKind, ForkError, ForkResult};
use crate::owner::OwnerExecutor;
use crate::waiter::{AsyncWaiter, Resolution};

/// Session object for one fork body. Lives on the fork's worker thread.
pub struct ForkController {
    fork_id: u64,
    center: Arc<ForkCenter>,
    owner: Arc<dyn OwnerExecutor>,
    block_counter: usize,
}

impl ForkController {
    pub(crate) fn new(fork_id: u64, center: Arc<ForkCenter>, owner: Arc<dyn OwnerExecutor>) -> Self {
        Self {
            fork_id,
            center,
            owner,
            block_counter: 0,
        }
    }

    pub fn fork_id(&self) -> u64 {
        self.fork_id
    }

    /// Number of await/ui calls made so far.
    pub fn blocks_issued(&self) -> usize {
        self.block_counter
    }

    /// Run `body` on a pool thread and block until it calls back, using the
    /// configured default timeout.
    pub fn await_async<R, F>(&mut self, body: F) -> ForkResult<R>
    where
        R: Send + 'static,
        F: FnOnce(ForkCallback<R>) + Send + 'static,
    {
        self.await_inner(None, body)
    }

    pub fn await_async_for<R, F>(&mut self, timeout: Duration, body: F) -> ForkResult<R>
    where
        R: Send + 'static,
        F: FnOnce(ForkCallback<R>) + Send + 'static,
    {
        self.await_inner(Some(timeout), body)
    }

    /// Like `await_async`, but a delivered error is first offered to
    /// `handler`. Returning true absorbs it and yields `Ok(None)`.
    pub fn await_async_handled<R, F, H>(
        &mut self,
        timeout: Option<Duration>,
        body: F,
        handler: H,
    ) -> ForkResult<Option<R>>
    where
        R: Send + 'static,
        F: FnOnce(ForkCallback<R>) + Send + 'static,
        H: FnOnce(&ForkError) -> bool,
    {
        let result = self.await_inner(timeout, body);
        self.absorb(result, handler)
    }

    /// Run `body` on the owner executor and block until it has finished.
    pub fn ui_await<R, F>(&mut self, body: F) -> ForkResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.ui_await_inner(None, body)
    }

    pub fn ui_await_for<R, F>(&mut self, timeout: Duration, body: F) -> ForkResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        self.ui_await_inner(Some(timeout), body)
    }

    pub fn ui_await_handled<R, F, H>(
        &mut self,
        timeout: Option<Duration>,
        body: F,
        handler: H,
    ) -> ForkResult<Option<R>>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
        H: FnOnce(&ForkError) -> bool,
    {
        let result = self.ui_await_inner(timeout, body);
        self.absorb(result, handler)
    }

    /// Post `body` to the owner executor and return at once.
    pub fn ui<F>(&mut self, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let block = self.next_block();
        if let Err(e) = self.owner.post(Box::new(body)) {
            tracing::warn!(fork = self.fork_id, kind = %BlockKind::Ui, block, error = %e, "ui block dropped");
        }
    }

    fn await_inner<R, F>(&mut self, timeout: Option<Duration>, body: F) -> ForkResult<R>
    where
        R: Send + 'static,
        F: FnOnce(ForkCallback<R>) + Send + 'static,
    {
        let kind = BlockKind::Await;
        let block = self.next_block();
        let timeout = self.timeout_or_default(timeout);
        let waiter = AsyncWaiter::new(timeout);
        let callback = ForkCallback::new(waiter.deliverer(), kind, block);
        let on_panic = callback.clone();

        let dispatched = self.center.execute(move || {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(move || body(callback))) {
                on_panic.fail(ForkError::from_panic(payload));
            }
        });
        if let Err(e) = dispatched {
            waiter.deliver_error(ForkError::Delivered {
                kind,
                block,
                source: Box::new(e),
            });
        }

        self.settle(kind, block, timeout, waiter.wait())
    }

    fn ui_await_inner<R, F>(&mut self, timeout: Option<Duration>, body: F) -> ForkResult<R>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let kind = BlockKind::UiAwait;
        let block = self.next_block();
        let timeout = self.timeout_or_default(timeout);
        let waiter = AsyncWaiter::new(timeout);
        let deliverer = waiter.deliverer();

        let posted = self.owner.post(Box::new(move || {
            let result = panic::catch_unwind(AssertUnwindSafe(body)).map_err(|payload| {
                ForkError::Delivered {
                    kind,
                    block,
                    source: Box::new(ForkError::from_panic(payload)),
                }
            });
            deliverer.deliver(result);
        }));
        if let Err(e) = posted {
            waiter.deliver_error(ForkError::Delivered {
                kind,
                block,
                source: Box::new(e),
            });
        }

        self.settle(kind, block, timeout, waiter.wait())
    }

    fn settle<R>(
        &self,
        kind: BlockKind,
        block: usize,
        timeout: Duration,
        resolution: Resolution<R, ForkError>,
    ) -> ForkResult<R> {
        tracing::debug!(
            fork = self.fork_id,
            %kind,
            block,
            outcome = ?resolution.outcome(),
            "block settled"
        );
        match resolution {
            Resolution::Value(value) => Ok(value),
            Resolution::Error(err) => Err(err),
            Resolution::Timeout => Err(ForkError::AwaitTimeout {
                kind,
                block,
                timeout,
            }),
        }
    }

    fn absorb<R, H>(&self, result: ForkResult<R>, handler: H) -> ForkResult<Option<R>>
    where
        H: FnOnce(&ForkError) -> bool,
    {
        match result {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_timeout() => Err(err),
            Err(err) => {
                if handler(&err) {
                    tracing::debug!(fork = self.fork_id, block = ?err.block(), "block error handled");
                    Ok(None)
                } else {
                    Err(err)
                }
            }
        }
    }

    fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or_else(|| self.center.config().default_await_timeout())
    }

    fn next_block(&mut self) -> usize {
        let block = self.block_counter;
        self.block_counter += 1;
        block
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ForkConfig, SharedConfig};
    use crate::owner::OwnerThread;
    use crate::pool::PoolOptions;
    use std::io;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Instant;

    fn controller() -> (ForkController, Arc<OwnerThread>) {
        let config = SharedConfig::new(ForkConfig {
            default_await_timeout: Duration::from_secs(5),
            ..ForkConfig::default()
        });
        let center = Arc::new(ForkCenter::new(config, PoolOptions::default()));
        let owner = Arc::new(OwnerThread::spawn("test-owner").unwrap());
        (ForkController::new(0, center, owner.clone()), owner)
    }

    #[test]
    fn await_returns_value() {
        let (mut ctl, _owner) = controller();
        let v = ctl.await_async(|cb| cb.succeed(42)).unwrap();
        assert_eq!(v, 42);
        assert_eq!(ctl.blocks_issued(), 1);
    }

    #[test]
    fn await_value_from_another_thread() {
        let (mut ctl, _owner) = controller();
        let v = ctl
            .await_async(|cb: ForkCallback<String>| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(10));
                    cb.succeed("loaded".to_string());
                });
            })
            .unwrap();
        assert_eq!(v, "loaded");
    }

    #[test]
    fn await_reraises_delivered_error() {
        let (mut ctl, _owner) = controller();
        let err = ctl
            .await_async(|cb: ForkCallback<()>| {
                cb.fail(io::Error::new(io::ErrorKind::TimedOut, "upstream"))
            })
            .unwrap_err();
        assert!(!err.is_timeout());
        assert_eq!(err.block(), Some(0));
        let source = err.delivered_source().unwrap().downcast_ref::<io::Error>().unwrap();
        assert_eq!(source.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn handled_error_yields_none() {
        let (mut ctl, _owner) = controller();
        let mut seen = None;
        let v = ctl
            .await_async_handled(
                None,
                |cb: ForkCallback<u8>| cb.fail("nope"),
                |e| {
                    seen = e.block();
                    true
                },
            )
            .unwrap();
        assert_eq!(v, None);
        assert_eq!(seen, Some(0));
        // The fork carries on.
        assert_eq!(ctl.await_async(|cb| cb.succeed(1u8)).unwrap(), 1);
        assert_eq!(ctl.blocks_issued(), 2);
    }

    #[test]
    fn unhandled_error_propagates() {
        let (mut ctl, _owner) = controller();
        let err = ctl
            .await_async_handled(None, |cb: ForkCallback<u8>| cb.fail("nope"), |_| false)
            .unwrap_err();
        assert_eq!(err.to_string(), "await failed, block index 0: nope");
    }

    #[test]
    fn panic_in_await_body_becomes_error() {
        let (mut ctl, _owner) = controller();
        let err = ctl
            .await_async(|_cb: ForkCallback<u8>| panic!("producer crashed"))
            .unwrap_err();
        let source = err.delivered_source().unwrap().downcast_ref::<ForkError>().unwrap();
        assert!(matches!(source, ForkError::Panicked { message } if message == "producer crashed"));
    }

    #[test]
    fn await_timeout_skips_handler() {
        let (mut ctl, _owner) = controller();
        let handler_called = AtomicBool::new(false);
        let start = Instant::now();
        let err = ctl
            .await_async_handled(
                Some(Duration::from_millis(50)),
                |_cb: ForkCallback<u8>| {},
                |_| {
                    handler_called.store(true, Ordering::SeqCst);
                    true
                },
            )
            .unwrap_err();
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(matches!(
            err,
            ForkError::AwaitTimeout { kind: BlockKind::Await, block: 0, .. }
        ));
        assert!(!handler_called.load(Ordering::SeqCst));
    }

    #[test]
    fn late_callback_after_timeout_is_dropped() {
        let (mut ctl, _owner) = controller();
        let (tx, rx) = mpsc::channel();
        let err = ctl
            .await_async_for(Duration::from_millis(20), move |cb: ForkCallback<u8>| {
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(60));
                    cb.succeed(1);
                    tx.send(cb.is_resolved()).unwrap();
                });
            })
            .unwrap_err();
        assert!(err.is_timeout());
        // The producer kept running to completion.
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn ui_await_runs_on_owner_and_returns() {
        let (mut ctl, owner) = controller();
        let probe = owner.clone();
        let on_owner = ctl.ui_await(move || probe.is_owner_thread()).unwrap();
        assert!(on_owner);
    }

    #[test]
    fn ui_await_panic_is_handled_error() {
        let (mut ctl, _owner) = controller();
        let v = ctl
            .ui_await_handled(None, || -> u8 { panic!("view gone") }, |e| !e.is_timeout())
            .unwrap();
        assert_eq!(v, None);
    }

    #[test]
    fn ui_await_times_out_when_owner_is_busy() {
        let (mut ctl, _owner) = controller();
        ctl.ui(|| thread::sleep(Duration::from_millis(200)));
        let err = ctl
            .ui_await_for(Duration::from_millis(30), || ())
            .unwrap_err();
        assert!(matches!(
            err,
            ForkError::AwaitTimeout { kind: BlockKind::UiAwait, block: 1, .. }
        ));
    }

    #[test]
    fn ui_does_not_block() {
        let (mut ctl, _owner) = controller();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        ctl.ui(move || {
            thread::sleep(Duration::from_millis(200));
            tx.send(()).unwrap();
        });
        assert!(start.elapsed() < Duration::from_millis(150));
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn ui_await_closed_owner_is_error() {
        let (mut ctl, owner) = controller();
        owner.shutdown();
        let err = ctl.ui_await(|| ()).unwrap_err();
        let source = err.delivered_source().unwrap().downcast_ref::<ForkError>().unwrap();
        assert!(matches!(source, ForkError::OwnerClosed));
        // Fire-and-forget posts are dropped quietly.
        ctl.ui(|| ());
        assert_eq!(ctl.blocks_issued(), 2);
    }

    #[test]
    fn dropped_ui_warning_names_block_kind() {
        use std::fmt;
        use std::sync::Mutex;
        use tracing::field::{Field, Visit};
        use tracing::{Event, Level, Subscriber};
        use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

        struct KindField(Option<String>);

        impl Visit for KindField {
            fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
                if field.name() == "kind" {
                    self.0 = Some(format!("{:?}", value));
                }
            }
        }

        struct WarnKinds(Arc<Mutex<Vec<Option<String>>>>);

        impl<S: Subscriber> Layer<S> for WarnKinds {
            fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
                if *event.metadata().level() == Level::WARN {
                    let mut kind = KindField(None);
                    event.record(&mut kind);
                    self.0.lock().unwrap().push(kind.0);
                }
            }
        }

        let kinds = Arc::new(Mutex::new(Vec::new()));
        let subscriber = tracing_subscriber::registry().with(WarnKinds(kinds.clone()));
        let (mut ctl, owner) = controller();
        owner.shutdown();
        tracing::subscriber::with_default(subscriber, || ctl.ui(|| ()));
        assert_eq!(*kinds.lock().unwrap(), vec![Some("ui".to_string())]);
    }

    #[test]
    fn ui_await_preserves_post_order() {
        let (mut ctl, _owner) = controller();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            ctl.ui(move || {
                thread::sleep(Duration::from_millis(5));
                order.lock().unwrap().push(i);
            });
        }
        let snapshot = {
            let order = order.clone();
            ctl.ui_await(move || order.lock().unwrap().clone()).unwrap()
        };
        assert_eq!(snapshot, vec![0, 1, 2]);
    }
}
