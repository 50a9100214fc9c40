//! Demo command: load a resource off the owner thread and show it on it.
//!
//! The process main thread plays the owner ("UI") thread by pumping an
//! `OwnerQueue` until the fork has finished.

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tfork_rt::{ForkCallback, ForkRuntime, OwnerQueue, SharedConfig};

use crate::output;
use crate::Options;

const LOAD_DELAY: Duration = Duration::from_millis(200);
const PUMP_INTERVAL: Duration = Duration::from_millis(10);

/// Simulated slow resource, delivered from its own thread.
fn load_resource(cb: ForkCallback<String>, fail: bool) {
    thread::spawn(move || {
        thread::sleep(LOAD_DELAY);
        if fail {
            cb.fail("resource not found");
        } else {
            cb.succeed("hello from the resource loader".to_string());
        }
    });
}

pub fn cmd_demo(opts: &Options) {
    let queue = Arc::new(OwnerQueue::new());
    let rt = ForkRuntime::new(SharedConfig::new(opts.config.clone()), queue.clone());
    let fail = opts.fail;

    let handle = rt.fork_with(
        move |ctl| {
            let id = ctl.fork_id();
            ctl.ui(move || println!("{} {} loading resource...", output::owner_tag(), output::fork_tag(id)));

            let loaded = ctl.await_async_handled(
                None,
                move |cb| load_resource(cb, fail),
                |err| {
                    tracing::warn!(error = %err, "resource load failed, using placeholder");
                    true
                },
            )?;

            let text = loaded.unwrap_or_else(|| "<placeholder>".to_string());
            let len = ctl.ui_await(move || {
                println!("{} {} {}", output::owner_tag(), output::fork_tag(id), text);
                text.len()
            })?;
            ctl.ui(move || println!("{} {} shown {} bytes", output::owner_tag(), output::fork_tag(id), len));
            Ok(())
        },
        |err, is_timeout| {
            if is_timeout {
                eprintln!("{} fork timed out: {}", output::status_fail(), err);
            } else {
                eprintln!("{} fork failed: {}", output::status_fail(), err);
            }
            // Treat timeouts as handled; anything else fails the demo.
            is_timeout
        },
    );

    let handle = match handle {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            process::exit(1);
        }
    };

    while !handle.is_finished() {
        queue.run_next_timeout(PUMP_INTERVAL);
    }
    // Flush `ui` posts made just before the fork returned.
    queue.run_pending();

    match handle.join() {
        Ok(()) => println!("{}", output::banner_ok("demo")),
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            println!("{}", output::banner_fail("demo", 1));
            process::exit(1);
        }
    }
    rt.shutdown();
}
