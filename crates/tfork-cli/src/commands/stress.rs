//! Stress command: dispatch many forks at once and report how the live-fork
//! limits treated them.

use std::process;
use std::thread;
use std::time::{Duration, Instant};

use tfork_rt::{ForkError, ForkRuntime};

use crate::output;
use crate::Options;

const WORK: Duration = Duration::from_millis(20);

#[derive(Debug, Default, PartialEq, Eq)]
pub struct StressReport {
    pub dispatched: usize,
    pub refused: usize,
    pub ok: usize,
    pub failed: usize,
}

pub fn run_stress(rt: &ForkRuntime, count: usize, fail: bool) -> StressReport {
    let mut report = StressReport::default();
    let mut handles = Vec::with_capacity(count);

    for i in 0..count {
        let result = rt.fork(move |ctl| {
            let value = ctl.await_async(move |cb| {
                thread::sleep(WORK);
                if fail && i % 2 == 1 {
                    cb.fail(format!("job {} failed", i));
                } else {
                    cb.succeed(i);
                }
            })?;
            tracing::trace!(value, "stress fork done");
            Ok(())
        });
        match result {
            Ok(handle) => {
                report.dispatched += 1;
                handles.push(handle);
            }
            Err(ForkError::TooManyForks { .. }) => report.refused += 1,
            Err(e) => {
                tracing::error!(error = %e, "dispatch failed");
                report.refused += 1;
            }
        }
    }

    for handle in handles {
        match handle.join() {
            Ok(()) => report.ok += 1,
            Err(_) => report.failed += 1,
        }
    }
    report
}

pub fn cmd_stress(count: usize, opts: &Options) {
    let rt = match ForkRuntime::with_owner_thread(opts.config.clone()) {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            process::exit(1);
        }
    };

    let start = Instant::now();
    let report = run_stress(&rt, count, opts.fail);
    let elapsed = start.elapsed();

    println!(
        "{} dispatched, {}, {}, {} in {:.2?}",
        report.dispatched,
        output::ok_count(report.ok),
        output::failed_count(report.failed),
        output::refused_count(report.refused),
        elapsed
    );
    println!("live forks after join: {}", rt.live_forks());
    rt.shutdown();

    if report.failed > 0 {
        println!("{}", output::banner_fail("stress", report.failed));
        process::exit(1);
    }
    println!("{}", output::banner_ok("stress"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use tfork_rt::ForkConfig;

    #[test]
    fn all_forks_succeed_under_limit() {
        let rt = ForkRuntime::with_owner_thread(ForkConfig::default()).unwrap();
        let report = run_stress(&rt, 8, false);
        assert_eq!(
            report,
            StressReport {
                dispatched: 8,
                refused: 0,
                ok: 8,
                failed: 0
            }
        );
    }

    #[test]
    fn forks_past_max_are_refused() {
        let rt = ForkRuntime::with_owner_thread(ForkConfig {
            warning_forks: 2,
            max_forks: 4,
            ..ForkConfig::default()
        })
        .unwrap();
        let report = run_stress(&rt, 10, false);
        assert_eq!(report.dispatched + report.refused, 10);
        assert!(report.refused > 0);
        assert_eq!(report.failed, 0);
        assert_eq!(report.ok, report.dispatched);
    }

    #[test]
    fn delivered_errors_fail_forks() {
        let rt = ForkRuntime::with_owner_thread(ForkConfig::default()).unwrap();
        let report = run_stress(&rt, 6, true);
        assert_eq!(report.ok, 3);
        assert_eq!(report.failed, 3);
    }
}
