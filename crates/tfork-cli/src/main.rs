//! tfork CLI - fork/await demo and load driver.

mod commands;
mod output;

use std::env;
use std::process;
use std::time::Duration;

use tfork_rt::ForkConfig;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Options shared by every command.
pub struct Options {
    pub config: ForkConfig,
    pub fail: bool,
}

fn main() {
    output::init();
    init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        print_usage();
        return;
    }

    let opts = match parse_options(&args[2..]) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("{}: {}", output::error_label(), msg);
            process::exit(1);
        }
    };

    match args[1].as_str() {
        "demo" => commands::demo::cmd_demo(&opts),
        "stress" => {
            let count = match positional(&args[2..]).map(|s| s.parse::<usize>()) {
                Some(Ok(n)) => n,
                Some(Err(_)) | None => {
                    eprintln!("Usage: tfork stress <count> [options]");
                    process::exit(1);
                }
            };
            commands::stress::cmd_stress(count, &opts);
        }
        "config" => commands::config::cmd_config(&opts),
        "help" | "--help" | "-h" => print_usage(),
        "version" | "--version" | "-V" => {
            println!("tfork {}", env!("CARGO_PKG_VERSION"));
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            process::exit(1);
        }
    }
}

/// Logs go to stderr; `RUST_LOG` overrides the default `info` filter.
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(env_filter)
        .init();
}

fn parse_options(args: &[String]) -> Result<Options, String> {
    let mut config = ForkConfig::default();
    let mut timeout_ms = None;
    let mut fail = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                let path = args.get(i + 1).ok_or("--config needs a file path")?;
                config = ForkConfig::load(path).map_err(|e| format!("{}: {}", path, e))?;
                i += 1;
            }
            "--timeout-ms" => {
                let value = args.get(i + 1).ok_or("--timeout-ms needs a value")?;
                let ms = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid --timeout-ms value: {}", value))?;
                timeout_ms = Some(ms);
                i += 1;
            }
            "--fail" => fail = true,
            flag if flag.starts_with("--") => return Err(format!("unknown option: {}", flag)),
            _ => {}
        }
        i += 1;
    }

    // Explicit flags win over the config file.
    if let Some(ms) = timeout_ms {
        config.default_await_timeout = Duration::from_millis(ms);
    }
    Ok(Options { config, fail })
}

/// First argument that is neither an option nor an option's value.
fn positional(args: &[String]) -> Option<&str> {
    let mut skip = false;
    for arg in args {
        if skip {
            skip = false;
            continue;
        }
        match arg.as_str() {
            "--config" | "--timeout-ms" => skip = true,
            a if a.starts_with("--") => {}
            a => return Some(a),
        }
    }
    None
}

fn print_usage() {
    println!(
        "{} {} - fork/await thread coordination",
        output::title("tfork"),
        output::version(env!("CARGO_PKG_VERSION"))
    );
    println!();
    println!("{}", output::section_header("Usage:"));
    println!("  tfork <command> [options]");
    println!();
    println!("{}", output::section_header("Commands:"));
    println!("  {}             Load a simulated resource and show it on the owner thread", output::command("demo"));
    println!("  {} {}   Dispatch forks concurrently and report the outcome", output::command("stress"), output::arg("<count>"));
    println!("  {}           Print the effective configuration as JSON", output::command("config"));
    println!("  {}             Show this help", output::command("help"));
    println!("  {}          Show version", output::command("version"));
    println!();
    println!("{}", output::section_header("Options:"));
    println!("  {} {}     Load a JSON ForkConfig", output::arg("--config"), output::arg("<file>"));
    println!("  {} {}    Override the default await timeout", output::arg("--timeout-ms"), output::arg("<n>"));
    println!("  {}               Make the demo's resource load fail", output::arg("--fail"));
    println!();
    println!("Logging is controlled by RUST_LOG (default: info).");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn timeout_flag_overrides_default() {
        let opts = parse_options(&args(&["--timeout-ms", "250"])).unwrap();
        assert_eq!(opts.config.default_await_timeout, Duration::from_millis(250));
        assert!(!opts.fail);
    }

    #[test]
    fn unknown_flag_is_rejected() {
        assert!(parse_options(&args(&["--bogus"])).is_err());
    }

    #[test]
    fn positional_skips_option_values() {
        let a = args(&["--timeout-ms", "10", "--fail", "25"]);
        assert_eq!(positional(&a), Some("25"));
        assert_eq!(positional(&args(&["--fail"])), None);
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fork.json");
        std::fs::write(&path, r#"{ "max_forks": 7 }"#).unwrap();
        let opts = parse_options(&args(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(opts.config.max_forks, 7);
    }
}
