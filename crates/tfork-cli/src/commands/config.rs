//! Config command.

use std::process;

use crate::output;
use crate::Options;

pub fn cmd_config(opts: &Options) {
    match opts.config.to_json_pretty() {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("{}: {}", output::error_label(), e);
            process::exit(1);
        }
    }
}
