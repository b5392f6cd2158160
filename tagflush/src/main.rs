//! The tagflush binary.
//!
//! Reads statsd flush snapshots as JSON lines and forwards them to SignalFx or a multi-dimensional
//! Graphite backend. See `tagflush --help` for all commands.

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            tagflush_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
