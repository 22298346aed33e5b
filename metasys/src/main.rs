/*!
`metasys` generates AppStream catalog metadata for package repositories.

A run walks the configured suites of a package archive, extracts component
metadata out of the packages found there, resolves icons and other media
across the whole package set, and exports compressed catalog files plus an
issue report. Results are cached in a durable store keyed by content, so
repeated runs only work on packages that changed.

Configuration comes from:
* command line parameters selecting the workspace and the suite to process
* `metasys.toml` in the workspace, describing the archive, suites, feature
  switches and the icon policy
*/

#![deny(rust_2018_idioms)]

use clap::Parser;
use metasys::cmd::{self, Args};
use std::process;

// Snafu gives the errors nice Display representations, so we wrap the real
// entrypoint and print any failure instead of returning a Result from main.
fn main() {
    let args = Args::parse();
    cmd::init_logger(args.log_level, args.verbose);
    if let Err(e) = cmd::run(args) {
        eprintln!("{}", e);
        process::exit(1);
    }
}
