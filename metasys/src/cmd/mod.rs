//! Command line surface of the generator.

mod cleanup;
mod forget;
mod info;
mod process;
mod remove_found;

use clap::Parser;
use env_logger::Builder;
use log::LevelFilter;
use metasys_config::Config;
use snafu::ResultExt;
use std::path::PathBuf;

use self::cleanup::Cleanup;
use self::forget::Forget;
use self::info::Info;
use self::process::Process;
use self::remove_found::RemoveFound;
use crate::pipeline::Engine;

pub type Result<T> = std::result::Result<T, error::Error>;

const DEFAULT_LEVEL_FILTER: LevelFilter = LevelFilter::Info;
const CONFIG_FILE_NAME: &str = "metasys.toml";

/// Generates AppStream catalog metadata from package repositories.
#[derive(Debug, Parser)]
#[clap(about, long_about = None, version)]
pub struct Args {
    /// The workspace directory holding cache and export data.
    #[clap(global = true, short = 'w', long = "workspace")]
    pub workspace: Option<PathBuf>,

    /// Path to the configuration file; defaults to metasys.toml in the
    /// workspace.
    #[clap(global = true, long = "config")]
    pub config: Option<PathBuf>,

    /// Set the logging level. One of [off|error|warn|info|debug|trace].
    /// You can also leave this unset and use the RUST_LOG env variable.
    #[clap(global = true, long = "log-level")]
    pub log_level: Option<LevelFilter>,

    /// Shorthand for --log-level debug.
    #[clap(global = true, long, short = 'v')]
    pub verbose: bool,

    #[clap(subcommand)]
    pub subcommand: Subcommand,
}

#[derive(Debug, Parser)]
pub enum Subcommand {
    /// Process a suite: extract metadata, render media, export catalogs.
    Process(Process),

    /// Alias of `process`.
    Run(Process),

    /// Collect cruft: drop metadata and media no package references.
    Cleanup(Cleanup),

    /// Remove all packages of a suite from the store.
    RemoveFound(RemoveFound),

    /// Remove a single package (`name/version/arch`) from the store.
    Forget(Forget),

    /// Show the stored state, metadata and hints of a package.
    Info(Info),
}

/// use `level` if present, or else use `RUST_LOG` if present, or else use a
/// default.
pub fn init_logger(level: Option<LevelFilter>, verbose: bool) {
    let level = level.or(verbose.then_some(LevelFilter::Debug));
    match (std::env::var(env_logger::DEFAULT_FILTER_ENV).ok(), level) {
        (Some(_), None) => {
            Builder::from_default_env().init();
        }
        _ => {
            Builder::new()
                .filter(
                    Some(env!("CARGO_CRATE_NAME")),
                    level.unwrap_or(DEFAULT_LEVEL_FILTER),
                )
                .init();
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let config_path = match &args.config {
        Some(path) => path.clone(),
        None => args
            .workspace
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(CONFIG_FILE_NAME),
    };
    Config::from_file(&config_path, args.workspace.clone()).context(error::ConfigSnafu)
}

fn engine(args: &Args) -> Result<Engine> {
    let config = load_config(args)?;
    Engine::new(config).context(error::PipelineSnafu)
}

/// Entrypoint for the `metasys` command line program.
pub fn run(args: Args) -> Result<()> {
    match &args.subcommand {
        Subcommand::Process(cmd) | Subcommand::Run(cmd) => cmd.run(&engine(&args)?),
        Subcommand::Cleanup(cmd) => cmd.run(&engine(&args)?),
        Subcommand::RemoveFound(cmd) => cmd.run(&engine(&args)?),
        Subcommand::Forget(cmd) => cmd.run(&engine(&args)?),
        Subcommand::Info(cmd) => cmd.run(&engine(&args)?),
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("{}", source))]
        Config { source: metasys_config::Error },

        #[snafu(display("{}", source))]
        Pipeline {
            source: crate::pipeline::error::Error,
        },

        #[snafu(display("{}", source))]
        Store { source: crate::store::Error },

        #[snafu(display("{}", source))]
        Hints { source: crate::hints::error::Error },

        #[snafu(display("Package '{}' is not recorded in the store", pkid))]
        UnknownPkid { pkid: String },
    }
}
