use super::{error, Result};
use crate::pipeline::Engine;
use clap::Parser;
use snafu::ResultExt;

/// Run the full generator over one suite.
#[derive(Debug, Parser)]
pub struct Process {
    /// The suite to process, as named in the configuration.
    pub suite: String,
}

impl Process {
    pub fn run(&self, engine: &Engine) -> Result<()> {
        engine
            .process_suite(&self.suite)
            .map(|_| ())
            .context(error::PipelineSnafu)
    }
}
