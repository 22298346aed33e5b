use super::{error, Result};
use crate::pipeline::Engine;
use clap::Parser;
use snafu::ResultExt;

/// Drop every package of a suite from the store, forcing regeneration on
/// the next run.
#[derive(Debug, Parser)]
pub struct RemoveFound {
    /// The suite whose packages should be dropped.
    pub suite: String,
}

impl RemoveFound {
    pub fn run(&self, engine: &Engine) -> Result<()> {
        engine
            .remove_found(&self.suite)
            .context(error::PipelineSnafu)
    }
}
