use super::{error, Result};
use crate::pipeline::Engine;
use clap::Parser;
use snafu::ResultExt;

/// Drop a single package from the store.
#[derive(Debug, Parser)]
pub struct Forget {
    /// The package id, `name/version/arch`.
    pub pkid: String,
}

impl Forget {
    pub fn run(&self, engine: &Engine) -> Result<()> {
        engine.forget(&self.pkid).context(error::PipelineSnafu)
    }
}
