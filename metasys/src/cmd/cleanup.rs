use super::{error, Result};
use crate::pipeline::Engine;
use clap::Parser;
use snafu::ResultExt;

/// Remove metadata and media not referenced by any current package.
#[derive(Debug, Parser)]
pub struct Cleanup {}

impl Cleanup {
    pub fn run(&self, engine: &Engine) -> Result<()> {
        engine.cleanup().context(error::PipelineSnafu)
    }
}
