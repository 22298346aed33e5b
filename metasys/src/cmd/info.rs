use super::{error, Result};
use crate::hints::{registry, Hint};
use crate::pipeline::Engine;
use crate::store::PackageState;
use clap::Parser;
use metasys_config::MetadataType;
use snafu::{OptionExt, ResultExt};

/// Dump the stored state, metadata and rendered hints of one package.
#[derive(Debug, Parser)]
pub struct Info {
    /// The package id, `name/version/arch`.
    pub pkid: String,
}

impl Info {
    pub fn run(&self, engine: &Engine) -> Result<()> {
        let store = engine.store();
        let state = store
            .get_package(&self.pkid)
            .context(error::StoreSnafu)?
            .context(error::UnknownPkidSnafu { pkid: &self.pkid })?;

        println!("Package: {}", self.pkid);
        match &state {
            PackageState::Ignored => println!("State: ignored (no publishable components)"),
            PackageState::Seen => println!("State: seen"),
            PackageState::Generated(gcids) => {
                println!("State: generated ({} components)", gcids.len());
                let kind = engine.config().metadata_type();
                for gcid in gcids {
                    println!("\nGlobal ID: {}", gcid);
                    for try_kind in [kind, other_kind(kind)] {
                        if let Some(doc) = store
                            .get_metadata(try_kind, gcid)
                            .context(error::StoreSnafu)?
                        {
                            println!("--- {} ---", try_kind);
                            println!("{}", doc);
                            break;
                        }
                    }
                }
            }
        }

        if let Some(doc) = store.get_hints(&self.pkid).context(error::StoreSnafu)? {
            let parsed: serde_json::Value = match serde_json::from_str(&doc) {
                Ok(parsed) => parsed,
                Err(_) => {
                    println!("\nHints (unparsed):\n{}", doc);
                    return Ok(());
                }
            };
            println!("\nHints:");
            if let Some(map) = parsed.get("hints").and_then(|h| h.as_object()) {
                for (cid, entries) in map {
                    println!("  {}:", cid);
                    for entry in entries.as_array().into_iter().flatten() {
                        if let Ok(hint) = serde_json::from_value::<Hint>(entry.clone()) {
                            let message = registry().render(&hint).context(error::HintsSnafu)?;
                            println!("    [{}] {}: {}", hint.severity(), hint.tag, message);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn other_kind(kind: MetadataType) -> MetadataType {
    match kind {
        MetadataType::Xml => MetadataType::Yaml,
        MetadataType::Yaml => MetadataType::Xml,
    }
}
