/*!
Run summaries and the exported issue report.

The generator keeps per-package hint documents in the store; for publishing,
those are collected per (suite, section, architecture) into one gzip'd JSON
array with rendered messages and severities, which the external HTML report
renderer consumes. The stage summary printed at the end of each stage is
computed here as well.
*/

use crate::common::write_gzip;
use crate::hints::{registry, Hint, Severity};
use crate::result::GeneratorResult;
use crate::store::DataStore;
use log::warn;
use serde_json::{json, Value};
use snafu::ResultExt;
use std::fmt::{Display, Formatter};
use std::path::Path;

type Result<T> = std::result::Result<T, error::Error>;

/// Counters for one processed (suite, section, arch) stage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StageSummary {
    pub packages_processed: usize,
    pub packages_ignored: usize,
    pub packages_failed: usize,
    pub components: usize,
    pub infos: usize,
    pub warnings: usize,
    pub errors: usize,
}

impl StageSummary {
    pub fn record(&mut self, result: &GeneratorResult, failed: bool) {
        self.packages_processed += 1;
        if failed {
            self.packages_failed += 1;
        } else if result.is_ignored() {
            self.packages_ignored += 1;
        }
        self.components += result.cids().len();
        self.infos += result.count_by_severity(Severity::Info);
        self.warnings += result.count_by_severity(Severity::Warning);
        self.errors += result.count_by_severity(Severity::Error);
    }

    pub fn merge(&mut self, other: &StageSummary) {
        self.packages_processed += other.packages_processed;
        self.packages_ignored += other.packages_ignored;
        self.packages_failed += other.packages_failed;
        self.components += other.components;
        self.infos += other.infos;
        self.warnings += other.warnings;
        self.errors += other.errors;
    }

    pub fn stats_json(&self, suite: &str, section: &str, arch: &str) -> Value {
        json!({
            "suite": suite,
            "section": section,
            "arch": arch,
            "totalInfos": self.infos,
            "totalWarnings": self.warnings,
            "totalErrors": self.errors,
            "totalMetadata": self.components,
        })
    }
}

impl Display for StageSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} packages processed ({} ignored, {} failed), {} components, {} errors, {} warnings, {} infos",
            self.packages_processed,
            self.packages_ignored,
            self.packages_failed,
            self.components,
            self.errors,
            self.warnings,
            self.infos
        )
    }
}

/// Render one stored hints document into report form: each hint gains its
/// severity and rendered message.
fn render_hints_document(doc: &Value) -> Value {
    let mut out = doc.clone();
    let Some(hints) = out.get_mut("hints").and_then(Value::as_object_mut) else {
        return out;
    };
    for hint_list in hints.values_mut() {
        let Some(entries) = hint_list.as_array_mut() else {
            continue;
        };
        for entry in entries {
            let parsed: Option<Hint> = serde_json::from_value(entry.clone()).ok();
            let Some(hint) = parsed else {
                continue;
            };
            let severity = hint.severity().to_string();
            let message = registry()
                .render(&hint)
                .unwrap_or_else(|e| format!("<render failure: {}>", e));
            if let Some(object) = entry.as_object_mut() {
                object.insert("severity".to_string(), Value::String(severity));
                object.insert("message".to_string(), Value::String(message));
            }
        }
    }
    out
}

/// Write the `Hints-<arch>.json.gz` document for one section: a JSON array
/// of per-package hint documents, pkids sorted, with rendered messages.
pub fn export_hints(
    store: &DataStore,
    export_dir: &Path,
    suite: &str,
    section: &str,
    arch: &str,
    pkids: &[String],
) -> Result<()> {
    let mut documents = Vec::new();
    let mut sorted: Vec<&String> = pkids.iter().collect();
    sorted.sort();
    for pkid in sorted {
        let Some(doc) = store.get_hints(pkid).context(error::StoreSnafu)? else {
            continue;
        };
        match serde_json::from_str::<Value>(&doc) {
            Ok(value) => documents.push(render_hints_document(&value)),
            Err(e) => warn!("Stored hints for '{}' are not valid JSON: {}", pkid, e),
        }
    }

    let path = export_dir
        .join(suite)
        .join(section)
        .join(format!("Hints-{}.json.gz", arch));
    let data = serde_json::to_vec_pretty(&Value::Array(documents)).context(error::JsonSnafu)?;
    write_gzip(&path, &data).context(error::WriteSnafu)?;
    Ok(())
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to serialize the hints report: {}", source))]
        Json { source: serde_json::Error },

        #[snafu(display("Failed to read hints from the store: {}", source))]
        Store { source: crate::store::Error },

        #[snafu(display("Failed to write the hints report: {}", source))]
        Write { source: crate::common::error::Error },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component::{Component, ComponentKind};
    use crate::hint_vars;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn sample_result() -> GeneratorResult {
        let mut res = GeneratorResult::new("foo/1.0/amd64", "foo");
        let cpt = Component::new(ComponentKind::DesktopApp, "org.example.app");
        res.add_component(cpt, b"<x/>".to_vec()).unwrap();
        res.add_hint(
            "org.example.app",
            "icon-not-found",
            hint_vars! { "icon_name" => "foo" },
        );
        res.add_hint(
            "org.example.app",
            "icon-scaled-up",
            hint_vars! { "icon_name" => "foo", "icon_fname" => "f.png" },
        );
        res
    }

    #[test]
    fn summary_counts_severities() {
        let mut summary = StageSummary::default();
        summary.record(&sample_result(), false);
        assert_eq!(summary.packages_processed, 1);
        assert_eq!(summary.components, 1);
        assert_eq!(summary.warnings, 1);
        assert_eq!(summary.infos, 1);
        assert_eq!(summary.errors, 0);

        let mut total = StageSummary::default();
        total.merge(&summary);
        total.merge(&summary);
        assert_eq!(total.packages_processed, 2);
    }

    #[test]
    fn summary_display_is_informative() {
        let mut summary = StageSummary::default();
        summary.record(&sample_result(), false);
        let text = summary.to_string();
        assert!(text.contains("1 packages processed"));
        assert!(text.contains("1 warnings"));
    }

    #[test]
    fn exported_hints_carry_rendered_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = DataStore::open(dir.path().join("db"), dir.path().join("media")).unwrap();
        let res = sample_result();
        store
            .put_hints(
                res.pkid(),
                &serde_json::to_string(&res.hints_document()).unwrap(),
            )
            .unwrap();

        export_hints(
            &store,
            &dir.path().join("hints"),
            "stable",
            "main",
            "amd64",
            &["foo/1.0/amd64".to_string()],
        )
        .unwrap();

        let path = dir.path().join("hints/stable/main/Hints-amd64.json.gz");
        let mut decoder = GzDecoder::new(std::fs::File::open(path).unwrap());
        let mut text = String::new();
        decoder.read_to_string(&mut text).unwrap();
        let parsed: Value = serde_json::from_str(&text).unwrap();
        let hints = &parsed[0]["hints"]["org.example.app"];
        assert_eq!(hints[0]["tag"], "icon-not-found");
        assert_eq!(hints[0]["severity"], "warning");
        assert!(hints[0]["message"]
            .as_str()
            .unwrap()
            .contains("'foo' was not found"));
    }

    #[test]
    fn stats_json_shape() {
        let mut summary = StageSummary::default();
        summary.record(&sample_result(), false);
        let stats = summary.stats_json("stable", "main", "amd64");
        assert_eq!(stats["suite"], "stable");
        assert_eq!(stats["totalMetadata"], 1);
        assert_eq!(stats["totalWarnings"], 1);
    }
}
