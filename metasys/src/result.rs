/*!
Per-package extraction results.

A [`GeneratorResult`] collects the components found in one package together
with their content fingerprints and any issue hints. When processing of the
package finishes the result is finalized (components carrying error hints
are dropped) and merged into the data store.

The global component ID is built here: a partitioned, lowercased prefix
derived from the component ID, plus the uppercase hex digest of every byte
stream that contributed to the component.
*/

use crate::component::Component;
use crate::hints::{Hint, Severity};
use lazy_static::lazy_static;
use serde_json::json;
use sha2::{Digest, Sha256};
use snafu::ensure;
use std::collections::{BTreeMap, HashMap, HashSet};

type Result<T> = std::result::Result<T, error::Error>;

/// Component id under which hints are filed that concern the package as a
/// whole rather than one component.
pub const GENERAL_CID: &str = "general";

const TLD_DATA: &str = include_str!("../data/tld-list.txt");

lazy_static! {
    static ref TLDS: HashSet<&'static str> = TLD_DATA
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .collect();
}

/// Whether `label` is a known top-level domain.
pub fn is_top_level_domain(label: &str) -> bool {
    TLDS.contains(label.to_ascii_lowercase().as_str())
}

/// Whether a component id looks like a reverse-DNS identifier
/// (`tld.vendor.app`, at least three labels with a known TLD first).
pub fn is_reverse_dns(cid: &str) -> bool {
    let parts: Vec<&str> = cid.split('.').collect();
    parts.len() >= 3 && is_top_level_domain(parts[0])
}

/// Build a global component id from a component id and a fingerprint digest.
///
/// Reverse-DNS ids partition as `tld/vendor/rest/digest`; everything else as
/// `first-char/first-two-chars/cid/digest`. Partition prefixes are lowercase,
/// the cid itself keeps its case.
pub fn build_global_id(cid: &str, digest: &str) -> String {
    let parts: Vec<&str> = cid.split('.').collect();
    if parts.len() > 2 && is_top_level_domain(parts[0]) {
        let tld = parts[0].to_ascii_lowercase();
        let vendor = parts[1].to_ascii_lowercase();
        let rest = parts[2..].join(".");
        format!("{}/{}/{}/{}", tld, vendor, rest, digest)
    } else {
        let lower = cid.to_ascii_lowercase();
        let first: String = lower.chars().take(1).collect();
        let two: String = lower.chars().take(2).collect();
        format!("{}/{}/{}/{}", first, two, cid, digest)
    }
}

/// Recover the component id from a global component id, or `None` when the
/// input has the wrong shape.
///
/// The reverse-DNS partition loses the original case of the first two
/// labels, so the returned cid is canonical (prefix labels lowercased), not
/// necessarily byte-identical to the original.
pub fn cid_from_global_id(gcid: &str) -> Option<String> {
    let parts: Vec<&str> = gcid.split('/').collect();
    if parts.len() != 4 {
        return None;
    }
    if is_top_level_domain(parts[0]) {
        Some(format!("{}.{}.{}", parts[0], parts[1], parts[2]))
    } else {
        Some(parts[2].to_string())
    }
}

/// The digest of a sequence of byte streams: SHA-256 over their
/// concatenation, uppercase hex.
fn fingerprint_digest(parts: &[Vec<u8>]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode_upper(hasher.finalize())
}

/// All data produced while processing one package.
#[derive(Debug, Default)]
pub struct GeneratorResult {
    pkid: String,
    pkgname: String,
    components: BTreeMap<String, Component>,
    gcids: BTreeMap<String, String>,
    fingerprints: HashMap<String, Vec<Vec<u8>>>,
    hints: BTreeMap<String, Vec<Hint>>,
}

impl GeneratorResult {
    pub fn new(pkid: &str, pkgname: &str) -> Self {
        Self {
            pkid: pkid.to_string(),
            pkgname: pkgname.to_string(),
            ..Default::default()
        }
    }

    pub fn pkid(&self) -> &str {
        &self.pkid
    }

    pub fn pkgname(&self) -> &str {
        &self.pkgname
    }

    /// Register a component together with the bytes that produced it. Fails
    /// on an empty component id or a duplicate registration.
    pub fn add_component(&mut self, mut component: Component, source: Vec<u8>) -> Result<()> {
        ensure!(!component.cid.is_empty(), error::EmptyCidSnafu);
        let cid = component.cid.clone();
        ensure!(
            !self.components.contains_key(&cid),
            error::DuplicateComponentSnafu { cid }
        );
        if component.pkgname.is_empty() {
            component.pkgname = self.pkgname.clone();
        }
        self.fingerprints.insert(cid.clone(), vec![source]);
        self.refresh_gcid(&cid);
        self.components.insert(cid, component);
        Ok(())
    }

    /// Append more source bytes to a component's fingerprint and recompute
    /// its global id.
    pub fn update_component_gcid(&mut self, cid: &str, source: Vec<u8>) -> Result<()> {
        ensure!(
            self.components.contains_key(cid),
            error::UnknownComponentSnafu { cid }
        );
        self.fingerprints.entry(cid.to_string()).or_default().push(source);
        self.refresh_gcid(cid);
        Ok(())
    }

    fn refresh_gcid(&mut self, cid: &str) {
        let digest = fingerprint_digest(
            self.fingerprints
                .get(cid)
                .map(Vec::as_slice)
                .unwrap_or_default(),
        );
        self.gcids
            .insert(cid.to_string(), build_global_id(cid, &digest));
    }

    /// Attach a hint. Duplicate (cid, tag, vars) triples collapse to one.
    pub fn add_hint<T: Into<String>>(
        &mut self,
        cid: &str,
        tag: T,
        vars: BTreeMap<String, String>,
    ) {
        self.push_hint(cid, Hint::new(tag, vars));
    }

    /// Attach an already-built hint, collapsing duplicates.
    pub fn push_hint(&mut self, cid: &str, hint: Hint) {
        let hints = self.hints.entry(cid.to_string()).or_default();
        if !hints.contains(&hint) {
            hints.push(hint);
        }
    }

    pub fn cids(&self) -> Vec<String> {
        self.components.keys().cloned().collect()
    }

    pub fn component(&self, cid: &str) -> Option<&Component> {
        self.components.get(cid)
    }

    pub fn component_mut(&mut self, cid: &str) -> Option<&mut Component> {
        self.components.get_mut(cid)
    }

    pub fn components(&self) -> impl Iterator<Item = &Component> {
        self.components.values()
    }

    pub fn gcid_for(&self, cid: &str) -> Option<&str> {
        self.gcids.get(cid).map(String::as_str)
    }

    /// All global ids of surviving components, in component-id order.
    pub fn gcids(&self) -> Vec<String> {
        self.components
            .keys()
            .filter_map(|cid| self.gcids.get(cid).cloned())
            .collect()
    }

    pub fn hint_count(&self) -> usize {
        self.hints.values().map(Vec::len).sum()
    }

    pub fn hints_for(&self, cid: &str) -> &[Hint] {
        self.hints.get(cid).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn count_by_severity(&self, severity: Severity) -> usize {
        self.hints
            .values()
            .flatten()
            .filter(|h| h.severity() == severity)
            .count()
    }

    pub fn has_hints(&self) -> bool {
        !self.hints.is_empty()
    }

    /// Drop every component that collected an error hint. Returns the ids of
    /// the dropped components.
    pub fn finalize(&mut self) -> Vec<String> {
        let invalid: Vec<String> = self
            .components
            .keys()
            .filter(|cid| self.hints_for(cid).iter().any(Hint::is_error))
            .cloned()
            .collect();
        for cid in &invalid {
            self.components.remove(cid);
            self.gcids.remove(cid);
            self.fingerprints.remove(cid);
        }
        invalid
    }

    /// A package is ignored when finalization left nothing to publish.
    pub fn is_ignored(&self) -> bool {
        self.components.is_empty()
    }

    /// The hints document stored per package:
    /// `{ "package": pkid, "hints": { cid: [ { tag, vars } ] } }`.
    pub fn hints_document(&self) -> serde_json::Value {
        json!({
            "package": self.pkid,
            "hints": self.hints,
        })
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Refusing to add a component without an id"))]
        EmptyCid,

        #[snafu(display("Component '{}' was already added to this result", cid))]
        DuplicateComponent { cid: String },

        #[snafu(display("Component '{}' is not part of this result", cid))]
        UnknownComponent { cid: String },
    }
}
