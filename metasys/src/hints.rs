/*!
Issue "hints" attached to components and packages during extraction.

A hint is a registered tag plus a set of template variables. The registry
maps every tag to a severity and a human-readable explanation template; it is
embedded in the binary and loaded once before any extraction begins. Tags of
`error` severity invalidate the component they are attached to when a result
is finalized.
*/

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

type Result<T> = std::result::Result<T, error::Error>;

/// The registry definitions shipped with the generator.
const REGISTRY_DATA: &str = include_str!("../data/hints.toml");

/// Tag used when extraction code reports an issue with a tag the registry
/// does not know. The original tag travels along as the `tag` variable.
pub const UNKNOWN_TAG: &str = "internal-unknown-tag";

lazy_static! {
    static ref REGISTRY: HintRegistry =
        HintRegistry::load_embedded().expect("embedded hint registry is well-formed");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Display for Severity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

/// One registered tag definition.
#[derive(Debug, Clone, Deserialize)]
pub struct HintDef {
    pub severity: Severity,
    pub explanation: String,
}

/// The tag registry. Use [`registry()`] for the process-wide instance.
#[derive(Debug)]
pub struct HintRegistry {
    defs: HashMap<String, HintDef>,
}

impl HintRegistry {
    fn load_embedded() -> Result<Self> {
        Self::from_toml(REGISTRY_DATA)
    }

    pub fn from_toml(data: &str) -> Result<Self> {
        let defs: HashMap<String, HintDef> = toml::from_str(data).context(error::ParseSnafu)?;
        Ok(Self { defs })
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.defs.contains_key(tag)
    }

    pub fn definition(&self, tag: &str) -> Option<&HintDef> {
        self.defs.get(tag)
    }

    pub fn severity(&self, tag: &str) -> Option<Severity> {
        self.defs.get(tag).map(|d| d.severity)
    }

    /// Render the explanation template of `hint` with its variables.
    pub fn render(&self, hint: &Hint) -> Result<String> {
        let def = self
            .definition(&hint.tag)
            .ok_or_else(|| error::UnknownTagSnafu { tag: &hint.tag }.build())?;
        let mut tt = tinytemplate::TinyTemplate::new();
        tt.set_default_formatter(&tinytemplate::format_unescaped);
        tt.add_template(&hint.tag, &def.explanation)
            .context(error::TemplateSnafu { tag: &hint.tag })?;
        tt.render(&hint.tag, &hint.vars)
            .context(error::TemplateSnafu { tag: &hint.tag })
    }
}

/// The process-wide registry, loaded from the embedded definitions.
pub fn registry() -> &'static HintRegistry {
    &REGISTRY
}

/// An issue attached to a component (or to the package itself, under the
/// reserved component id "general").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hint {
    pub tag: String,

    #[serde(default)]
    pub vars: BTreeMap<String, String>,
}

impl Hint {
    /// Build a hint, replacing unregistered tags with [`UNKNOWN_TAG`].
    pub fn new<T: Into<String>>(tag: T, vars: BTreeMap<String, String>) -> Self {
        let tag = tag.into();
        if registry().contains(&tag) {
            Self { tag, vars }
        } else {
            let mut vars = BTreeMap::new();
            vars.insert("tag".to_string(), tag);
            Self {
                tag: UNKNOWN_TAG.to_string(),
                vars,
            }
        }
    }

    pub fn severity(&self) -> Severity {
        // Tags are checked against the registry on construction.
        registry().severity(&self.tag).unwrap_or(Severity::Error)
    }

    pub fn is_error(&self) -> bool {
        self.severity() == Severity::Error
    }
}

/// Shorthand for building the variable map of a hint.
#[macro_export]
macro_rules! hint_vars {
    ($($key:expr => $value:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut vars = std::collections::BTreeMap::new();
        $(vars.insert($key.to_string(), $value.to_string());)*
        vars
    }};
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to parse hint registry: {}", source))]
        Parse { source: toml::de::Error },

        #[snafu(display("Failed to render template for tag '{}': {}", tag, source))]
        Template {
            tag: String,
            source: tinytemplate::error::Error,
        },

        #[snafu(display("Hint tag '{}' is not registered", tag))]
        UnknownTag { tag: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn embedded_registry_loads() {
        let reg = registry();
        assert!(reg.contains("metainfo-no-id"));
        assert!(reg.contains(UNKNOWN_TAG));
        assert_eq!(reg.severity("metainfo-no-id"), Some(Severity::Error));
        assert_eq!(reg.severity("icon-scaled-up"), Some(Severity::Info));
    }

    #[test]
    fn unknown_tags_are_rewritten() {
        let hint = Hint::new("totally-made-up", BTreeMap::new());
        assert_eq!(hint.tag, UNKNOWN_TAG);
        assert_eq!(hint.vars.get("tag").unwrap(), "totally-made-up");
        assert_eq!(hint.severity(), Severity::Warning);
    }

    #[test]
    fn rendering_substitutes_variables() {
        let hint = Hint::new(
            "metainfo-no-id",
            hint_vars! { "fname" => "/usr/share/metainfo/foo.xml" },
        );
        let msg = registry().render(&hint).unwrap();
        assert!(msg.contains("/usr/share/metainfo/foo.xml"));
    }

    #[test]
    fn hints_round_trip_through_json() {
        let hint = Hint::new(
            "icon-not-found",
            hint_vars! { "icon_name" => "foo<bar>" },
        );
        let json = serde_json::to_string(&hint).unwrap();
        let back: Hint = serde_json::from_str(&json).unwrap();
        assert_eq!(hint, back);
    }

    #[test]
    fn error_severity_marks_hint_as_error() {
        let hint = Hint::new("pkg-processing-exception", hint_vars! { "error" => "boom" });
        assert!(hint.is_error());
        let info = Hint::new("icon-scaled-up", BTreeMap::new());
        assert!(!info.is_error());
    }
}
