/*!
Configuration for the metasys catalog generator.

The generator reads a single TOML file (by default `<workspace>/metasys.toml`)
describing the archive to scan, the suites to process, optional feature
switches and the icon size policy. Everything here is immutable after load;
the pipeline receives a shared reference and never mutates it.

Unknown top-level keys are ignored with a warning so that configuration files
can be shared between generator versions.
*/

use log::warn;
use serde::Deserialize;
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use url::Url;

pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

/// Top-level keys we understand; anything else in the file draws a warning.
const KNOWN_KEYS: &[&str] = &[
    "ProjectName",
    "ArchiveRoot",
    "MediaBaseUrl",
    "HtmlBaseUrl",
    "Backend",
    "MetadataType",
    "WorkspaceDir",
    "IconTheme",
    "Suites",
    "Features",
    "IconPolicy",
    "MaxVideoFileSize",
    "Workers",
];

/// The distribution backend that provides package indices and package
/// contents. Only `dummy` is built into this repository; the distribution
/// backends are separate components selected by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Debian,
    Ubuntu,
    ArchLinux,
    RpmMd,
    Flatpak,
    FreeBsd,
    Dummy,
}

impl BackendKind {
    /// The catalog format a backend's distribution conventionally ships.
    pub fn default_metadata_type(&self) -> MetadataType {
        match self {
            BackendKind::Debian | BackendKind::Ubuntu => MetadataType::Yaml,
            _ => MetadataType::Xml,
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendKind::Debian => "debian",
            BackendKind::Ubuntu => "ubuntu",
            BackendKind::ArchLinux => "archlinux",
            BackendKind::RpmMd => "rpmmd",
            BackendKind::Flatpak => "flatpak",
            BackendKind::FreeBsd => "freebsd",
            BackendKind::Dummy => "dummy",
        })
    }
}

/// Catalog serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum MetadataType {
    #[serde(rename = "XML")]
    Xml,
    #[serde(rename = "YAML")]
    Yaml,
}

impl Display for MetadataType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            MetadataType::Xml => "XML",
            MetadataType::Yaml => "YAML",
        })
    }
}

/// One suite of the archive: which sections and architectures to walk, and
/// how its data ranks against other suites consuming the same media pool.
#[derive(Debug, Clone, Deserialize)]
pub struct SuiteConfig {
    #[serde(default, rename = "dataPriority")]
    pub data_priority: i32,

    /// Parent suite whose packages join the icon search union. Derivative
    /// suites usually ship only deltas and resolve most icons from here.
    #[serde(default, rename = "baseSuite")]
    pub base_suite: Option<String>,

    pub sections: Vec<String>,

    pub architectures: Vec<String>,
}

/// Optional processing steps. Each switch controls exactly one handler.
#[derive(Debug, Clone, Deserialize)]
pub struct Features {
    #[serde(default)]
    pub validate: bool,

    #[serde(default = "default_true", rename = "processDesktop")]
    pub process_desktop: bool,

    #[serde(default = "default_true", rename = "processLocale")]
    pub process_locale: bool,

    #[serde(default = "default_true", rename = "processFonts")]
    pub process_fonts: bool,

    #[serde(default = "default_true")]
    pub screenshots: bool,

    #[serde(default = "default_true", rename = "screenshotVideos")]
    pub screenshot_videos: bool,

    #[serde(default = "default_true", rename = "storeScreenshots")]
    pub store_screenshots: bool,

    #[serde(default = "default_true", rename = "allowIconUpscale")]
    pub allow_icon_upscale: bool,

    #[serde(default)]
    pub optipng: bool,

    #[serde(default = "default_true", rename = "metadataTimestamps")]
    pub metadata_timestamps: bool,
}

impl Default for Features {
    fn default() -> Self {
        Self {
            validate: false,
            process_desktop: true,
            process_locale: true,
            process_fonts: true,
            screenshots: true,
            screenshot_videos: true,
            store_screenshots: true,
            allow_icon_upscale: true,
            optipng: false,
            metadata_timestamps: true,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_scale() -> u32 {
    1
}

/// One icon size the generator produces. `store_cached` writes the PNG into
/// the media pool; `store_remote` additionally attaches a URL entry relative
/// to `MediaBaseUrl`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IconPolicyEntry {
    pub size: u32,

    #[serde(default = "default_scale")]
    pub scale: u32,

    #[serde(default = "default_true", rename = "storeCached")]
    pub store_cached: bool,

    #[serde(default, rename = "storeRemote")]
    pub store_remote: bool,
}

impl IconPolicyEntry {
    /// Directory name of this size in the media pool, `64x64` or `128x128@2`.
    pub fn dir_name(&self) -> String {
        if self.scale <= 1 {
            format!("{}x{}", self.size, self.size)
        } else {
            format!("{}x{}@{}", self.size, self.size, self.scale)
        }
    }

    /// Pixel edge length after applying the scale factor.
    pub fn pixels(&self) -> u32 {
        self.size * self.scale
    }
}

fn default_icon_policy() -> Vec<IconPolicyEntry> {
    vec![
        IconPolicyEntry {
            size: 48,
            scale: 1,
            store_cached: true,
            store_remote: false,
        },
        IconPolicyEntry {
            size: 64,
            scale: 1,
            store_cached: true,
            store_remote: false,
        },
        IconPolicyEntry {
            size: 128,
            scale: 1,
            store_cached: true,
            store_remote: false,
        },
    ]
}

fn default_max_video_size() -> u64 {
    100
}

/// The validated generator configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(rename = "ProjectName")]
    pub project_name: String,

    /// Local path or URL of the package archive to scan.
    #[serde(rename = "ArchiveRoot")]
    pub archive_root: String,

    #[serde(rename = "MediaBaseUrl")]
    pub media_base_url: Url,

    #[serde(default, rename = "HtmlBaseUrl")]
    pub html_base_url: Option<Url>,

    #[serde(rename = "Backend")]
    pub backend: BackendKind,

    #[serde(default, rename = "MetadataType")]
    metadata_type: Option<MetadataType>,

    #[serde(default, rename = "WorkspaceDir")]
    workspace_dir: Option<PathBuf>,

    /// Preferred theme searched after hicolor during icon resolution.
    #[serde(default, rename = "IconTheme")]
    pub icon_theme: Option<String>,

    #[serde(default, rename = "Suites")]
    pub suites: BTreeMap<String, SuiteConfig>,

    #[serde(default, rename = "Features")]
    pub features: Features,

    #[serde(default = "default_icon_policy", rename = "IconPolicy")]
    pub icon_policy: Vec<IconPolicyEntry>,

    /// Upper bound for screenshot videos, in MiB.
    #[serde(default = "default_max_video_size", rename = "MaxVideoFileSize")]
    pub max_video_file_size: u64,

    /// Worker thread count; 0 or absent selects the CPU count.
    #[serde(default, rename = "Workers")]
    pub workers: usize,
}

impl Config {
    /// Read and validate a configuration file. `workspace_override` is the
    /// command line's workspace flag and wins over `WorkspaceDir`.
    pub fn from_file<P: AsRef<Path>>(path: P, workspace_override: Option<PathBuf>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).context(error::ReadSnafu { path })?;
        Self::from_toml(&data, workspace_override).map_err(|e| match e {
            Error::Parse { source } => Error::ParseFile {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(data: &str, workspace_override: Option<PathBuf>) -> Result<Self> {
        let table: toml::Table = toml::from_str(data).context(error::ParseSnafu)?;
        for key in table.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                warn!("Ignoring unknown configuration key '{}'", key);
            }
        }
        let mut config: Config = table.try_into().context(error::ParseSnafu)?;
        if let Some(dir) = workspace_override {
            config.workspace_dir = Some(dir);
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        ensure!(self.workspace_dir.is_some(), error::NoWorkspaceSnafu);
        ensure!(
            self.icon_policy
                .iter()
                .any(|p| p.size == 64 && p.scale == 1 && p.store_cached),
            error::IconPolicySnafu
        );
        for (name, suite) in &self.suites {
            ensure!(
                !suite.sections.is_empty() && !suite.architectures.is_empty(),
                error::EmptySuiteSnafu { suite: name }
            );
            if let Some(base) = &suite.base_suite {
                ensure!(
                    self.suites.contains_key(base),
                    error::UnknownBaseSuiteSnafu {
                        suite: name,
                        base: base.clone(),
                    }
                );
            }
        }
        Ok(())
    }

    /// The effective catalog format: the configured one, or the backend default.
    pub fn metadata_type(&self) -> MetadataType {
        self.metadata_type
            .unwrap_or_else(|| self.backend.default_metadata_type())
    }

    pub fn suite(&self, name: &str) -> Result<&SuiteConfig> {
        self.suites
            .get(name)
            .ok_or_else(|| error::UnknownSuiteSnafu { suite: name }.build())
    }

    pub fn workspace_dir(&self) -> &Path {
        // Presence is checked in validate().
        self.workspace_dir.as_deref().unwrap_or(Path::new("."))
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.workspace_dir().join("cache")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.cache_dir().join("main")
    }

    pub fn contents_dir(&self) -> PathBuf {
        self.cache_dir().join("contents")
    }

    pub fn export_dir(&self) -> PathBuf {
        self.workspace_dir().join("export")
    }

    pub fn media_export_dir(&self) -> PathBuf {
        self.export_dir().join("media")
    }

    pub fn data_export_dir(&self) -> PathBuf {
        self.export_dir().join("data")
    }

    pub fn hints_export_dir(&self) -> PathBuf {
        self.export_dir().join("hints")
    }
}

pub mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Suite '{}' lists no sections or no architectures", suite))]
        EmptySuite { suite: String },

        #[snafu(display(
            "Icon policy must contain a cached 64x64 (scale 1) entry for catalog icons"
        ))]
        IconPolicy,

        #[snafu(display("No workspace directory given (WorkspaceDir or --workspace)"))]
        NoWorkspace,

        #[snafu(display("Failed to parse configuration: {}", source))]
        Parse { source: toml::de::Error },

        #[snafu(display("Failed to parse configuration '{}': {}", path.display(), source))]
        ParseFile {
            path: PathBuf,
            source: toml::de::Error,
        },

        #[snafu(display("Failed to read configuration '{}': {}", path.display(), source))]
        Read {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Suite '{}' references unknown base suite '{}'", suite, base))]
        UnknownBaseSuite { suite: String, base: String },

        #[snafu(display("Suite '{}' is not defined in the configuration", suite))]
        UnknownSuite { suite: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const MINIMAL: &str = r#"
        ProjectName = "Tanglu"
        ArchiveRoot = "/srv/archive"
        MediaBaseUrl = "https://metadata.example.org/media"
        Backend = "dummy"
        WorkspaceDir = "/var/lib/metasys"

        [Suites.stable]
        sections = ["main"]
        architectures = ["amd64"]
    "#;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = Config::from_toml(MINIMAL, None).unwrap();
        assert_eq!(config.project_name, "Tanglu");
        assert_eq!(config.backend, BackendKind::Dummy);
        assert_eq!(config.metadata_type(), MetadataType::Xml);
        assert_eq!(config.max_video_file_size, 100);
        assert!(config.features.process_desktop);
        assert!(!config.features.validate);
        // The default policy carries the mandatory cached 64x64 slot.
        assert!(config
            .icon_policy
            .iter()
            .any(|p| p.size == 64 && p.store_cached));
    }

    #[test]
    fn debian_backend_defaults_to_yaml() {
        let toml = MINIMAL.replace("\"dummy\"", "\"debian\"");
        let config = Config::from_toml(&toml, None).unwrap();
        assert_eq!(config.metadata_type(), MetadataType::Yaml);
    }

    #[test]
    fn explicit_metadata_type_wins() {
        let toml = format!("MetadataType = \"YAML\"\n{}", MINIMAL);
        let config = Config::from_toml(&toml, None).unwrap();
        assert_eq!(config.metadata_type(), MetadataType::Yaml);
    }

    #[test]
    fn icon_policy_without_cached_64_is_rejected() {
        let toml = format!(
            "{}\n[[IconPolicy]]\nsize = 128\nstoreCached = true\n",
            MINIMAL
        );
        let err = Config::from_toml(&toml, None).unwrap_err();
        assert!(matches!(err, Error::IconPolicy));
    }

    #[test]
    fn workspace_flag_overrides_config() {
        let config = Config::from_toml(MINIMAL, Some(PathBuf::from("/tmp/ws"))).unwrap();
        assert_eq!(config.workspace_dir(), Path::new("/tmp/ws"));
    }

    #[test]
    fn unknown_base_suite_is_rejected() {
        let toml = format!("{}\n[Suites.devel]\nbaseSuite = \"nope\"\nsections = [\"main\"]\narchitectures = [\"amd64\"]\n", MINIMAL);
        let err = Config::from_toml(&toml, None).unwrap_err();
        assert!(matches!(err, Error::UnknownBaseSuite { .. }));
    }

    #[test]
    fn icon_policy_dir_names() {
        let entry = IconPolicyEntry {
            size: 64,
            scale: 1,
            store_cached: true,
            store_remote: false,
        };
        assert_eq!(entry.dir_name(), "64x64");
        let hidpi = IconPolicyEntry {
            size: 128,
            scale: 2,
            store_cached: true,
            store_remote: false,
        };
        assert_eq!(hidpi.dir_name(), "128x128@2");
        assert_eq!(hidpi.pixels(), 256);
    }
}
