/*!
The distribution backend interface.

A backend knows how a particular package format arranges its archive: how to
enumerate the packages of a (suite, section, architecture) and how to pull
individual files out of a package. The generator core only ever talks to
these traits.

The distribution backends (Debian, Ubuntu, RPM-MD, Arch, Flatpak, FreeBSD)
are separate components; this repository ships the `dummy` backend, which
reads packages from a plain directory tree and backs the test suite and
local experiments.
*/

pub mod dummy;

use metasys_config::BackendKind;
use snafu::Snafu;
use std::sync::Arc;

pub type Result<T> = std::result::Result<T, Error>;

/// One binary package. Implementations resolve symbolic links themselves;
/// the paths reported by [`Package::contents`] are absolute and normalized.
pub trait Package: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn arch(&self) -> &str;

    fn maintainer(&self) -> &str {
        ""
    }

    /// Path of the package in the archive, if meaningful for the backend.
    fn filename(&self) -> Option<&str> {
        None
    }

    /// The package's file list.
    fn contents(&self) -> Result<Vec<String>>;

    /// Read one file out of the package.
    fn data(&self, path: &str) -> Result<Vec<u8>>;

    /// Release temporary extraction state. Called when processing of the
    /// package finishes, successfully or not; implementations must tolerate
    /// repeated calls.
    fn close(&self);

    /// The package id `name/version/arch` used as the store key.
    fn pkid(&self) -> String {
        format!("{}/{}/{}", self.name(), self.version(), self.arch())
    }
}

/// Access to the package index of an archive.
pub trait PackageIndex: Send + Sync + std::fmt::Debug {
    /// All packages of one (suite, section, architecture).
    fn packages_for(&self, suite: &str, section: &str, arch: &str)
        -> Result<Vec<Arc<dyn Package>>>;

    /// Modification time (unix seconds) of the underlying index data, used
    /// to skip suites that did not change between runs.
    fn index_mtime(&self, suite: &str, section: &str, arch: &str) -> Result<i64>;
}

/// Instantiate the backend selected in the configuration.
pub fn index_for(kind: BackendKind, archive_root: &str) -> Result<Box<dyn PackageIndex>> {
    match kind {
        BackendKind::Dummy => Ok(Box::new(dummy::DummyIndex::new(archive_root))),
        other => UnavailableSnafu {
            backend: other.to_string(),
        }
        .fail(),
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    #[snafu(display(
        "No index found for {}/{}/{} under '{}'",
        suite,
        section,
        arch,
        root
    ))]
    IndexMissing {
        suite: String,
        section: String,
        arch: String,
        root: String,
    },

    #[snafu(display("Failed to read '{}' from package '{}': {}", path, pkid, source))]
    FileRead {
        pkid: String,
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("File '{}' does not exist in package '{}'", path, pkid))]
    FileMissing { pkid: String, path: String },

    #[snafu(display("Failed to list contents of package '{}': {}", pkid, source))]
    ContentsList {
        pkid: String,
        source: std::io::Error,
    },

    #[snafu(display(
        "The '{}' backend is not built into this generator; it is provided by a separate component",
        backend
    ))]
    Unavailable { backend: String },
}
