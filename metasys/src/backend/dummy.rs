/*!
A backend that reads packages from a plain directory tree:

```text
<archive-root>/<suite>/<section>/<arch>/<name>-<version>/<package file tree>
```

Each package directory holds the files the package would install, so
`usr/share/metainfo/…` inside it surfaces as `/usr/share/metainfo/…`. The
tree needs no extraction step, which makes this backend the workhorse of the
test suite and a convenient way to experiment with the generator without a
real archive.
*/

use super::{ContentsListSnafu, FileMissingSnafu, FileReadSnafu, IndexMissingSnafu};
use super::{Package, PackageIndex, Result};
use log::warn;
use snafu::ResultExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use walkdir::WalkDir;

#[derive(Debug)]
pub struct DummyIndex {
    root: PathBuf,
}

impl DummyIndex {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl PackageIndex for DummyIndex {
    fn packages_for(
        &self,
        suite: &str,
        section: &str,
        arch: &str,
    ) -> Result<Vec<Arc<dyn Package>>> {
        let dir = self.root.join(suite).join(section).join(arch);
        if !dir.is_dir() {
            return IndexMissingSnafu {
                suite,
                section,
                arch,
                root: self.root.display().to_string(),
            }
            .fail();
        }

        let mut packages: Vec<Arc<dyn Package>> = Vec::new();
        let entries = fs::read_dir(&dir).context(ContentsListSnafu {
            pkid: dir.display().to_string(),
        })?;
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let dir_name = entry.file_name().to_string_lossy().to_string();
            // Package directories are "<name>-<version>".
            let Some((name, version)) = dir_name.rsplit_once('-') else {
                warn!(
                    "Skipping directory '{}' without a name-version separator",
                    dir_name
                );
                continue;
            };
            packages.push(Arc::new(DummyPackage {
                name: name.to_string(),
                version: version.to_string(),
                arch: arch.to_string(),
                dir: entry.path(),
            }));
        }
        packages.sort_by(|a, b| a.pkid().cmp(&b.pkid()));
        Ok(packages)
    }

    fn index_mtime(&self, suite: &str, section: &str, arch: &str) -> Result<i64> {
        let dir = self.root.join(suite).join(section).join(arch);
        let metadata = fs::metadata(&dir).map_err(|_| {
            IndexMissingSnafu {
                suite,
                section,
                arch,
                root: self.root.display().to_string(),
            }
            .build()
        })?;
        let mtime = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        Ok(mtime)
    }
}

pub struct DummyPackage {
    name: String,
    version: String,
    arch: String,
    dir: PathBuf,
}

impl DummyPackage {
    fn fs_path(&self, path: &str) -> PathBuf {
        self.dir.join(path.trim_start_matches('/'))
    }
}

impl Package for DummyPackage {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn arch(&self) -> &str {
        &self.arch
    }

    fn contents(&self) -> Result<Vec<String>> {
        let mut paths = Vec::new();
        for entry in WalkDir::new(&self.dir).follow_links(true) {
            let entry = entry
                .map_err(std::io::Error::from)
                .context(ContentsListSnafu { pkid: self.pkid() })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.dir) {
                paths.push(format!("/{}", rel.to_string_lossy()));
            }
        }
        paths.sort();
        Ok(paths)
    }

    fn data(&self, path: &str) -> Result<Vec<u8>> {
        let fs_path = self.fs_path(path);
        if !fs_path.is_file() {
            return FileMissingSnafu {
                pkid: self.pkid(),
                path,
            }
            .fail();
        }
        fs::read(&fs_path).context(FileReadSnafu {
            pkid: self.pkid(),
            path,
        })
    }

    fn close(&self) {
        // Nothing is extracted, so nothing needs cleaning up.
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_archive(root: &Path) {
        let pkg = root.join("stable/main/amd64/foo-1.0");
        fs::create_dir_all(pkg.join("usr/share/metainfo")).unwrap();
        fs::write(pkg.join("usr/share/metainfo/org.example.foo.xml"), "<x/>").unwrap();
        fs::write(pkg.join("usr/bin-placeholder"), "").unwrap();
    }

    #[test]
    fn lists_packages_and_contents() {
        let dir = tempfile::tempdir().unwrap();
        make_archive(dir.path());
        let index = DummyIndex::new(dir.path());
        let packages = index.packages_for("stable", "main", "amd64").unwrap();
        assert_eq!(packages.len(), 1);
        let pkg = &packages[0];
        assert_eq!(pkg.pkid(), "foo/1.0/amd64");
        let contents = pkg.contents().unwrap();
        assert!(contents.contains(&"/usr/share/metainfo/org.example.foo.xml".to_string()));
        assert_eq!(
            pkg.data("/usr/share/metainfo/org.example.foo.xml").unwrap(),
            b"<x/>"
        );
        assert!(pkg.data("/nonexistent").is_err());
    }

    #[test]
    fn missing_index_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let index = DummyIndex::new(dir.path());
        assert!(index.packages_for("stable", "main", "amd64").is_err());
        assert!(index.index_mtime("stable", "main", "amd64").is_err());
    }
}
