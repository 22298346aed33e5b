/*!
The package contents index.

Extracting a file list from a package archive is expensive, so the list is
cached per package id across runs. On top of the raw lists the index builds
cross-package lookup maps: "which package owns path X" for all files, for
icon-relevant files, and for gettext locale data. Those maps power icon
resolution and locale processing without ever re-opening an archive.
*/

use log::debug;
use rusqlite::{Connection, OptionalExtension};
use snafu::ResultExt;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Mutex;

pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

const ICON_PREFIX: &str = "/usr/share/icons/";
const PIXMAP_PREFIX: &str = "/usr/share/pixmaps/";
const LOCALE_PREFIX: &str = "/usr/share/locale/";

pub struct ContentsStore {
    conn: Mutex<Connection>,
}

impl ContentsStore {
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).context(error::CreateDirSnafu { path: dir })?;
        let db_path = dir.join("contents.db");
        let conn = Connection::open(&db_path).context(error::OpenSnafu { path: &db_path })?;
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .context(error::SetupSnafu)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context(error::SetupSnafu)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS contents (pkid TEXT PRIMARY KEY, paths TEXT NOT NULL)",
            [],
        )
        .context(error::SetupSnafu)?;
        debug!("Opened contents index at '{}'", db_path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the file list of a package. Duplicate paths collapse; the
    /// first occurrence keeps its position.
    pub fn add_contents(&self, pkid: &str, paths: &[String]) -> Result<()> {
        let mut seen = HashSet::new();
        let mut deduped = Vec::with_capacity(paths.len());
        for path in paths {
            if seen.insert(path.as_str()) {
                deduped.push(path.as_str());
            }
        }
        let joined = deduped.join("\n");
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO contents (pkid, paths) VALUES (?1, ?2)",
            [pkid, joined.as_str()],
        )
        .context(error::WriteSnafu)?;
        Ok(())
    }

    pub fn has_contents(&self, pkid: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM contents WHERE pkid = ?1", [pkid], |r| {
                r.get(0)
            })
            .context(error::QuerySnafu)?;
        Ok(count > 0)
    }

    pub fn contents_of(&self, pkid: &str) -> Result<Option<Vec<String>>> {
        let conn = self.lock();
        let paths: Option<String> = conn
            .query_row("SELECT paths FROM contents WHERE pkid = ?1", [pkid], |r| {
                r.get(0)
            })
            .optional()
            .context(error::QuerySnafu)?;
        Ok(paths.map(|p| p.lines().map(str::to_string).collect()))
    }

    pub fn remove_contents(&self, pkid: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM contents WHERE pkid = ?1", [pkid])
            .context(error::WriteSnafu)?;
        Ok(())
    }

    /// Drop cached lists for packages outside `keep`.
    pub fn remove_packages_not_in(&self, keep: &HashSet<String>) -> Result<usize> {
        let pkids: Vec<String> = {
            let conn = self.lock();
            let mut stmt = conn
                .prepare("SELECT pkid FROM contents")
                .context(error::QuerySnafu)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .context(error::QuerySnafu)?;
            let mut pkids = Vec::new();
            for row in rows {
                pkids.push(row.context(error::QuerySnafu)?);
            }
            pkids
        };
        let mut removed = 0;
        for pkid in pkids {
            if !keep.contains(&pkid) {
                self.remove_contents(&pkid)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Build a path -> pkid map over the given packages, retaining paths the
    /// filter accepts. Later packages win on shared paths, so callers pass
    /// pkids in sorted order for deterministic results.
    fn build_map<F>(&self, pkids: &[String], filter: F) -> Result<HashMap<String, String>>
    where
        F: Fn(&str) -> bool,
    {
        let mut map = HashMap::new();
        for pkid in pkids {
            if let Some(paths) = self.contents_of(pkid)? {
                for path in paths {
                    if filter(&path) {
                        map.insert(path, pkid.clone());
                    }
                }
            }
        }
        Ok(map)
    }

    /// All files of the given packages.
    pub fn contents_map(&self, pkids: &[String]) -> Result<HashMap<String, String>> {
        self.build_map(pkids, |_| true)
    }

    /// Files relevant for icon resolution: theme trees and pixmaps.
    pub fn icons_map(&self, pkids: &[String]) -> Result<HashMap<String, String>> {
        self.build_map(pkids, |path| {
            path.starts_with(ICON_PREFIX)
                || (path.starts_with(PIXMAP_PREFIX)
                    && !path[PIXMAP_PREFIX.len()..].contains('/'))
        })
    }

    /// Gettext machine-object files, keyed by full path.
    pub fn locale_map(&self, pkids: &[String]) -> Result<HashMap<String, String>> {
        self.build_map(pkids, |path| {
            path.starts_with(LOCALE_PREFIX) && path.ends_with(".mo")
        })
    }
}

pub mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to create contents index directory '{}': {}", path.display(), source))]
        CreateDir {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to open contents index '{}': {}", path.display(), source))]
        Open {
            path: PathBuf,
            source: rusqlite::Error,
        },

        #[snafu(display("Contents index query failed: {}", source))]
        Query { source: rusqlite::Error },

        #[snafu(display("Failed to initialize contents index: {}", source))]
        Setup { source: rusqlite::Error },

        #[snafu(display("Contents index write failed: {}", source))]
        Write { source: rusqlite::Error },
    }
}
