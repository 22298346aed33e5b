/*!
The durable data store of the generator.

Five logical key/value databases live as tables in one SQLite file:
per-package state, per-package hints, per-GCID metadata in both catalog
formats, run statistics and per-(suite, section, arch) repository state. The
store also owns the media directory, whose per-GCID subtrees hold icons,
screenshots and videos.

Every public write happens in its own immediate transaction; a failed write
leaves the store unchanged. Media writes are plain filesystem operations and
are *not* transactional with the database, so garbage collection is written
to be idempotent: re-running it after a partial failure finishes the job.
*/

use crate::result::GeneratorResult;
use chrono::Utc;
use log::{debug, info, warn};
use metasys_config::MetadataType;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use serde_json::Value;
use snafu::ResultExt;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

pub use error::Error;
type Result<T> = std::result::Result<T, error::Error>;

const PACKAGE_IGNORE: &str = "ignore";
const PACKAGE_SEEN: &str = "seen";

/// The recorded state of one package id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PackageState {
    /// Processed, but nothing publishable came out of it.
    Ignored,
    /// Observed and recorded without generated metadata.
    Seen,
    /// Processed; these global component ids were generated from it.
    Generated(Vec<String>),
}

/// Counters returned by [`DataStore::gc_cruft`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GcStats {
    pub metadata_removed: usize,
    pub media_removed: usize,
}

/// Counters returned by [`DataStore::add_result`].
#[derive(Debug, Default, Clone, Copy)]
pub struct MergeStats {
    pub metadata_added: usize,
    pub hints_added: usize,
}

pub struct DataStore {
    conn: Mutex<Connection>,
    media_dir: PathBuf,
}

impl DataStore {
    /// Open (or create) the store below `store_dir` with its media tree at
    /// `media_dir`.
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(store_dir: P, media_dir: Q) -> Result<Self> {
        let store_dir = store_dir.as_ref();
        let media_dir = media_dir.as_ref().to_path_buf();
        fs::create_dir_all(store_dir).context(error::CreateDirSnafu { path: store_dir })?;
        fs::create_dir_all(&media_dir).context(error::CreateDirSnafu { path: &media_dir })?;

        let db_path = store_dir.join("store.db");
        let conn = Connection::open(&db_path).context(error::OpenSnafu { path: &db_path })?;
        conn.busy_timeout(std::time::Duration::from_secs(30))
            .context(error::SetupSnafu)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context(error::SetupSnafu)?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .context(error::SetupSnafu)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS packages (pkid TEXT PRIMARY KEY, value TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS hints (pkid TEXT PRIMARY KEY, doc TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS metadata_xml (gcid TEXT PRIMARY KEY, doc TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS metadata_yaml (gcid TEXT PRIMARY KEY, doc TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS stats (ts INTEGER PRIMARY KEY, doc TEXT NOT NULL);
             CREATE TABLE IF NOT EXISTS repo_info (key TEXT PRIMARY KEY, doc TEXT NOT NULL);",
        )
        .context(error::SetupSnafu)?;
        debug!("Opened data store at '{}'", db_path.display());

        Ok(Self {
            conn: Mutex::new(conn),
            media_dir,
        })
    }

    pub fn media_dir(&self) -> &Path {
        &self.media_dir
    }

    fn metadata_table(kind: MetadataType) -> &'static str {
        match kind {
            MetadataType::Xml => "metadata_xml",
            MetadataType::Yaml => "metadata_yaml",
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means another worker panicked mid-query; the
        // connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- metadata -------------------------------------------------------

    pub fn has_metadata(&self, kind: MetadataType, gcid: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row(
                &format!(
                    "SELECT COUNT(*) FROM {} WHERE gcid = ?1",
                    Self::metadata_table(kind)
                ),
                [gcid],
                |row| row.get(0),
            )
            .context(error::QuerySnafu)?;
        Ok(count > 0)
    }

    pub fn get_metadata(&self, kind: MetadataType, gcid: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row(
            &format!(
                "SELECT doc FROM {} WHERE gcid = ?1",
                Self::metadata_table(kind)
            ),
            [gcid],
            |row| row.get(0),
        )
        .optional()
        .context(error::QuerySnafu)
    }

    pub fn put_metadata(&self, kind: MetadataType, gcid: &str, doc: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (gcid, doc) VALUES (?1, ?2)",
                Self::metadata_table(kind)
            ),
            [gcid, doc],
        )
        .context(error::WriteSnafu)?;
        Ok(())
    }

    // ---- packages -------------------------------------------------------

    pub fn package_exists(&self, pkid: &str) -> Result<bool> {
        let conn = self.lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM packages WHERE pkid = ?1", [pkid], |r| {
                r.get(0)
            })
            .context(error::QuerySnafu)?;
        Ok(count > 0)
    }

    pub fn get_package(&self, pkid: &str) -> Result<Option<PackageState>> {
        let conn = self.lock();
        let value: Option<String> = conn
            .query_row("SELECT value FROM packages WHERE pkid = ?1", [pkid], |r| {
                r.get(0)
            })
            .optional()
            .context(error::QuerySnafu)?;
        Ok(value.map(|v| match v.as_str() {
            PACKAGE_IGNORE => PackageState::Ignored,
            PACKAGE_SEEN => PackageState::Seen,
            _ => PackageState::Generated(v.lines().map(str::to_string).collect()),
        }))
    }

    pub fn put_package_ignore(&self, pkid: &str) -> Result<()> {
        self.put_package_value(pkid, PACKAGE_IGNORE)
    }

    pub fn put_package_seen(&self, pkid: &str) -> Result<()> {
        self.put_package_value(pkid, PACKAGE_SEEN)
    }

    pub fn put_package_gcids(&self, pkid: &str, gcids: &[String]) -> Result<()> {
        self.put_package_value(pkid, &gcids.join("\n"))
    }

    fn put_package_value(&self, pkid: &str, value: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO packages (pkid, value) VALUES (?1, ?2)",
            [pkid, value],
        )
        .context(error::WriteSnafu)?;
        Ok(())
    }

    /// Drop a package's state and hints.
    pub fn remove_package(&self, pkid: &str) -> Result<()> {
        let mut conn = self.lock();
        let txn = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context(error::WriteSnafu)?;
        txn.execute("DELETE FROM packages WHERE pkid = ?1", [pkid])
            .context(error::WriteSnafu)?;
        txn.execute("DELETE FROM hints WHERE pkid = ?1", [pkid])
            .context(error::WriteSnafu)?;
        txn.commit().context(error::WriteSnafu)?;
        Ok(())
    }

    pub fn all_pkids(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT pkid FROM packages ORDER BY pkid")
            .context(error::QuerySnafu)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context(error::QuerySnafu)?;
        let mut pkids = Vec::new();
        for row in rows {
            pkids.push(row.context(error::QuerySnafu)?);
        }
        Ok(pkids)
    }

    /// Remove every recorded package that is not part of `keep`. Returns the
    /// removed package ids.
    pub fn remove_packages_not_in(&self, keep: &HashSet<String>) -> Result<Vec<String>> {
        let victims: Vec<String> = self
            .all_pkids()?
            .into_iter()
            .filter(|pkid| !keep.contains(pkid))
            .collect();
        if victims.is_empty() {
            return Ok(victims);
        }
        let mut conn = self.lock();
        let txn = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context(error::WriteSnafu)?;
        for pkid in &victims {
            txn.execute("DELETE FROM packages WHERE pkid = ?1", [pkid])
                .context(error::WriteSnafu)?;
            txn.execute("DELETE FROM hints WHERE pkid = ?1", [pkid])
                .context(error::WriteSnafu)?;
        }
        txn.commit().context(error::WriteSnafu)?;
        info!("Dropped {} packages no longer in the archive", victims.len());
        Ok(victims)
    }

    // ---- hints ----------------------------------------------------------

    pub fn put_hints(&self, pkid: &str, doc: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO hints (pkid, doc) VALUES (?1, ?2)",
            [pkid, doc],
        )
        .context(error::WriteSnafu)?;
        Ok(())
    }

    pub fn get_hints(&self, pkid: &str) -> Result<Option<String>> {
        let conn = self.lock();
        conn.query_row("SELECT doc FROM hints WHERE pkid = ?1", [pkid], |r| r.get(0))
            .optional()
            .context(error::QuerySnafu)
    }

    pub fn has_hints(&self, pkid: &str) -> Result<bool> {
        Ok(self.get_hints(pkid)?.is_some())
    }

    // ---- statistics -----------------------------------------------------

    /// Record a statistics document under the current unix second. A
    /// collision on the key upgrades the stored value to an array and
    /// appends.
    pub fn add_stats(&self, record: Value) -> Result<()> {
        let ts = Utc::now().timestamp();
        let mut conn = self.lock();
        let txn = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context(error::WriteSnafu)?;
        let existing: Option<String> = txn
            .query_row("SELECT doc FROM stats WHERE ts = ?1", [ts], |r| r.get(0))
            .optional()
            .context(error::QuerySnafu)?;
        let merged = match existing {
            None => record,
            Some(doc) => {
                let old: Value = serde_json::from_str(&doc).context(error::JsonSnafu)?;
                match old {
                    Value::Array(mut entries) => {
                        entries.push(record);
                        Value::Array(entries)
                    }
                    single => Value::Array(vec![single, record]),
                }
            }
        };
        let doc = serde_json::to_string(&merged).context(error::JsonSnafu)?;
        txn.execute(
            "INSERT OR REPLACE INTO stats (ts, doc) VALUES (?1, ?2)",
            rusqlite::params![ts, doc],
        )
        .context(error::WriteSnafu)?;
        txn.commit().context(error::WriteSnafu)?;
        Ok(())
    }

    pub fn get_stats(&self) -> Result<BTreeMap<i64, Value>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT ts, doc FROM stats ORDER BY ts")
            .context(error::QuerySnafu)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .context(error::QuerySnafu)?;
        let mut stats = BTreeMap::new();
        for row in rows {
            let (ts, doc) = row.context(error::QuerySnafu)?;
            stats.insert(ts, serde_json::from_str(&doc).context(error::JsonSnafu)?);
        }
        Ok(stats)
    }

    // ---- repository state ----------------------------------------------

    fn repo_key(suite: &str, section: &str, arch: &str) -> String {
        format!("{}/{}/{}", suite, section, arch)
    }

    pub fn get_repo_info(&self, suite: &str, section: &str, arch: &str) -> Result<Option<Value>> {
        let conn = self.lock();
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM repo_info WHERE key = ?1",
                [Self::repo_key(suite, section, arch)],
                |r| r.get(0),
            )
            .optional()
            .context(error::QuerySnafu)?;
        match doc {
            None => Ok(None),
            Some(doc) => Ok(Some(serde_json::from_str(&doc).context(error::JsonSnafu)?)),
        }
    }

    pub fn set_repo_info(
        &self,
        suite: &str,
        section: &str,
        arch: &str,
        value: &Value,
    ) -> Result<()> {
        let doc = serde_json::to_string(value).context(error::JsonSnafu)?;
        let conn = self.lock();
        conn.execute(
            "INSERT OR REPLACE INTO repo_info (key, doc) VALUES (?1, ?2)",
            [Self::repo_key(suite, section, arch), doc],
        )
        .context(error::WriteSnafu)?;
        Ok(())
    }

    pub fn remove_repo_info(&self, suite: &str, section: &str, arch: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "DELETE FROM repo_info WHERE key = ?1",
            [Self::repo_key(suite, section, arch)],
        )
        .context(error::WriteSnafu)?;
        Ok(())
    }

    // ---- result merging -------------------------------------------------

    /// Persist a finalized extraction result: metadata rows for every new
    /// gcid, the hints document if any, and the package state row.
    pub fn add_result(
        &self,
        kind: MetadataType,
        result: &GeneratorResult,
        regenerate: bool,
    ) -> Result<MergeStats> {
        let mut stats = MergeStats::default();
        for cid in result.cids() {
            let (component, gcid) = match (result.component(&cid), result.gcid_for(&cid)) {
                (Some(component), Some(gcid)) => (component, gcid),
                _ => continue,
            };
            if !regenerate && self.has_metadata(kind, gcid)? {
                continue;
            }
            let doc = match kind {
                MetadataType::Xml => component.to_xml(),
                MetadataType::Yaml => component.to_yaml().context(error::YamlSnafu)?,
            };
            self.put_metadata(kind, gcid, &doc)?;
            stats.metadata_added += 1;
        }

        if result.has_hints() {
            let doc =
                serde_json::to_string(&result.hints_document()).context(error::JsonSnafu)?;
            self.put_hints(result.pkid(), &doc)?;
            stats.hints_added = 1;
        }

        if result.is_ignored() {
            self.put_package_ignore(result.pkid())?;
        } else {
            self.put_package_gcids(result.pkid(), &result.gcids())?;
        }
        Ok(stats)
    }

    // ---- cruft collection -----------------------------------------------

    /// Every gcid referenced by some package row.
    pub fn live_gcids(&self) -> Result<HashSet<String>> {
        let conn = self.lock();
        let mut stmt = conn
            .prepare("SELECT value FROM packages")
            .context(error::QuerySnafu)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .context(error::QuerySnafu)?;
        let mut live = HashSet::new();
        for row in rows {
            let value = row.context(error::QuerySnafu)?;
            if value == PACKAGE_IGNORE || value == PACKAGE_SEEN {
                continue;
            }
            for gcid in value.lines() {
                live.insert(gcid.to_string());
            }
        }
        Ok(live)
    }

    /// Remove metadata rows and media directories no package references.
    pub fn gc_cruft(&self) -> Result<GcStats> {
        let mut stats = GcStats::default();
        let live = self.live_gcids()?;

        {
            let mut conn = self.lock();
            let txn = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context(error::WriteSnafu)?;
            for table in ["metadata_xml", "metadata_yaml"] {
                let dead: Vec<String> = {
                    let mut stmt = txn
                        .prepare(&format!("SELECT gcid FROM {}", table))
                        .context(error::QuerySnafu)?;
                    let rows = stmt
                        .query_map([], |row| row.get::<_, String>(0))
                        .context(error::QuerySnafu)?;
                    let mut dead = Vec::new();
                    for row in rows {
                        let gcid = row.context(error::QuerySnafu)?;
                        if !live.contains(&gcid) {
                            dead.push(gcid);
                        }
                    }
                    dead
                };
                for gcid in dead {
                    txn.execute(&format!("DELETE FROM {} WHERE gcid = ?1", table), [&gcid])
                        .context(error::WriteSnafu)?;
                    stats.metadata_removed += 1;
                }
            }
            txn.commit().context(error::WriteSnafu)?;
        }

        stats.media_removed = self.gc_media(&live)?;
        if stats.metadata_removed > 0 || stats.media_removed > 0 {
            info!(
                "Cruft collection removed {} metadata entries and {} media directories",
                stats.metadata_removed, stats.media_removed
            );
        }
        Ok(stats)
    }

    /// Delete media directories whose gcid is not live, then prune the
    /// partition directories that became empty (up to two levels).
    fn gc_media(&self, live: &HashSet<String>) -> Result<usize> {
        // GCID media paths are four levels deep: tld/vendor/name/DIGEST.
        let victims: Vec<PathBuf> = WalkDir::new(&self.media_dir)
            .min_depth(4)
            .max_depth(4)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_dir())
            .filter(|e| {
                let gcid = e
                    .path()
                    .strip_prefix(&self.media_dir)
                    .ok()
                    .map(|p| p.to_string_lossy().to_string());
                matches!(gcid, Some(gcid) if !live.contains(&gcid))
            })
            .map(|e| e.into_path())
            .collect();

        let mut removed = 0;
        for path in &victims {
            match fs::remove_dir_all(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Could not remove media at '{}': {}", path.display(), e),
            }
            let mut parent = path.parent();
            for _ in 0..2 {
                match parent {
                    Some(dir) if dir != self.media_dir => {
                        // Only empty parents go; a failed removal here means
                        // a sibling still lives there.
                        if fs::remove_dir(dir).is_err() {
                            break;
                        }
                        parent = dir.parent();
                    }
                    _ => break,
                }
            }
        }
        Ok(removed)
    }
}

pub mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to create store directory '{}': {}", path.display(), source))]
        CreateDir {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Serialized hints or stats are not valid JSON: {}", source))]
        Json { source: serde_json::Error },

        #[snafu(display("Failed to open data store '{}': {}", path.display(), source))]
        Open {
            path: PathBuf,
            source: rusqlite::Error,
        },

        #[snafu(display("Data store query failed: {}", source))]
        Query { source: rusqlite::Error },

        #[snafu(display("Failed to initialize data store: {}", source))]
        Setup { source: rusqlite::Error },

        #[snafu(display("Data store write failed: {}", source))]
        Write { source: rusqlite::Error },

        #[snafu(display("Failed to serialize component YAML: {}", source))]
        Yaml { source: serde_yaml::Error },
    }
}
