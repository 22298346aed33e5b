/*!
The generator pipeline.

For every (suite, section, architecture) of the configured archive the
engine loads the package index, seeds the contents cache, skips packages the
store already knows, fans the remainder out over a worker pool, merges the
results back into the store and finally exports catalog data and the hints
report. A failure inside one package becomes a hint; a failure of a whole
stage (a missing index, a dying store) aborts that stage but lets the
remaining stages run.

Catalog emission is deterministic: package ids are processed in sorted
order, component ids within a package are sorted, and gzip output carries no
timestamps, so an unchanged archive reproduces byte-identical files.
*/

use crate::backend::{self, Package, PackageIndex};
use crate::contents::ContentsStore;
use crate::extractor::Extractor;
use crate::handlers::fonts::{FontHandler, FontRenderer};
use crate::handlers::locale::LocaleHandler;
use crate::handlers::screenshots::ScreenshotHandler;
use crate::hint_vars;
use crate::icons::{load_themes, theme_names, IconHandler};
use crate::render::{DefaultRasterizer, Rasterizer};
use crate::report::{self, StageSummary};
use crate::result::{GeneratorResult, GENERAL_CID};
use crate::store::DataStore;
use crate::common::write_gzip;
use chrono::Utc;
use log::{error, info, warn};
use metasys_config::{Config, MetadataType};
use rayon::prelude::*;
use serde_json::json;
use snafu::ResultExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

type Result<T> = std::result::Result<T, error::Error>;

/// Cooperative cancellation shared by all workers of a stage. Tripped when
/// the store fails; workers drain quickly without corrupting state.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
}

impl CancelToken {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

pub struct Engine {
    config: Config,
    store: Arc<DataStore>,
    contents: Arc<ContentsStore>,
    index: Box<dyn PackageIndex>,
    rasterizer: Box<dyn Rasterizer>,
    font_renderer: Option<Box<dyn FontRenderer>>,
}

impl Engine {
    /// Open the workspace with the production collaborators.
    pub fn new(config: Config) -> Result<Self> {
        let index = backend::index_for(config.backend, &config.archive_root)
            .context(error::BackendSnafu)?;
        Self::with_collaborators(config, index, Box::new(DefaultRasterizer::new()), None)
    }

    /// Open the workspace with explicit collaborators; used by embedders and
    /// the test suite.
    pub fn with_collaborators(
        config: Config,
        index: Box<dyn PackageIndex>,
        rasterizer: Box<dyn Rasterizer>,
        font_renderer: Option<Box<dyn FontRenderer>>,
    ) -> Result<Self> {
        let store = DataStore::open(config.store_dir(), config.media_export_dir())
            .context(error::StoreSnafu)?;
        let contents =
            ContentsStore::open(config.contents_dir()).context(error::ContentsSnafu)?;
        if config.features.process_fonts && font_renderer.is_none() {
            warn!("Font processing is enabled, but no font renderer is available; font components will not be rendered");
        }
        Ok(Self {
            config,
            store: Arc::new(store),
            contents: Arc::new(contents),
            index,
            rasterizer,
            font_renderer,
        })
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn worker_count(&self) -> usize {
        if self.config.workers > 0 {
            self.config.workers
        } else {
            num_cpus::get()
        }
    }

    /// Run the full generator over one suite.
    pub fn process_suite(&self, suite_name: &str) -> Result<StageSummary> {
        let suite = self.config.suite(suite_name).context(error::ConfigSnafu)?;
        let mut total = StageSummary::default();
        let mut failed_stages = 0usize;

        for section in &suite.sections {
            for arch in &suite.architectures {
                info!("Processing {}/{}/{}", suite_name, section, arch);
                match self.process_section(suite_name, section, arch) {
                    Ok(Some(summary)) => {
                        info!("Finished {}/{}/{}: {}", suite_name, section, arch, summary);
                        total.merge(&summary);
                    }
                    Ok(None) => {
                        info!(
                            "Skipped {}/{}/{}: repository is unchanged",
                            suite_name, section, arch
                        );
                    }
                    Err(e) => {
                        error!("Stage {}/{}/{} failed: {}", suite_name, section, arch, e);
                        failed_stages += 1;
                    }
                }
            }
        }

        self.prune_stale_packages();
        let gc = self.store.gc_cruft().context(error::StoreSnafu)?;
        if gc.metadata_removed > 0 || gc.media_removed > 0 {
            info!(
                "Cruft collection: {} metadata entries, {} media directories",
                gc.metadata_removed, gc.media_removed
            );
        }

        for section in &suite.sections {
            for arch in &suite.architectures {
                if let Err(e) = self.export_section(suite_name, section, arch) {
                    error!(
                        "Export of {}/{}/{} failed: {}",
                        suite_name, section, arch, e
                    );
                    failed_stages += 1;
                }
            }
        }

        info!("Suite {}: {}", suite_name, total);
        snafu::ensure!(
            failed_stages == 0,
            error::StagesFailedSnafu {
                count: failed_stages,
            }
        );
        Ok(total)
    }

    /// Process one (suite, section, arch). `Ok(None)` means the stage was
    /// skipped because nothing changed.
    fn process_section(
        &self,
        suite_name: &str,
        section: &str,
        arch: &str,
    ) -> Result<Option<StageSummary>> {
        let suite = self.config.suite(suite_name).context(error::ConfigSnafu)?;
        let mtime = self
            .index
            .index_mtime(suite_name, section, arch)
            .context(error::IndexSnafu)?;
        let packages = self
            .index
            .packages_for(suite_name, section, arch)
            .context(error::IndexSnafu)?;

        let mut pkg_map: BTreeMap<String, Arc<dyn Package>> = BTreeMap::new();
        for pkg in packages {
            pkg_map.insert(pkg.pkid(), pkg);
        }

        // Packages the store has never seen successfully.
        let mut todo: Vec<String> = Vec::new();
        for pkid in pkg_map.keys() {
            if !self.store.package_exists(pkid).context(error::StoreSnafu)? {
                todo.push(pkid.clone());
            }
        }

        let known_mtime = self
            .store
            .get_repo_info(suite_name, section, arch)
            .context(error::StoreSnafu)?
            .and_then(|info| info.get("mtime").and_then(|v| v.as_i64()));
        if known_mtime == Some(mtime) && todo.is_empty() {
            return Ok(None);
        }

        // The icon and locale searches span this section plus the base
        // suite's packages, so derivative suites resolve what their base
        // ships.
        let mut union_map: HashMap<String, Arc<dyn Package>> = HashMap::new();
        if let Some(base) = &suite.base_suite {
            match self.index.packages_for(base, section, arch) {
                Ok(base_packages) => {
                    for pkg in base_packages {
                        union_map.insert(pkg.pkid(), pkg);
                    }
                }
                Err(e) => warn!(
                    "Could not load base suite '{}' for {}/{}: {}",
                    base, section, arch, e
                ),
            }
        }
        for (pkid, pkg) in &pkg_map {
            union_map.insert(pkid.clone(), Arc::clone(pkg));
        }

        self.seed_contents(&union_map)?;
        let mut union_pkids: Vec<String> = union_map.keys().cloned().collect();
        union_pkids.sort();
        let icon_files = self
            .contents
            .icons_map(&union_pkids)
            .context(error::ContentsSnafu)?;
        let locale_map = self
            .contents
            .locale_map(&union_pkids)
            .context(error::ContentsSnafu)?;

        let themes = load_themes(
            &theme_names(self.config.icon_theme.as_deref()),
            &icon_files,
            &union_map,
        );
        let icon_handler = IconHandler::new(
            themes,
            icon_files,
            &union_map,
            self.rasterizer.as_ref(),
            &self.config.icon_policy,
            self.config.media_export_dir(),
            self.config.media_base_url.clone(),
            self.config.features.allow_icon_upscale,
            self.config.features.optipng,
        );
        let screenshot_handler = if self.config.features.screenshots {
            Some(
                ScreenshotHandler::new(
                    self.rasterizer.as_ref(),
                    self.config.media_export_dir(),
                    self.config.media_base_url.clone(),
                    self.config.features.store_screenshots,
                    self.config.features.screenshot_videos,
                    self.config.max_video_file_size,
                )
                .context(error::ScreenshotsSnafu)?,
            )
        } else {
            None
        };
        let font_handler = match (&self.font_renderer, self.config.features.process_fonts) {
            (Some(renderer), true) => Some(FontHandler::new(
                renderer.as_ref(),
                &self.config.icon_policy,
                self.config.media_export_dir(),
                self.config.media_base_url.clone(),
            )),
            _ => None,
        };
        let locale_handler = self
            .config
            .features
            .process_locale
            .then(|| LocaleHandler::new(&locale_map, &union_map));

        let extractor = Extractor::new(
            &self.config.features,
            &icon_handler,
            locale_handler,
            screenshot_handler.as_ref(),
            font_handler.as_ref(),
        );

        let cancel = CancelToken::default();
        let summary = Mutex::new(StageSummary::default());
        let kind = self.config.metadata_type();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.worker_count())
            .build()
            .context(error::ThreadPoolSnafu)?;

        pool.install(|| {
            todo.par_iter().for_each(|pkid| {
                if cancel.is_cancelled() {
                    return;
                }
                let Some(pkg) = pkg_map.get(pkid) else {
                    return;
                };
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    extractor.process(pkg.as_ref())
                }));
                let (result, failed) = match outcome {
                    Ok(extraction) => (extraction.result, extraction.failed),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        let mut res = GeneratorResult::new(pkid, pkg.name());
                        res.add_hint(
                            GENERAL_CID,
                            "pkg-processing-exception",
                            hint_vars! { "error" => message },
                        );
                        pkg.close();
                        (res, true)
                    }
                };

                let merge = if failed {
                    // Keep the hints visible, but leave the package
                    // unrecorded so the next run retries it.
                    result_hints_only(&self.store, &result)
                } else {
                    self.store
                        .add_result(kind, &result, false)
                        .map(|_| ())
                        .map_err(|e| e.to_string())
                };
                if let Err(e) = merge {
                    error!("Store write for '{}' failed: {}", pkid, e);
                    cancel.cancel();
                    return;
                }
                summary
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .record(&result, failed);
            });
        });

        snafu::ensure!(!cancel.is_cancelled(), error::StoreWriteSnafu);

        let summary = summary.into_inner().unwrap_or_else(|e| e.into_inner());
        self.store
            .add_stats(summary.stats_json(suite_name, section, arch))
            .context(error::StoreSnafu)?;
        self.store
            .set_repo_info(
                suite_name,
                section,
                arch,
                &json!({ "mtime": mtime, "packages": pkg_map.len() }),
            )
            .context(error::StoreSnafu)?;
        Ok(Some(summary))
    }

    fn seed_contents(&self, packages: &HashMap<String, Arc<dyn Package>>) -> Result<()> {
        for (pkid, pkg) in packages {
            if self
                .contents
                .has_contents(pkid)
                .context(error::ContentsSnafu)?
            {
                continue;
            }
            match pkg.contents() {
                Ok(paths) => {
                    self.contents
                        .add_contents(pkid, &paths)
                        .context(error::ContentsSnafu)?;
                }
                Err(e) => warn!("Could not list contents of '{}': {}", pkid, e),
            }
        }
        Ok(())
    }

    /// Drop store state for packages that left the archive. The keep-set
    /// spans every configured suite; if any index cannot be read the prune
    /// is skipped rather than risking good state.
    fn prune_stale_packages(&self) {
        let mut keep: HashSet<String> = HashSet::new();
        for (suite_name, suite) in &self.config.suites {
            for section in &suite.sections {
                for arch in &suite.architectures {
                    match self.index.packages_for(suite_name, section, arch) {
                        Ok(packages) => {
                            keep.extend(packages.iter().map(|p| p.pkid()));
                        }
                        Err(e) => {
                            warn!(
                                "Skipping package pruning: index {}/{}/{} unavailable: {}",
                                suite_name, section, arch, e
                            );
                            return;
                        }
                    }
                }
            }
        }
        if let Err(e) = self.store.remove_packages_not_in(&keep) {
            warn!("Could not prune stale packages: {}", e);
        }
        if let Err(e) = self.contents.remove_packages_not_in(&keep) {
            warn!("Could not prune stale contents entries: {}", e);
        }
    }

    /// Emit the catalog and the hints report for one section.
    fn export_section(&self, suite_name: &str, section: &str, arch: &str) -> Result<()> {
        let suite = self.config.suite(suite_name).context(error::ConfigSnafu)?;
        let packages = self
            .index
            .packages_for(suite_name, section, arch)
            .context(error::IndexSnafu)?;
        let mut pkids: Vec<String> = packages.iter().map(|p| p.pkid()).collect();
        pkids.sort();

        let kind = self.config.metadata_type();
        let mut seen: HashSet<String> = HashSet::new();
        let mut documents: Vec<String> = Vec::new();
        for pkid in &pkids {
            let state = self.store.get_package(pkid).context(error::StoreSnafu)?;
            let Some(crate::store::PackageState::Generated(gcids)) = state else {
                continue;
            };
            for gcid in gcids {
                if !seen.insert(gcid.clone()) {
                    continue;
                }
                match self
                    .store
                    .get_metadata(kind, &gcid)
                    .context(error::StoreSnafu)?
                {
                    Some(doc) => documents.push(doc),
                    None => warn!(
                        "Package '{}' references gcid '{}' without stored metadata",
                        pkid, gcid
                    ),
                }
            }
        }

        let origin = format!("{}-{}", suite_name, section);
        let (data, extension) = match kind {
            MetadataType::Xml => (
                self.catalog_xml(&origin, suite.data_priority, &documents),
                "xml",
            ),
            MetadataType::Yaml => (
                self.catalog_yaml(&origin, suite.data_priority, &documents),
                "yml",
            ),
        };
        let path = self
            .config
            .data_export_dir()
            .join(suite_name)
            .join(section)
            .join(format!("Components-{}.{}.gz", arch, extension));
        write_gzip(&path, data.as_bytes()).context(error::ExportSnafu)?;
        info!(
            "Exported {} components to '{}'",
            documents.len(),
            path.display()
        );

        report::export_hints(
            &self.store,
            &self.config.hints_export_dir(),
            suite_name,
            section,
            arch,
            &pkids,
        )
        .context(error::ReportSnafu)?;
        Ok(())
    }

    fn catalog_xml(&self, origin: &str, priority: i32, documents: &[String]) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        out.push_str(&format!(
            "<components version=\"0.16\" origin=\"{}\"",
            origin
        ));
        if priority != 0 {
            out.push_str(&format!(" priority=\"{}\"", priority));
        }
        out.push_str(&format!(
            " media_baseurl=\"{}\"",
            self.config.media_base_url
        ));
        if self.config.features.metadata_timestamps {
            out.push_str(&format!(" time=\"{}\"", Utc::now().format("%Y%m%dT%H%M%S")));
        }
        out.push_str(">\n");
        for doc in documents {
            out.push_str(doc);
        }
        out.push_str("</components>\n");
        out
    }

    fn catalog_yaml(&self, origin: &str, priority: i32, documents: &[String]) -> String {
        let mut out = String::from("---\nFile: DEP-11\nVersion: '0.16'\n");
        out.push_str(&format!("Origin: {}\n", origin));
        out.push_str(&format!("MediaBaseUrl: {}\n", self.config.media_base_url));
        if priority != 0 {
            out.push_str(&format!("Priority: {}\n", priority));
        }
        if self.config.features.metadata_timestamps {
            out.push_str(&format!("Time: {}\n", Utc::now().format("%Y%m%dT%H%M%S")));
        }
        for doc in documents {
            out.push_str("---\n");
            out.push_str(doc);
        }
        out
    }

    /// Run cruft collection only.
    pub fn cleanup(&self) -> Result<()> {
        let gc = self.store.gc_cruft().context(error::StoreSnafu)?;
        info!(
            "Cruft collection removed {} metadata entries and {} media directories",
            gc.metadata_removed, gc.media_removed
        );
        Ok(())
    }

    /// Drop all packages of a suite from the store so the next run
    /// regenerates them.
    pub fn remove_found(&self, suite_name: &str) -> Result<()> {
        let suite = self.config.suite(suite_name).context(error::ConfigSnafu)?;
        let mut removed = 0usize;
        for section in &suite.sections {
            for arch in &suite.architectures {
                let packages = match self.index.packages_for(suite_name, section, arch) {
                    Ok(packages) => packages,
                    Err(e) => {
                        warn!("Skipping {}/{}: {}", section, arch, e);
                        continue;
                    }
                };
                for pkg in packages {
                    let pkid = pkg.pkid();
                    self.store.remove_package(&pkid).context(error::StoreSnafu)?;
                    self.contents
                        .remove_contents(&pkid)
                        .context(error::ContentsSnafu)?;
                    removed += 1;
                }
                self.store
                    .remove_repo_info(suite_name, section, arch)
                    .context(error::StoreSnafu)?;
            }
        }
        info!("Removed {} packages of suite '{}'", removed, suite_name);
        Ok(())
    }

    /// Drop a single package from the store.
    pub fn forget(&self, pkid: &str) -> Result<()> {
        snafu::ensure!(
            self.store.package_exists(pkid).context(error::StoreSnafu)?,
            error::UnknownPackageSnafu { pkid }
        );
        self.store.remove_package(pkid).context(error::StoreSnafu)?;
        self.contents
            .remove_contents(pkid)
            .context(error::ContentsSnafu)?;
        info!("Removed package '{}'", pkid);
        Ok(())
    }
}

fn result_hints_only(
    store: &DataStore,
    result: &GeneratorResult,
) -> std::result::Result<(), String> {
    if !result.has_hints() {
        return Ok(());
    }
    let doc = serde_json::to_string(&result.hints_document()).map_err(|e| e.to_string())?;
    store.put_hints(result.pkid(), &doc).map_err(|e| e.to_string())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Backend selection failed: {}", source))]
        Backend { source: crate::backend::Error },

        #[snafu(display("Configuration problem: {}", source))]
        Config { source: metasys_config::Error },

        #[snafu(display("Contents index failure: {}", source))]
        Contents { source: crate::contents::Error },

        #[snafu(display("Failed to write catalog data: {}", source))]
        Export { source: crate::common::error::Error },

        #[snafu(display("Package index unavailable: {}", source))]
        Index { source: crate::backend::Error },

        #[snafu(display("Failed to export the hints report: {}", source))]
        Report { source: crate::report::error::Error },

        #[snafu(display("Failed to set up screenshot downloads: {}", source))]
        Screenshots {
            source: crate::handlers::screenshots::error::Error,
        },

        #[snafu(display("{} stage(s) failed; see the log for details", count))]
        StagesFailed { count: usize },

        #[snafu(display("Data store failure: {}", source))]
        Store { source: crate::store::Error },

        #[snafu(display("A store write failed mid-run; the stage was aborted"))]
        StoreWrite,

        #[snafu(display("Failed to build the worker pool: {}", source))]
        ThreadPool { source: rayon::ThreadPoolBuildError },

        #[snafu(display("Package '{}' is not recorded in the store", pkid))]
        UnknownPackage { pkid: String },
    }
}
