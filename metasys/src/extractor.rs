/*!
Per-package metadata extraction.

One extractor instance serves a whole (suite, section, arch) stage and is
shared by all worker threads; `process` runs everything that concerns a
single package: file classification, metainfo and desktop-entry parsing,
merging, fingerprinting, icon/screenshot/font/locale handling and result
finalization. All failures inside a package surface as hints, never as
errors, so one broken package cannot stop a stage.

Fingerprints must be complete before any media is written, so handlers are
driven in two rounds: first every source byte stream is gathered and folded
into the component's global id, then media lands under the final id.
*/

use crate::backend::Package;
use crate::component::Component;
use crate::desktop::{self, KeyFile};
use crate::handlers::fonts::{self, CollectedFonts, FontHandler};
use crate::handlers::locale::LocaleHandler;
use crate::handlers::screenshots::{FetchedShots, ScreenshotHandler};
use crate::hint_vars;
use crate::hints::Hint;
use crate::icons::{IconHandler, ResolvedIcons};
use crate::metainfo;
use crate::result::{GeneratorResult, GENERAL_CID};
use log::debug;
use metasys_config::Features;
use std::collections::{HashMap, HashSet};

const METAINFO_PREFIX: &str = "/usr/share/metainfo/";
const APPDATA_PREFIX: &str = "/usr/share/appdata/";
const APPLICATIONS_PREFIX: &str = "/usr/share/applications/";

/// The outcome of processing one package.
pub struct Extraction {
    pub result: GeneratorResult,
    /// True when package data could not be read; such packages are not
    /// recorded as processed and will be retried on the next run.
    pub failed: bool,
}

pub struct Extractor<'a> {
    features: &'a Features,
    icons: &'a IconHandler<'a>,
    locale: Option<LocaleHandler<'a>>,
    screenshots: Option<&'a ScreenshotHandler<'a>>,
    fonts: Option<&'a FontHandler<'a>>,
}

impl<'a> Extractor<'a> {
    pub fn new(
        features: &'a Features,
        icons: &'a IconHandler<'a>,
        locale: Option<LocaleHandler<'a>>,
        screenshots: Option<&'a ScreenshotHandler<'a>>,
        fonts: Option<&'a FontHandler<'a>>,
    ) -> Self {
        Self {
            features,
            icons,
            locale,
            screenshots,
            fonts,
        }
    }

    /// Process one package into a finalized result.
    pub fn process(&self, pkg: &dyn Package) -> Extraction {
        let pkid = pkg.pkid();
        let mut res = GeneratorResult::new(&pkid, pkg.name());
        let mut failed = false;

        let contents = match pkg.contents() {
            Ok(contents) => contents,
            Err(e) => {
                res.add_hint(
                    GENERAL_CID,
                    "pkg-extract-error",
                    hint_vars! { "fname" => "<file list>", "error" => e },
                );
                pkg.close();
                return Extraction { result: res, failed: true };
            }
        };

        let metainfo_files = classify_metainfo(&contents);
        let desktop_files = self.parse_desktop_files(pkg, &contents, &mut res, &mut failed);
        let mut used_desktop: HashSet<String> = HashSet::new();

        // Metainfo components, merged with their desktop counterparts.
        for path in &metainfo_files {
            let data = match pkg.data(path) {
                Ok(data) => data,
                Err(e) => {
                    failed = true;
                    res.add_hint(
                        GENERAL_CID,
                        "pkg-extract-error",
                        hint_vars! { "fname" => path, "error" => e },
                    );
                    continue;
                }
            };
            let text = String::from_utf8_lossy(&data).to_string();
            let mut cpt = match metainfo::parse_metainfo(&text) {
                Ok(cpt) => cpt,
                Err(metainfo::error::Error::NoId) => {
                    res.add_hint(
                        GENERAL_CID,
                        "metainfo-no-id",
                        hint_vars! { "fname" => path },
                    );
                    continue;
                }
                Err(e) => {
                    res.add_hint(
                        GENERAL_CID,
                        "metainfo-parse-error",
                        hint_vars! { "fname" => path, "error" => e },
                    );
                    continue;
                }
            };

            if self.features.validate {
                for hint in validate_component(&cpt) {
                    res.push_hint(&cpt.cid, hint);
                }
            }

            let desktop_name = desktop::desktop_file_name_for_cid(&cpt.cid);
            let matched = desktop_files.get(&desktop_name);
            if let Some((kf, _)) = matched {
                desktop::merge_into_component(kf, &mut cpt);
                if cpt.launchables.is_empty() {
                    cpt.add_launchable("desktop-id", &desktop_name);
                }
                used_desktop.insert(desktop_name.clone());
            }

            let cid = cpt.cid.clone();
            if let Err(e) = res.add_component(cpt, data) {
                debug!("Skipping component from '{}': {}", path, e);
                continue;
            }
            if let Some((_, desktop_bytes)) = matched {
                // The merged desktop data is part of the content identity.
                let _ = res.update_component_gcid(&cid, desktop_bytes.clone());
            }
        }

        // Desktop files without metainfo become components of their own.
        if self.features.process_desktop {
            for (basename, (kf, bytes)) in &desktop_files {
                if used_desktop.contains(basename) {
                    continue;
                }
                let Some(cpt) = desktop::component_from_desktop(kf, basename, false) else {
                    continue;
                };
                if res.component(&cpt.cid).is_some() {
                    continue;
                }
                if let Err(e) = res.add_component(cpt, bytes.clone()) {
                    debug!("Skipping desktop component '{}': {}", basename, e);
                }
            }
        }

        // Gather media sources and finish every fingerprint before any
        // media write happens.
        let mut resolved_icons: HashMap<String, ResolvedIcons> = HashMap::new();
        let mut fetched_shots: HashMap<String, FetchedShots> = HashMap::new();
        let mut collected_fonts: HashMap<String, CollectedFonts> = HashMap::new();

        for cid in res.cids() {
            let (resolved, hints) = match res.component(&cid) {
                Some(cpt) => self.icons.resolve(cpt, &pkid, &contents),
                None => continue,
            };
            for hint in hints {
                res.push_hint(&cid, hint);
            }
            if let Some(resolved) = resolved {
                for part in resolved.fingerprint_parts() {
                    let _ = res.update_component_gcid(&cid, part);
                }
                resolved_icons.insert(cid.clone(), resolved);
            }

            if self.features.screenshots {
                if let Some(handler) = self.screenshots {
                    let (fetched, hints) = match res.component(&cid) {
                        Some(cpt) => handler.fetch(cpt),
                        None => continue,
                    };
                    for hint in hints {
                        res.push_hint(&cid, hint);
                    }
                    if !fetched.is_empty() {
                        for part in fetched.fingerprint_parts() {
                            let _ = res.update_component_gcid(&cid, part);
                        }
                        fetched_shots.insert(cid.clone(), fetched);
                    }
                }
            }

            if self.features.process_fonts {
                if self.fonts.is_some() {
                    let (collected, hints) = match res.component(&cid) {
                        Some(cpt) => fonts::collect(cpt, pkg, &contents),
                        None => continue,
                    };
                    for hint in hints {
                        res.push_hint(&cid, hint);
                    }
                    if let Some(collected) = collected {
                        for part in collected.fingerprint_parts() {
                            let _ = res.update_component_gcid(&cid, part);
                        }
                        collected_fonts.insert(cid.clone(), collected);
                    }
                }
            }
        }

        // Media output and component augmentation under the final ids.
        for cid in res.cids() {
            let Some(gcid) = res.gcid_for(&cid).map(str::to_string) else {
                continue;
            };
            if let Some(resolved) = resolved_icons.get(&cid) {
                let hints = match res.component_mut(&cid) {
                    Some(cpt) => self.icons.store(cpt, &gcid, resolved),
                    None => continue,
                };
                for hint in hints {
                    res.push_hint(&cid, hint);
                }
            }
            if let (Some(handler), Some(fetched)) = (self.screenshots, fetched_shots.get(&cid)) {
                let hints = match res.component_mut(&cid) {
                    Some(cpt) => handler.store(cpt, &gcid, fetched),
                    None => continue,
                };
                for hint in hints {
                    res.push_hint(&cid, hint);
                }
            }
            if let (Some(handler), Some(collected)) = (self.fonts, collected_fonts.get(&cid)) {
                let hints = match res.component_mut(&cid) {
                    Some(cpt) => handler.render(cpt, &gcid, collected),
                    None => continue,
                };
                for hint in hints {
                    res.push_hint(&cid, hint);
                }
            }
            if self.features.process_locale {
                if let Some(handler) = &self.locale {
                    let hints = match res.component_mut(&cid) {
                        Some(cpt) => handler.process(cpt),
                        None => continue,
                    };
                    for hint in hints {
                        res.push_hint(&cid, hint);
                    }
                }
            }
        }

        let dropped = res.finalize();
        if !dropped.is_empty() {
            debug!(
                "Package '{}': dropped {} invalid component(s)",
                pkid,
                dropped.len()
            );
        }
        pkg.close();
        Extraction {
            result: res,
            failed,
        }
    }

    fn parse_desktop_files(
        &self,
        pkg: &dyn Package,
        contents: &[String],
        res: &mut GeneratorResult,
        failed: &mut bool,
    ) -> HashMap<String, (KeyFile, Vec<u8>)> {
        let mut desktop_files = HashMap::new();
        for path in contents {
            let Some(basename) = path.strip_prefix(APPLICATIONS_PREFIX) else {
                continue;
            };
            if basename.contains('/') || !basename.ends_with(".desktop") {
                continue;
            }
            let data = match pkg.data(path) {
                Ok(data) => data,
                Err(e) => {
                    *failed = true;
                    res.add_hint(
                        GENERAL_CID,
                        "pkg-extract-error",
                        hint_vars! { "fname" => path, "error" => e },
                    );
                    continue;
                }
            };
            match KeyFile::parse(&String::from_utf8_lossy(&data)) {
                Ok(kf) => {
                    desktop_files.insert(basename.to_string(), (kf, data));
                }
                Err(e) => {
                    res.add_hint(
                        basename,
                        "desktop-file-error",
                        hint_vars! { "fname" => path, "error" => e },
                    );
                }
            }
        }
        desktop_files
    }
}

/// Metainfo candidates: the modern location wins over legacy appdata files
/// with the same name.
fn classify_metainfo(contents: &[String]) -> Vec<String> {
    let mut files: Vec<String> = Vec::new();
    let mut basenames: HashSet<String> = HashSet::new();
    for path in contents {
        if let Some(basename) = path.strip_prefix(METAINFO_PREFIX) {
            if !basename.contains('/') && basename.ends_with(".xml") {
                files.push(path.clone());
                basenames.insert(basename.to_string());
            }
        }
    }
    for path in contents {
        if let Some(basename) = path.strip_prefix(APPDATA_PREFIX) {
            if !basename.contains('/')
                && basename.ends_with(".xml")
                && !basenames.contains(basename)
            {
                files.push(path.clone());
            }
        }
    }
    files.sort();
    files
}

/// Cheap structural lint of a parsed component; only produces hints.
fn validate_component(cpt: &Component) -> Vec<Hint> {
    let mut hints = Vec::new();
    if cpt.name().is_none() {
        hints.push(Hint::new(
            "metainfo-validation-issue",
            hint_vars! { "msg" => "The component has no name" },
        ));
    }
    if cpt.summary().is_none() {
        hints.push(Hint::new(
            "metainfo-validation-issue",
            hint_vars! { "msg" => "The component has no summary" },
        ));
    }
    if cpt.metadata_license.is_none() {
        hints.push(Hint::new(
            "metainfo-validation-issue",
            hint_vars! { "msg" => "The component does not declare a metadata license" },
        ));
    }
    hints
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component::ComponentKind;
    use crate::icons::test_support::{FakeRasterizer, MemPackage};
    use crate::icons::{load_themes, theme_names};
    use metasys_config::IconPolicyEntry;
    use std::path::PathBuf;
    use std::sync::Arc;
    use url::Url;

    const METAINFO: &str = r#"<component type="desktop-application">
  <id>org.example.foobar</id>
  <name>FooBar</name>
  <summary>An example</summary>
  <icon type="stock">foobar</icon>
</component>"#;

    const METAINFO_NO_ICON: &str = r#"<component type="desktop-application">
  <id>org.example.foobar</id>
  <name>FooBar</name>
  <summary>An example</summary>
</component>"#;

    const DESKTOP: &str = "[Desktop Entry]\nType=Application\nName=FooBar\nCategories=GTK;Utility;GNOME;\nIcon=foobar\n";

    struct Fixture {
        _media: tempfile::TempDir,
        media_dir: PathBuf,
        packages: HashMap<String, Arc<dyn Package>>,
        icon_files: HashMap<String, String>,
        features: Features,
    }

    impl Fixture {
        fn new(files: &[(&str, &[u8])]) -> Self {
            let media = tempfile::tempdir().unwrap();
            let media_dir = media.path().to_path_buf();
            let pkg: Arc<dyn Package> = Arc::new(MemPackage::new("foo", files));
            let pkid = pkg.pkid();
            let mut icon_files = HashMap::new();
            for (path, _) in files {
                if path.starts_with("/usr/share/icons/") || path.starts_with("/usr/share/pixmaps/")
                {
                    icon_files.insert(path.to_string(), pkid.clone());
                }
            }
            let mut packages = HashMap::new();
            packages.insert(pkid, pkg);
            Self {
                _media: media,
                media_dir,
                packages,
                icon_files,
                features: Features::default(),
            }
        }

        fn package(&self) -> Arc<dyn Package> {
            Arc::clone(self.packages.values().next().unwrap())
        }

        fn icon_handler<'a>(&'a self, raster: &'a dyn crate::render::Rasterizer) -> IconHandler<'a> {
            let themes = load_themes(&theme_names(None), &self.icon_files, &self.packages);
            let policy = vec![IconPolicyEntry {
                size: 64,
                scale: 1,
                store_cached: true,
                store_remote: false,
            }];
            IconHandler::new(
                themes,
                self.icon_files.clone(),
                &self.packages,
                raster,
                &policy,
                self.media_dir.clone(),
                Url::parse("https://media.example.org").unwrap(),
                true,
                false,
            )
        }
    }

    #[test]
    fn metainfo_and_desktop_merge_into_one_component() {
        let icon = FakeRasterizer::image(64, 64);
        let fixture = Fixture::new(&[
            (
                "/usr/share/metainfo/org.example.foobar.metainfo.xml",
                METAINFO.as_bytes(),
            ),
            (
                "/usr/share/applications/org.example.foobar.desktop",
                DESKTOP.as_bytes(),
            ),
            (
                "/usr/share/icons/hicolor/64x64/apps/foobar.png",
                icon.as_slice(),
            ),
        ]);
        let raster = FakeRasterizer;
        let icons = fixture.icon_handler(&raster);
        let extractor = Extractor::new(&fixture.features, &icons, None, None, None);

        let extraction = extractor.process(fixture.package().as_ref());
        assert!(!extraction.failed);
        let res = extraction.result;
        assert_eq!(res.cids(), vec!["org.example.foobar".to_string()]);
        let cpt = res.component("org.example.foobar").unwrap();
        // Name comes from metainfo, categories from the desktop file with
        // the blacklist applied.
        assert_eq!(cpt.name().unwrap(), "FooBar");
        assert_eq!(cpt.categories, vec!["Utility".to_string()]);
        assert!(cpt.has_cached_icon(64, 1));
        assert!(!res.is_ignored());
    }

    #[test]
    fn merged_desktop_changes_the_fingerprint() {
        let with_desktop = Fixture::new(&[
            (
                "/usr/share/metainfo/org.example.foobar.metainfo.xml",
                METAINFO.as_bytes(),
            ),
            (
                "/usr/share/applications/org.example.foobar.desktop",
                DESKTOP.as_bytes(),
            ),
        ]);
        let without_desktop = Fixture::new(&[(
            "/usr/share/metainfo/org.example.foobar.metainfo.xml",
            METAINFO.as_bytes(),
        )]);
        let raster = FakeRasterizer;

        let icons_a = with_desktop.icon_handler(&raster);
        let extractor_a = Extractor::new(&with_desktop.features, &icons_a, None, None, None);
        let gcid_a = extractor_a
            .process(with_desktop.package().as_ref())
            .result
            .gcid_for("org.example.foobar")
            .unwrap()
            .to_string();

        let icons_b = without_desktop.icon_handler(&raster);
        let extractor_b = Extractor::new(&without_desktop.features, &icons_b, None, None, None);
        let gcid_b = extractor_b
            .process(without_desktop.package().as_ref())
            .result
            .gcid_for("org.example.foobar")
            .unwrap()
            .to_string();

        assert_ne!(gcid_a, gcid_b);
    }

    #[test]
    fn standalone_desktop_files_become_components() {
        let icon = FakeRasterizer::image(64, 64);
        let fixture = Fixture::new(&[
            (
                "/usr/share/applications/foobar.desktop",
                DESKTOP.as_bytes(),
            ),
            (
                "/usr/share/icons/hicolor/64x64/apps/foobar.png",
                icon.as_slice(),
            ),
        ]);
        let raster = FakeRasterizer;
        let icons = fixture.icon_handler(&raster);
        let extractor = Extractor::new(&fixture.features, &icons, None, None, None);
        let res = extractor.process(fixture.package().as_ref()).result;
        assert_eq!(res.cids(), vec!["foobar.desktop".to_string()]);
        let cpt = res.component("foobar.desktop").unwrap();
        assert_eq!(cpt.kind(), ComponentKind::DesktopApp);
    }

    #[test]
    fn desktop_processing_can_be_disabled() {
        let mut fixture = Fixture::new(&[(
            "/usr/share/applications/foobar.desktop",
            DESKTOP.as_bytes(),
        )]);
        fixture.features.process_desktop = false;
        let raster = FakeRasterizer;
        let icons = fixture.icon_handler(&raster);
        let extractor = Extractor::new(&fixture.features, &icons, None, None, None);
        let res = extractor.process(fixture.package().as_ref()).result;
        assert!(res.is_ignored());
    }

    #[test]
    fn empty_package_is_ignored_without_hints() {
        let fixture = Fixture::new(&[("/usr/bin/something", b"ELF")]);
        let raster = FakeRasterizer;
        let icons = fixture.icon_handler(&raster);
        let extractor = Extractor::new(&fixture.features, &icons, None, None, None);
        let extraction = extractor.process(fixture.package().as_ref());
        assert!(!extraction.failed);
        assert!(extraction.result.is_ignored());
        assert!(!extraction.result.has_hints());
    }

    #[test]
    fn broken_metainfo_yields_parse_error_hint() {
        let fixture = Fixture::new(&[(
            "/usr/share/metainfo/broken.xml",
            b"<component><id>x</id></oops>".as_slice(),
        )]);
        let raster = FakeRasterizer;
        let icons = fixture.icon_handler(&raster);
        let extractor = Extractor::new(&fixture.features, &icons, None, None, None);
        let res = extractor.process(fixture.package().as_ref()).result;
        assert!(res.is_ignored());
        let hints = res.hints_for(GENERAL_CID);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].tag, "metainfo-parse-error");
    }

    #[test]
    fn metainfo_without_id_yields_no_id_hint() {
        let fixture = Fixture::new(&[(
            "/usr/share/metainfo/anonymous.xml",
            b"<component type=\"generic\"><name>X</name></component>".as_slice(),
        )]);
        let raster = FakeRasterizer;
        let icons = fixture.icon_handler(&raster);
        let extractor = Extractor::new(&fixture.features, &icons, None, None, None);
        let res = extractor.process(fixture.package().as_ref()).result;
        assert_eq!(res.hints_for(GENERAL_CID)[0].tag, "metainfo-no-id");
    }

    #[test]
    fn appdata_is_used_only_without_metainfo_twin() {
        let contents = vec![
            "/usr/share/appdata/a.xml".to_string(),
            "/usr/share/appdata/b.xml".to_string(),
            "/usr/share/metainfo/a.xml".to_string(),
        ];
        let files = classify_metainfo(&contents);
        assert_eq!(
            files,
            vec![
                "/usr/share/appdata/b.xml".to_string(),
                "/usr/share/metainfo/a.xml".to_string(),
            ]
        );
    }

    #[test]
    fn gui_app_without_any_icon_is_invalidated() {
        let fixture = Fixture::new(&[(
            "/usr/share/metainfo/org.example.foobar.metainfo.xml",
            METAINFO_NO_ICON.as_bytes(),
        )]);
        let raster = FakeRasterizer;
        let icons = fixture.icon_handler(&raster);
        let extractor = Extractor::new(&fixture.features, &icons, None, None, None);
        let res = extractor.process(fixture.package().as_ref()).result;
        // No icon element and no desktop file: the GUI app is dropped.
        assert!(res.is_ignored());
        assert!(res
            .hints_for("org.example.foobar")
            .iter()
            .any(|h| h.tag == "gui-app-without-icon"));
    }

    #[test]
    fn validation_feature_adds_info_hints() {
        let icon = FakeRasterizer::image(64, 64);
        let mut fixture = Fixture::new(&[
            (
                "/usr/share/metainfo/org.example.foobar.metainfo.xml",
                METAINFO.as_bytes(),
            ),
            (
                "/usr/share/applications/org.example.foobar.desktop",
                DESKTOP.as_bytes(),
            ),
            (
                "/usr/share/icons/hicolor/64x64/apps/foobar.png",
                icon.as_slice(),
            ),
        ]);
        fixture.features.validate = true;
        let raster = FakeRasterizer;
        let icons = fixture.icon_handler(&raster);
        let extractor = Extractor::new(&fixture.features, &icons, None, None, None);
        let res = extractor.process(fixture.package().as_ref()).result;
        // Metadata license is missing; the component survives regardless.
        assert!(res
            .hints_for("org.example.foobar")
            .iter()
            .any(|h| h.tag == "metainfo-validation-issue"));
        assert!(!res.is_ignored());
    }
}
