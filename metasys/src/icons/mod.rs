/*!
Icon resolution and media output.

For every component the resolver takes the requested icon name, searches the
union of all packages' icon files (themed trees first, pixmaps as a last
resort for the default size), rasterizes the best source per policy size and
writes the PNGs into the component's media directory.

Resolution runs in two phases so the component's content fingerprint can
settle before anything touches the media pool: `resolve` picks sources and
loads their bytes, `store` rasterizes and writes under the final global id.
*/

pub mod theme;

use crate::backend::Package;
use crate::common::{path_basename, with_png_extension, write_atomic};
use crate::component::{Component, Icon};
use crate::hint_vars;
use crate::hints::Hint;
use crate::render::{ImageInfo, RasterFormat, Rasterizer};
use log::{debug, warn};
use metasys_config::IconPolicyEntry;
use std::collections::HashMap;
use std::path::PathBuf;
use self::theme::Theme;
use std::sync::Arc;
use url::Url;

/// The mandatory icon size every component must end up with.
pub const DEFAULT_SIZE: u32 = 64;

/// Smallest source edge the generator accepts for the default size.
const MIN_SOURCE_SIZE: u32 = 48;

/// Extensions probed inside theme directories, in preference order.
const THEME_EXTENSIONS: &[(&str, RasterFormat)] = &[
    ("png", RasterFormat::Png),
    ("svg", RasterFormat::Svg),
    ("svgz", RasterFormat::Svgz),
    ("xpm", RasterFormat::Xpm),
];

/// Extensions probed under /usr/share/pixmaps for the default size.
const PIXMAP_EXTENSIONS: &[(&str, Option<RasterFormat>)] = &[
    ("png", Some(RasterFormat::Png)),
    ("jpg", Some(RasterFormat::Jpeg)),
    ("svgz", Some(RasterFormat::Svgz)),
    ("svg", Some(RasterFormat::Svg)),
    ("xpm", Some(RasterFormat::Xpm)),
    // Present in archives, but never rasterized.
    ("gif", None),
    ("ico", None),
];

/// Embedded hicolor index, used when no package ships one.
const HICOLOR_INDEX: &str = include_str!("../../data/hicolor-index.theme");

/// The theme search order: hicolor, the configured preference, then the
/// common desktop default themes.
pub fn theme_names(configured: Option<&str>) -> Vec<String> {
    let mut names = vec!["hicolor".to_string()];
    if let Some(theme) = configured {
        if !names.iter().any(|n| n == theme) {
            names.push(theme.to_string());
        }
    }
    for fallback in ["Adwaita", "breeze"] {
        if !names.iter().any(|n| n == fallback) {
            names.push(fallback.to_string());
        }
    }
    names
}

/// Load theme indices from the package union, falling back to the bundled
/// hicolor definition. Themes that are not present anywhere are skipped.
pub fn load_themes(
    names: &[String],
    icon_files: &HashMap<String, String>,
    packages: &HashMap<String, Arc<dyn Package>>,
) -> Vec<Theme> {
    let mut themes = Vec::new();
    for name in names {
        let index_path = format!("/usr/share/icons/{}/index.theme", name);
        let parsed = icon_files
            .get(&index_path)
            .and_then(|pkid| packages.get(pkid))
            .and_then(|pkg| match pkg.data(&index_path) {
                Ok(data) => Some(String::from_utf8_lossy(&data).to_string()),
                Err(e) => {
                    warn!("Could not read '{}': {}", index_path, e);
                    None
                }
            })
            .and_then(|data| match Theme::parse(name, &data) {
                Ok(theme) => Some(theme),
                Err(e) => {
                    warn!("Could not parse theme index of '{}': {}", name, e);
                    None
                }
            });
        match parsed {
            Some(theme) => themes.push(theme),
            None if name == "hicolor" => {
                // Guaranteed baseline; the embedded index always parses.
                if let Ok(theme) = Theme::parse("hicolor", HICOLOR_INDEX) {
                    themes.push(theme);
                }
            }
            None => debug!("Icon theme '{}' not found in this package set", name),
        }
    }
    themes
}

/// One chosen icon source for one policy size.
#[derive(Debug, Clone)]
pub struct SizedSource {
    pub entry: IconPolicyEntry,
    pub path: String,
    pub format: RasterFormat,
    pub info: ImageInfo,
    pub data: Arc<Vec<u8>>,
    pub upscaled: bool,
}

/// Everything `resolve` found for a component.
#[derive(Debug, Default)]
pub struct ResolvedIcons {
    pub name: String,
    pub sources: Vec<SizedSource>,
    /// A size-specific failure hint was already emitted; suppresses the
    /// generic not-found hint.
    had_failure: bool,
}

impl ResolvedIcons {
    /// Source bytes entering the component fingerprint: unique by path, in
    /// path order so the digest is stable.
    pub fn fingerprint_parts(&self) -> Vec<Vec<u8>> {
        let mut by_path: Vec<(&str, &Arc<Vec<u8>>)> = Vec::new();
        for source in &self.sources {
            if !by_path.iter().any(|(p, _)| *p == source.path) {
                by_path.push((source.path.as_str(), &source.data));
            }
        }
        by_path.sort_by_key(|(p, _)| *p);
        by_path.iter().map(|(_, d)| d.as_ref().clone()).collect()
    }
}

struct FoundFile {
    path: String,
    pkid: String,
    format: RasterFormat,
}

pub struct IconHandler<'a> {
    themes: Vec<Theme>,
    icon_files: HashMap<String, String>,
    packages: &'a HashMap<String, Arc<dyn Package>>,
    rasterizer: &'a dyn Rasterizer,
    policy: Vec<IconPolicyEntry>,
    media_dir: PathBuf,
    media_base_url: Url,
    allow_upscale: bool,
    optimize_pngs: bool,
}

impl<'a> IconHandler<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        themes: Vec<Theme>,
        icon_files: HashMap<String, String>,
        packages: &'a HashMap<String, Arc<dyn Package>>,
        rasterizer: &'a dyn Rasterizer,
        policy: &[IconPolicyEntry],
        media_dir: PathBuf,
        media_base_url: Url,
        allow_upscale: bool,
        optimize_pngs: bool,
    ) -> Self {
        Self {
            themes,
            icon_files,
            packages,
            rasterizer,
            policy: policy
                .iter()
                .filter(|e| e.store_cached || e.store_remote)
                .cloned()
                .collect(),
            media_dir,
            media_base_url,
            allow_upscale,
            optimize_pngs,
        }
    }

    fn is_default(entry: &IconPolicyEntry) -> bool {
        entry.size == DEFAULT_SIZE && entry.scale == 1
    }

    /// Pick a source file for every policy size and load its bytes. The
    /// returned hints go onto the component.
    pub fn resolve(
        &self,
        cpt: &Component,
        current_pkid: &str,
        current_contents: &[String],
    ) -> (Option<ResolvedIcons>, Vec<Hint>) {
        let mut hints = Vec::new();

        let name = match cpt.stock_icon().or(cpt.local_icon()) {
            Some(name) => name.to_string(),
            None => {
                if cpt.kind().is_gui_app() {
                    hints.push(Hint::new("gui-app-without-icon", hint_vars! {}));
                }
                return (None, hints);
            }
        };

        let mut resolved = ResolvedIcons {
            name: name.clone(),
            ..Default::default()
        };
        let mut data_cache: HashMap<String, Arc<Vec<u8>>> = HashMap::new();

        for entry in self.policy.clone() {
            let Some(found) = self.find_source(&name, &entry, current_pkid, current_contents)
            else {
                continue;
            };
            let data = match data_cache.get(&found.path) {
                Some(data) => Arc::clone(data),
                None => {
                    let Some(pkg) = self.packages.get(&found.pkid) else {
                        continue;
                    };
                    match pkg.data(&found.path) {
                        Ok(bytes) => {
                            let bytes = Arc::new(bytes);
                            data_cache.insert(found.path.clone(), Arc::clone(&bytes));
                            bytes
                        }
                        Err(e) => {
                            resolved.had_failure = true;
                            hints.push(Hint::new(
                                "icon-read-error",
                                hint_vars! { "icon_fname" => found.path, "error" => e },
                            ));
                            continue;
                        }
                    }
                }
            };
            let info = match self.rasterizer.probe(&data, found.format) {
                Ok(info) => info,
                Err(e) => {
                    resolved.had_failure = true;
                    hints.push(Hint::new(
                        "icon-read-error",
                        hint_vars! { "icon_fname" => found.path, "error" => e },
                    ));
                    continue;
                }
            };

            let target = entry.pixels();
            let mut upscaled = false;
            if !info.scalable {
                let min_source = if self.allow_upscale {
                    MIN_SOURCE_SIZE
                } else {
                    target
                };
                if found.format == RasterFormat::Xpm {
                    // XPM art is legacy; only the mandatory size accepts it.
                    if !Self::is_default(&entry) {
                        continue;
                    }
                    if info.width < min_source {
                        resolved.had_failure = true;
                        hints.push(Hint::new(
                            "icon-too-small",
                            hint_vars! { "icon_fname" => found.path },
                        ));
                        continue;
                    }
                    upscaled = info.width < target;
                } else if info.width < target {
                    if Self::is_default(&entry) {
                        if info.width < MIN_SOURCE_SIZE {
                            resolved.had_failure = true;
                            hints.push(Hint::new(
                                "icon-too-small",
                                hint_vars! { "icon_fname" => found.path },
                            ));
                            continue;
                        }
                        if !self.allow_upscale {
                            continue;
                        }
                        upscaled = true;
                    } else {
                        // Non-mandatory sizes are simply not produced from
                        // too-small sources.
                        continue;
                    }
                }
            }

            resolved.sources.push(SizedSource {
                entry,
                path: found.path,
                format: found.format,
                info,
                data,
                upscaled,
            });
        }

        if resolved.sources.is_empty() {
            if !resolved.had_failure {
                hints.push(Hint::new(
                    "icon-not-found",
                    hint_vars! { "icon_name" => name },
                ));
            }
            return (None, hints);
        }
        (Some(resolved), hints)
    }

    /// Search order: absolute paths inside the current package, themed
    /// lookups across all packages, pixmaps for the default size.
    fn find_source(
        &self,
        name: &str,
        entry: &IconPolicyEntry,
        current_pkid: &str,
        current_contents: &[String],
    ) -> Option<FoundFile> {
        if name.starts_with('/') {
            if current_contents.iter().any(|p| p == name) {
                return RasterFormat::from_path(name).map(|format| FoundFile {
                    path: name.to_string(),
                    pkid: current_pkid.to_string(),
                    format,
                });
            }
            return None;
        }

        for theme in &self.themes {
            for dir in theme.matching_directories(entry.size, entry.scale) {
                for (ext, format) in THEME_EXTENSIONS {
                    let path = format!(
                        "/usr/share/icons/{}/{}/{}.{}",
                        theme.name, dir.path, name, ext
                    );
                    if let Some(pkid) = self.icon_files.get(&path) {
                        return Some(FoundFile {
                            path,
                            pkid: pkid.clone(),
                            format: *format,
                        });
                    }
                }
            }
        }

        if Self::is_default(entry) {
            for (ext, format) in PIXMAP_EXTENSIONS {
                let path = format!("/usr/share/pixmaps/{}.{}", name, ext);
                if let Some(pkid) = self.icon_files.get(&path) {
                    match format {
                        Some(format) => {
                            return Some(FoundFile {
                                path,
                                pkid: pkid.clone(),
                                format: *format,
                            })
                        }
                        // A pixmap exists but in a format we never accept;
                        // keep searching smaller theme sizes below.
                        None => break,
                    }
                }
            }

            // Last resort for the mandatory size: any smaller themed source
            // that is still large enough to upscale once.
            if self.allow_upscale {
                for theme in &self.themes {
                    for dir in theme
                        .directories_for_scale(entry.scale)
                        .filter(|d| d.size >= MIN_SOURCE_SIZE && d.size < entry.size)
                    {
                        for (ext, format) in THEME_EXTENSIONS {
                            let path = format!(
                                "/usr/share/icons/{}/{}/{}.{}",
                                theme.name, dir.path, name, ext
                            );
                            if let Some(pkid) = self.icon_files.get(&path) {
                                return Some(FoundFile {
                                    path,
                                    pkid: pkid.clone(),
                                    format: *format,
                                });
                            }
                        }
                    }
                }
            }
        }
        None
    }

    /// Rasterize and persist the resolved sources under the component's
    /// media directory, attaching icon entries to the component.
    pub fn store(&self, cpt: &mut Component, gcid: &str, resolved: &ResolvedIcons) -> Vec<Hint> {
        let mut hints = Vec::new();
        let mut largest: Option<&SizedSource> = None;

        for source in &resolved.sources {
            match self.store_one(cpt, gcid, source, source.entry.clone()) {
                Ok(()) => {
                    if source.upscaled {
                        hints.push(Hint::new(
                            "icon-scaled-up",
                            hint_vars! {
                                "icon_name" => resolved.name,
                                "icon_fname" => source.path,
                            },
                        ));
                    }
                    let is_larger = largest
                        .map(|l| source.entry.pixels() > l.entry.pixels())
                        .unwrap_or(true);
                    if is_larger {
                        largest = Some(source);
                    }
                }
                Err(e) => {
                    hints.push(Hint::new(
                        "icon-read-error",
                        hint_vars! { "icon_fname" => source.path, "error" => e },
                    ));
                }
            }
        }

        // The catalog contract: a 64x64 cached icon must exist. Derive it
        // from the largest stored source if the policy pass missed it.
        if !cpt.has_cached_icon(DEFAULT_SIZE, 1) {
            let derived = largest
                .filter(|s| s.info.scalable || s.info.width >= MIN_SOURCE_SIZE)
                .map(|source| {
                    let entry = IconPolicyEntry {
                        size: DEFAULT_SIZE,
                        scale: 1,
                        store_cached: true,
                        store_remote: false,
                    };
                    self.store_one(cpt, gcid, source, entry)
                });
            match derived {
                Some(Ok(())) => {}
                _ => {
                    if !resolved.had_failure {
                        hints.push(Hint::new(
                            "icon-not-found",
                            hint_vars! { "icon_name" => resolved.name },
                        ));
                    }
                }
            }
        }
        hints
    }

    fn store_one(
        &self,
        cpt: &mut Component,
        gcid: &str,
        source: &SizedSource,
        entry: IconPolicyEntry,
    ) -> Result<(), String> {
        let size_dir = entry.dir_name();
        let filename = format!(
            "{}_{}",
            cpt.pkgname,
            with_png_extension(path_basename(&source.path))
        );
        let dest = self
            .media_dir
            .join(gcid)
            .join("icons")
            .join(&size_dir)
            .join(&filename);

        // An existing file means another component with the same content
        // already produced this PNG; re-rasterizing would yield the same
        // bytes.
        if !dest.exists() {
            let pixels = entry.pixels();
            let png = self
                .rasterizer
                .render_png(&source.data, source.format, pixels, pixels)
                .map_err(|e| e.to_string())?;
            write_atomic(&dest, &png).map_err(|e| e.to_string())?;
            if self.optimize_pngs {
                self.rasterizer.optimize_stored_png(&dest);
            }
        }

        if entry.store_cached {
            let icon = Icon::Cached {
                name: filename.clone(),
                width: entry.size,
                height: entry.size,
                scale: entry.scale,
            };
            if !cpt.icons.contains(&icon) {
                cpt.icons.push(icon);
            }
        }
        if entry.store_remote {
            let url = format!(
                "{}/{}/icons/{}/{}",
                self.media_base_url.as_str().trim_end_matches('/'),
                gcid,
                size_dir,
                filename
            );
            let icon = Icon::Remote {
                url,
                width: entry.size,
                height: entry.size,
                scale: entry.scale,
            };
            if !cpt.icons.contains(&icon) {
                cpt.icons.push(icon);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::backend::{self, Package};
    use crate::render::{ImageInfo, RasterFormat, Rasterizer};
    use std::collections::HashMap;

    /// In-memory package for handler tests.
    pub struct MemPackage {
        pub pkg_name: String,
        pub pkg_version: String,
        pub pkg_arch: String,
        pub files: HashMap<String, Vec<u8>>,
    }

    impl MemPackage {
        pub fn new(name: &str, files: &[(&str, &[u8])]) -> Self {
            Self {
                pkg_name: name.to_string(),
                pkg_version: "1.0".to_string(),
                pkg_arch: "amd64".to_string(),
                files: files
                    .iter()
                    .map(|(p, d)| (p.to_string(), d.to_vec()))
                    .collect(),
            }
        }
    }

    impl Package for MemPackage {
        fn name(&self) -> &str {
            &self.pkg_name
        }

        fn version(&self) -> &str {
            &self.pkg_version
        }

        fn arch(&self) -> &str {
            &self.pkg_arch
        }

        fn contents(&self) -> backend::Result<Vec<String>> {
            let mut paths: Vec<String> = self.files.keys().cloned().collect();
            paths.sort();
            Ok(paths)
        }

        fn data(&self, path: &str) -> backend::Result<Vec<u8>> {
            self.files.get(path).cloned().ok_or_else(|| {
                backend::FileMissingSnafu {
                    pkid: self.pkid(),
                    path,
                }
                .build()
            })
        }

        fn close(&self) {}
    }

    /// Rasterizer whose "images" are `WxH` strings; rendering just rewrites
    /// the dimension header, so tests can assert on output sizes.
    pub struct FakeRasterizer;

    impl FakeRasterizer {
        pub fn image(width: u32, height: u32) -> Vec<u8> {
            format!("{}x{}", width, height).into_bytes()
        }
    }

    impl Rasterizer for FakeRasterizer {
        fn probe(&self, data: &[u8], format: RasterFormat) -> crate::render::Result<ImageInfo> {
            let text = String::from_utf8_lossy(data);
            let mut parts = text.trim().split('x').filter_map(|p| p.parse().ok());
            let width = parts.next().unwrap_or(0);
            let height = parts.next().unwrap_or(width);
            Ok(ImageInfo {
                width,
                height,
                scalable: format.is_scalable(),
            })
        }

        fn render_png(
            &self,
            _data: &[u8],
            _format: RasterFormat,
            width: u32,
            height: u32,
        ) -> crate::render::Result<Vec<u8>> {
            Ok(Self::image(width, height))
        }
    }
}

#[cfg(test)]
mod test {
    use super::test_support::{FakeRasterizer, MemPackage};
    use super::*;
    use crate::component::ComponentKind;
    use crate::hints::Severity;

    fn policy() -> Vec<IconPolicyEntry> {
        vec![
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

    struct Fixture {
        _media: tempfile::TempDir,
        media_dir: PathBuf,
        packages: HashMap<String, Arc<dyn Package>>,
        icon_files: HashMap<String, String>,
    }

    impl Fixture {
        fn new(files: &[(&str, &[u8])]) -> Self {
            let media = tempfile::tempdir().unwrap();
            let media_dir = media.path().to_path_buf();
            let pkg: Arc<dyn Package> = Arc::new(MemPackage::new("foo", files));
            let pkid = pkg.pkid();
            let mut packages = HashMap::new();
            let mut icon_files = HashMap::new();
            for (path, _) in files {
                icon_files.insert(path.to_string(), pkid.clone());
            }
            packages.insert(pkid, pkg);
            Self {
                _media: media,
                media_dir,
                packages,
                icon_files,
            }
        }

        fn handler<'a>(&'a self, rasterizer: &'a dyn Rasterizer) -> IconHandler<'a> {
            let themes = load_themes(
                &theme_names(None),
                &self.icon_files,
                &self.packages,
            );
            IconHandler::new(
                themes,
                self.icon_files.clone(),
                &self.packages,
                rasterizer,
                &policy(),
                self.media_dir.clone(),
                Url::parse("https://media.example.org/pool").unwrap(),
                true,
                false,
            )
        }
    }

    fn desktop_component(icon: &str) -> Component {
        let mut cpt = Component::new(ComponentKind::DesktopApp, "org.example.foo");
        cpt.pkgname = "foo".to_string();
        cpt.icons.push(Icon::Stock {
            name: icon.to_string(),
        });
        cpt
    }

    #[test]
    fn downscales_one_source_for_all_sizes() {
        let big = FakeRasterizer::image(128, 128);
        let fixture = Fixture::new(&[(
            "/usr/share/icons/hicolor/128x128/apps/foo.png",
            big.as_slice(),
        )]);
        let raster = FakeRasterizer;
        let handler = fixture.handler(&raster);
        let mut cpt = desktop_component("foo");

        let (resolved, hints) = handler.resolve(&cpt, "foo/1.0/amd64", &[]);
        assert!(hints.is_empty());
        let resolved = resolved.unwrap();
        assert_eq!(resolved.sources.len(), 2);
        // One source file feeds both sizes, so only one fingerprint part.
        assert_eq!(resolved.fingerprint_parts().len(), 1);

        let hints = handler.store(&mut cpt, "org/example/foo/ABCD", &resolved);
        assert!(hints.is_empty());
        assert!(cpt.has_cached_icon(64, 1));
        assert!(cpt.has_cached_icon(128, 1));
        for size_dir in ["64x64", "128x128"] {
            let path = fixture
                .media_dir
                .join("org/example/foo/ABCD/icons")
                .join(size_dir)
                .join("foo_foo.png");
            assert!(path.is_file(), "missing {}", path.display());
        }
        // The 64x64 render was actually downscaled.
        let data = std::fs::read(
            fixture
                .media_dir
                .join("org/example/foo/ABCD/icons/64x64/foo_foo.png"),
        )
        .unwrap();
        assert_eq!(data, FakeRasterizer::image(64, 64));
    }

    #[test]
    fn small_xpm_pixmap_is_rejected() {
        let small = FakeRasterizer::image(32, 32);
        let fixture = Fixture::new(&[("/usr/share/pixmaps/foo.xpm", small.as_slice())]);
        let raster = FakeRasterizer;
        let handler = fixture.handler(&raster);
        let cpt = desktop_component("foo");

        let (resolved, hints) = handler.resolve(&cpt, "foo/1.0/amd64", &[]);
        assert!(resolved.is_none());
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].tag, "icon-too-small");
        // No icon-not-found alongside the specific failure.
        assert!(!hints.iter().any(|h| h.tag == "icon-not-found"));
    }

    #[test]
    fn adequate_xpm_serves_the_default_size_only() {
        let xpm = FakeRasterizer::image(48, 48);
        let fixture = Fixture::new(&[("/usr/share/pixmaps/foo.xpm", xpm.as_slice())]);
        let raster = FakeRasterizer;
        let handler = fixture.handler(&raster);
        let mut cpt = desktop_component("foo");

        let (resolved, _) = handler.resolve(&cpt, "foo/1.0/amd64", &[]);
        let resolved = resolved.unwrap();
        assert_eq!(resolved.sources.len(), 1);
        assert_eq!(resolved.sources[0].entry.size, 64);

        let hints = handler.store(&mut cpt, "org/example/foo/ABCD", &resolved);
        assert!(cpt.has_cached_icon(64, 1));
        assert!(!cpt.has_cached_icon(128, 1));
        // Upscaling 48 -> 64 is reported.
        assert!(hints.iter().any(|h| h.tag == "icon-scaled-up"));
        assert_eq!(hints[0].severity(), Severity::Info);
    }

    #[test]
    fn missing_icon_reports_not_found() {
        let fixture = Fixture::new(&[]);
        let raster = FakeRasterizer;
        let handler = fixture.handler(&raster);
        let cpt = desktop_component("nonexistent");
        let (resolved, hints) = handler.resolve(&cpt, "foo/1.0/amd64", &[]);
        assert!(resolved.is_none());
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].tag, "icon-not-found");
    }

    #[test]
    fn gui_app_without_icon_name_is_flagged() {
        let fixture = Fixture::new(&[]);
        let raster = FakeRasterizer;
        let handler = fixture.handler(&raster);
        let mut cpt = desktop_component("x");
        cpt.icons.clear();
        let (resolved, hints) = handler.resolve(&cpt, "foo/1.0/amd64", &[]);
        assert!(resolved.is_none());
        assert_eq!(hints[0].tag, "gui-app-without-icon");
        assert!(hints[0].is_error());
    }

    #[test]
    fn existing_media_is_reused_without_rerendering() {
        let big = FakeRasterizer::image(128, 128);
        let fixture = Fixture::new(&[(
            "/usr/share/icons/hicolor/128x128/apps/foo.png",
            big.as_slice(),
        )]);
        let raster = FakeRasterizer;
        let handler = fixture.handler(&raster);

        let mut cpt = desktop_component("foo");
        let (resolved, _) = handler.resolve(&cpt, "foo/1.0/amd64", &[]);
        let resolved = resolved.unwrap();
        handler.store(&mut cpt, "org/example/foo/ABCD", &resolved);

        // Scribble over the stored file; a second store must keep it as-is
        // but still attach icons to the new component.
        let dest = fixture
            .media_dir
            .join("org/example/foo/ABCD/icons/64x64/foo_foo.png");
        std::fs::write(&dest, b"sentinel").unwrap();
        let mut cpt2 = desktop_component("foo");
        handler.store(&mut cpt2, "org/example/foo/ABCD", &resolved);
        assert!(cpt2.has_cached_icon(64, 1));
        assert_eq!(std::fs::read(&dest).unwrap(), b"sentinel");
    }

    #[test]
    fn remote_policy_attaches_remote_icons() {
        let big = FakeRasterizer::image(128, 128);
        let fixture = Fixture::new(&[(
            "/usr/share/icons/hicolor/128x128/apps/foo.png",
            big.as_slice(),
        )]);
        let raster = FakeRasterizer;
        let themes = load_themes(&theme_names(None), &fixture.icon_files, &fixture.packages);
        let remote_policy = vec![IconPolicyEntry {
            size: 64,
            scale: 1,
            store_cached: true,
            store_remote: true,
        }];
        let handler = IconHandler::new(
            themes,
            fixture.icon_files.clone(),
            &fixture.packages,
            &raster,
            &remote_policy,
            fixture.media_dir.clone(),
            Url::parse("https://media.example.org/pool").unwrap(),
            true,
            false,
        );
        let mut cpt = desktop_component("foo");
        let (resolved, _) = handler.resolve(&cpt, "foo/1.0/amd64", &[]);
        handler.store(&mut cpt, "org/example/foo/ABCD", &resolved.unwrap());
        let remote = cpt.icons.iter().find_map(|i| match i {
            Icon::Remote { url, .. } => Some(url.clone()),
            _ => None,
        });
        assert_eq!(
            remote.unwrap(),
            "https://media.example.org/pool/org/example/foo/ABCD/icons/64x64/foo_foo.png"
        );
    }

    #[test]
    fn absolute_icon_paths_resolve_in_the_current_package() {
        let png = FakeRasterizer::image(64, 64);
        let fixture = Fixture::new(&[("/opt/foo/icon.png", png.as_slice())]);
        let raster = FakeRasterizer;
        let handler = fixture.handler(&raster);
        let mut cpt = desktop_component("x");
        cpt.icons.clear();
        cpt.icons.push(Icon::Local {
            path: "/opt/foo/icon.png".to_string(),
        });
        let contents = vec!["/opt/foo/icon.png".to_string()];
        let (resolved, _) = handler.resolve(&cpt, "foo/1.0/amd64", &contents);
        let resolved = resolved.unwrap();
        assert_eq!(resolved.sources[0].path, "/opt/foo/icon.png");
    }

    #[test]
    fn theme_search_order_is_stable() {
        let names = theme_names(Some("Papirus"));
        assert_eq!(names, vec!["hicolor", "Papirus", "Adwaita", "breeze"]);
        let names = theme_names(None);
        assert_eq!(names, vec!["hicolor", "Adwaita", "breeze"]);
    }
}
