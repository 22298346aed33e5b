/*!
Font component processing.

Font rendering is delegated to an embedder-provided [`FontRenderer`]; the
underlying font library is not thread-safe, so every call into it happens
under one process-global lock, no matter how many worker threads are
running.

For a component of kind `font` the handler locates the TrueType/OpenType
files its package ships, matches them against the component's provided font
names, records the languages the selected face covers, renders an "Aa"
sample as the component icon at every cached policy size, and renders wide
specimen banners that stand in for screenshots.
*/

use crate::backend::Package;
use crate::common::{path_basename, with_png_extension, write_atomic};
use crate::component::{Component, ComponentKind, Icon, Image, ImageKind, Screenshot};
use crate::hint_vars;
use crate::hints::Hint;
use lazy_static::lazy_static;
use log::debug;
use metasys_config::IconPolicyEntry;
use snafu::Snafu;
use std::path::PathBuf;
use std::sync::Mutex;
use url::Url;

lazy_static! {
    /// Serializes every call into the font library across all workers.
    static ref FONT_LOCK: Mutex<()> = Mutex::new(());
}

/// Banner sizes rendered as font "screenshots".
const BANNER_SIZES: &[(u32, u32)] = &[(1024, 78), (640, 48)];

/// Custom-key overrides recognized on font components.
const ICON_TEXT_KEY: &str = "FontIconText";
const SAMPLE_TEXT_KEY: &str = "FontSampleText";

const DEFAULT_ICON_TEXT: &str = "Aa";
const DEFAULT_SAMPLE_TEXT: &str = "Lorem ipsum dolor sit amet, consectetur adipiscing elit.";

#[derive(Debug, Snafu)]
pub enum FontError {
    #[snafu(display("Failed to load font: {}", message))]
    Load { message: String },

    #[snafu(display("Failed to render text sample: {}", message))]
    Render { message: String },
}

/// One opened font face.
pub trait FontFace {
    fn family(&self) -> &str;
    fn style(&self) -> &str;

    /// Languages this face claims to support, as locale codes.
    fn languages(&self) -> Vec<String>;

    /// Render `text` centered on a transparent canvas of the given size,
    /// returning PNG bytes.
    fn render_sample(&self, text: &str, width: u32, height: u32)
        -> Result<Vec<u8>, FontError>;
}

/// The font library seam. Implementations are typically not thread-safe;
/// the handler takes the global font lock around every use.
pub trait FontRenderer: Send + Sync {
    fn load(&self, data: &[u8]) -> Result<Box<dyn FontFace>, FontError>;
}

/// Font files selected for a component, phase one of the handler.
#[derive(Debug, Default)]
pub struct CollectedFonts {
    pub files: Vec<(String, Vec<u8>)>,
}

impl CollectedFonts {
    /// Bytes entering the component fingerprint, in path order.
    pub fn fingerprint_parts(&self) -> Vec<Vec<u8>> {
        let mut sorted: Vec<&(String, Vec<u8>)> = self.files.iter().collect();
        sorted.sort_by_key(|(path, _)| path.clone());
        sorted.iter().map(|(_, data)| data.clone()).collect()
    }
}

fn is_font_path(path: &str) -> bool {
    let lower = path.to_ascii_lowercase();
    lower.starts_with("/usr/share/fonts/") && (lower.ends_with(".ttf") || lower.ends_with(".otf"))
}

/// Select the package's font files for this component. Provided font names
/// narrow the choice; without them every shipped font belongs to the
/// component.
pub fn collect(
    cpt: &Component,
    pkg: &dyn Package,
    contents: &[String],
) -> (Option<CollectedFonts>, Vec<Hint>) {
    if cpt.kind() != ComponentKind::Font {
        return (None, Vec::new());
    }
    let mut hints = Vec::new();
    let font_paths: Vec<&String> = contents.iter().filter(|p| is_font_path(p)).collect();
    if font_paths.is_empty() {
        hints.push(Hint::new("font-metainfo-but-no-font", hint_vars! {}));
        return (None, hints);
    }

    let wanted: Vec<String> = cpt
        .provided
        .fonts
        .iter()
        .map(|f| f.to_ascii_lowercase())
        .collect();
    let selected: Vec<&String> = if wanted.is_empty() {
        font_paths
    } else {
        let matching: Vec<&String> = font_paths
            .iter()
            .filter(|path| {
                let base = path_basename(path).to_ascii_lowercase();
                let stem = base
                    .rsplit_once('.')
                    .map(|(s, _)| s.to_string())
                    .unwrap_or(base);
                wanted
                    .iter()
                    .any(|w| stem.contains(w.as_str()) || w.contains(stem.as_str()))
            })
            .copied()
            .collect();
        if matching.is_empty() {
            // Name matching failed; better to show some face than none.
            font_paths
        } else {
            matching
        }
    };

    let mut collected = CollectedFonts::default();
    for path in selected {
        match pkg.data(path) {
            Ok(data) => collected.files.push((path.clone(), data)),
            Err(e) => hints.push(Hint::new(
                "font-load-error",
                hint_vars! { "fname" => path, "error" => e },
            )),
        }
    }
    if collected.files.is_empty() {
        return (None, hints);
    }
    (Some(collected), hints)
}

pub struct FontHandler<'a> {
    renderer: &'a dyn FontRenderer,
    policy: Vec<IconPolicyEntry>,
    media_dir: PathBuf,
    media_base_url: Url,
}

impl<'a> FontHandler<'a> {
    pub fn new(
        renderer: &'a dyn FontRenderer,
        policy: &[IconPolicyEntry],
        media_dir: PathBuf,
        media_base_url: Url,
    ) -> Self {
        Self {
            renderer,
            policy: policy.iter().filter(|e| e.store_cached).cloned().collect(),
            media_dir,
            media_base_url,
        }
    }

    /// Render icon samples and specimen banners for the collected fonts and
    /// attach the results to the component.
    pub fn render(
        &self,
        cpt: &mut Component,
        gcid: &str,
        collected: &CollectedFonts,
    ) -> Vec<Hint> {
        let mut hints = Vec::new();
        let icon_text = cpt
            .custom
            .get(ICON_TEXT_KEY)
            .cloned()
            .unwrap_or_else(|| DEFAULT_ICON_TEXT.to_string());
        let sample_text = cpt
            .custom
            .get(SAMPLE_TEXT_KEY)
            .cloned()
            .unwrap_or_else(|| DEFAULT_SAMPLE_TEXT.to_string());

        // One face drives icon and banners; additional files still
        // contribute their name and languages.
        let guard = FONT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut selected: Option<(Box<dyn FontFace>, String)> = None;
        for (path, data) in &collected.files {
            match self.renderer.load(data) {
                Ok(face) => {
                    let full_name = format!("{} {}", face.family(), face.style());
                    if !cpt.provided.fonts.contains(&full_name) {
                        cpt.provided.fonts.push(full_name);
                    }
                    for locale in face.languages() {
                        cpt.languages.entry(locale).or_insert(100);
                    }
                    if selected.is_none() {
                        selected = Some((face, path.clone()));
                    }
                }
                Err(e) => {
                    hints.push(Hint::new(
                        "font-load-error",
                        hint_vars! { "fname" => path, "error" => e },
                    ));
                }
            }
        }
        let Some((face, face_path)) = selected else {
            return hints;
        };

        for entry in &self.policy {
            let pixels = entry.pixels();
            let png = match face.render_sample(&icon_text, pixels, pixels) {
                Ok(png) => png,
                Err(e) => {
                    hints.push(Hint::new(
                        "font-load-error",
                        hint_vars! { "fname" => face_path, "error" => e },
                    ));
                    continue;
                }
            };
            let filename = format!(
                "{}_{}",
                cpt.pkgname,
                with_png_extension(path_basename(&face_path))
            );
            let dest = self
                .media_dir
                .join(gcid)
                .join("icons")
                .join(entry.dir_name())
                .join(&filename);
            if let Err(e) = write_atomic(&dest, &png) {
                hints.push(Hint::new(
                    "font-load-error",
                    hint_vars! { "fname" => face_path, "error" => e },
                ));
                continue;
            }
            let icon = Icon::Cached {
                name: filename,
                width: entry.size,
                height: entry.size,
                scale: entry.scale,
            };
            if !cpt.icons.contains(&icon) {
                cpt.icons.push(icon);
            }
        }

        let mut banner_images = Vec::new();
        for (width, height) in BANNER_SIZES {
            let png = match face.render_sample(&sample_text, *width, *height) {
                Ok(png) => png,
                Err(e) => {
                    debug!("Could not render font banner for '{}': {}", cpt.cid, e);
                    continue;
                }
            };
            let filename = format!("font-specimen_{}x{}.png", width, height);
            let dest = self
                .media_dir
                .join(gcid)
                .join("screenshots")
                .join(&filename);
            if write_atomic(&dest, &png).is_err() {
                continue;
            }
            banner_images.push(Image {
                kind: if banner_images.is_empty() {
                    ImageKind::Source
                } else {
                    ImageKind::Thumbnail
                },
                url: format!(
                    "{}/{}/screenshots/{}",
                    self.media_base_url.as_str().trim_end_matches('/'),
                    gcid,
                    filename
                ),
                width: Some(*width),
                height: Some(*height),
            });
        }
        drop(guard);

        if !banner_images.is_empty() && cpt.screenshots.is_empty() {
            cpt.screenshots.push(Screenshot {
                default: true,
                captions: Default::default(),
                images: banner_images,
                videos: Vec::new(),
            });
        }
        hints
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::icons::test_support::MemPackage;

    struct StubFace {
        family: String,
    }

    impl FontFace for StubFace {
        fn family(&self) -> &str {
            &self.family
        }

        fn style(&self) -> &str {
            "Regular"
        }

        fn languages(&self) -> Vec<String> {
            vec!["en".to_string(), "de".to_string()]
        }

        fn render_sample(
            &self,
            text: &str,
            width: u32,
            height: u32,
        ) -> Result<Vec<u8>, FontError> {
            Ok(format!("{}:{}x{}", text, width, height).into_bytes())
        }
    }

    struct StubRenderer;

    impl FontRenderer for StubRenderer {
        fn load(&self, data: &[u8]) -> Result<Box<dyn FontFace>, FontError> {
            let name = String::from_utf8_lossy(data).to_string();
            if name == "broken" {
                return Err(FontError::Load {
                    message: "bad font".to_string(),
                });
            }
            Ok(Box::new(StubFace { family: name }))
        }
    }

    fn font_component() -> Component {
        let mut cpt = Component::new(ComponentKind::Font, "org.example.sans");
        cpt.pkgname = "fonts-example".to_string();
        cpt
    }

    fn policy() -> Vec<IconPolicyEntry> {
        vec![IconPolicyEntry {
            size: 64,
            scale: 1,
            store_cached: true,
            store_remote: false,
        }]
    }

    #[test]
    fn non_font_components_are_ignored() {
        let cpt = Component::new(ComponentKind::DesktopApp, "org.example.app");
        let pkg = MemPackage::new("foo", &[]);
        let (collected, hints) = collect(&cpt, &pkg, &[]);
        assert!(collected.is_none());
        assert!(hints.is_empty());
    }

    #[test]
    fn font_component_without_files_is_an_error() {
        let cpt = font_component();
        let pkg = MemPackage::new("fonts-example", &[]);
        let (collected, hints) = collect(&cpt, &pkg, &[]);
        assert!(collected.is_none());
        assert_eq!(hints[0].tag, "font-metainfo-but-no-font");
        assert!(hints[0].is_error());
    }

    #[test]
    fn provided_names_narrow_the_selection() {
        let files: &[(&str, &[u8])] = &[
            ("/usr/share/fonts/truetype/example/ExampleSans.ttf", b"Example Sans"),
            ("/usr/share/fonts/truetype/example/Other.ttf", b"Other"),
        ];
        let pkg = MemPackage::new("fonts-example", files);
        let contents: Vec<String> = files.iter().map(|(p, _)| p.to_string()).collect();
        let mut cpt = font_component();
        cpt.provided.fonts.push("ExampleSans".to_string());
        let (collected, hints) = collect(&cpt, &pkg, &contents);
        assert!(hints.is_empty());
        let collected = collected.unwrap();
        assert_eq!(collected.files.len(), 1);
        assert!(collected.files[0].0.ends_with("ExampleSans.ttf"));
    }

    #[test]
    fn render_attaches_icons_languages_and_banners() {
        let media = tempfile::tempdir().unwrap();
        let handler = FontHandler::new(
            &StubRenderer,
            &policy(),
            media.path().to_path_buf(),
            Url::parse("https://media.example.org").unwrap(),
        );
        let mut cpt = font_component();
        let collected = CollectedFonts {
            files: vec![(
                "/usr/share/fonts/truetype/example/ExampleSans.ttf".to_string(),
                b"Example Sans".to_vec(),
            )],
        };
        let hints = handler.render(&mut cpt, "org/example/sans/AA", &collected);
        assert!(hints.is_empty());
        assert!(cpt.has_cached_icon(64, 1));
        assert_eq!(cpt.languages.get("de"), Some(&100));
        assert!(cpt
            .provided
            .fonts
            .contains(&"Example Sans Regular".to_string()));
        assert_eq!(cpt.screenshots.len(), 1);
        assert_eq!(cpt.screenshots[0].images.len(), 2);
        assert!(media
            .path()
            .join("org/example/sans/AA/icons/64x64/fonts-example_ExampleSans.png")
            .is_file());
        assert!(media
            .path()
            .join("org/example/sans/AA/screenshots/font-specimen_1024x78.png")
            .is_file());
    }

    #[test]
    fn broken_faces_are_reported_but_not_fatal() {
        let media = tempfile::tempdir().unwrap();
        let handler = FontHandler::new(
            &StubRenderer,
            &policy(),
            media.path().to_path_buf(),
            Url::parse("https://media.example.org").unwrap(),
        );
        let mut cpt = font_component();
        let collected = CollectedFonts {
            files: vec![
                ("/usr/share/fonts/a/broken.ttf".to_string(), b"broken".to_vec()),
                ("/usr/share/fonts/a/good.ttf".to_string(), b"Good".to_vec()),
            ],
        };
        let hints = handler.render(&mut cpt, "org/example/sans/AA", &collected);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].tag, "font-load-error");
        assert!(cpt.has_cached_icon(64, 1));
    }
}
