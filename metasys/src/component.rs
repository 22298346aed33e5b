/*!
The AppStream component model.

A [`Component`] is created by the metadata parsers, mutated by the icon,
locale, font and screenshot handlers, and finally serialized once into the
catalog format(s) the store keeps per global component ID. Localized fields
are maps keyed by locale, with the unlocalized value under `"C"`. All maps
are ordered so that serialization is deterministic.
*/

use crate::common::escape_xml;
use serde_yaml::value::Value as Yaml;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The locale key carrying the untranslated value.
pub const C_LOCALE: &str = "C";

/// Localized string values, keyed by locale.
pub type TranslatedString = BTreeMap<String, String>;

/// Localized string-list values, keyed by locale.
pub type TranslatedList = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ComponentKind {
    Generic,
    DesktopApp,
    ConsoleApp,
    WebApp,
    Service,
    Addon,
    Font,
    Codec,
    InputMethod,
    Firmware,
    Driver,
    Localization,
    Runtime,
    Unknown,
}

impl ComponentKind {
    /// GUI applications must end up with a usable icon; other kinds need not.
    pub fn is_gui_app(&self) -> bool {
        matches!(self, ComponentKind::DesktopApp | ComponentKind::WebApp)
    }
}

impl FromStr for ComponentKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "generic" => ComponentKind::Generic,
            "desktop" | "desktop-app" | "desktop-application" => ComponentKind::DesktopApp,
            "console-application" => ComponentKind::ConsoleApp,
            "web-application" => ComponentKind::WebApp,
            "service" => ComponentKind::Service,
            "addon" => ComponentKind::Addon,
            "font" => ComponentKind::Font,
            "codec" => ComponentKind::Codec,
            "inputmethod" | "input-method" => ComponentKind::InputMethod,
            "firmware" => ComponentKind::Firmware,
            "driver" => ComponentKind::Driver,
            "localization" => ComponentKind::Localization,
            "runtime" => ComponentKind::Runtime,
            _ => ComponentKind::Unknown,
        })
    }
}

impl Display for ComponentKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ComponentKind::Generic => "generic",
            ComponentKind::DesktopApp => "desktop-application",
            ComponentKind::ConsoleApp => "console-application",
            ComponentKind::WebApp => "web-application",
            ComponentKind::Service => "service",
            ComponentKind::Addon => "addon",
            ComponentKind::Font => "font",
            ComponentKind::Codec => "codec",
            ComponentKind::InputMethod => "inputmethod",
            ComponentKind::Firmware => "firmware",
            ComponentKind::Driver => "driver",
            ComponentKind::Localization => "localization",
            ComponentKind::Runtime => "runtime",
            ComponentKind::Unknown => "unknown",
        })
    }
}

/// An icon attached to a component. `Cached` entries name a PNG in the
/// per-component media directory; `Remote` entries point below the media
/// base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Icon {
    Stock {
        name: String,
    },
    Cached {
        name: String,
        width: u32,
        height: u32,
        scale: u32,
    },
    Local {
        path: String,
    },
    Remote {
        url: String,
        width: u32,
        height: u32,
        scale: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKind {
    Source,
    Thumbnail,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    pub kind: ImageKind,
    pub url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Video {
    pub url: String,
    pub container: Option<String>,
    pub codec: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Screenshot {
    pub default: bool,
    pub captions: TranslatedString,
    pub images: Vec<Image>,
    pub videos: Vec<Video>,
}

impl Screenshot {
    pub fn source_image(&self) -> Option<&Image> {
        self.images.iter().find(|i| i.kind == ImageKind::Source)
    }
}

/// Public interfaces a component provides, grouped the way the catalog
/// formats group them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvidedItems {
    pub mimetypes: Vec<String>,
    pub binaries: Vec<String>,
    pub libraries: Vec<String>,
    pub fonts: Vec<String>,
    pub dbus_services: Vec<String>,
    pub firmware: Vec<String>,
    pub modaliases: Vec<String>,
    pub python: Vec<String>,
}

impl ProvidedItems {
    pub fn is_empty(&self) -> bool {
        self.mimetypes.is_empty()
            && self.binaries.is_empty()
            && self.libraries.is_empty()
            && self.fonts.is_empty()
            && self.dbus_services.is_empty()
            && self.firmware.is_empty()
            && self.modaliases.is_empty()
            && self.python.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: String,
    pub timestamp: Option<i64>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub kind: String,
    pub name: String,
}

/// One software component as it travels through the generator.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Component {
    pub kind: Option<ComponentKind>,
    pub cid: String,
    pub pkgname: String,

    pub name: TranslatedString,
    pub summary: TranslatedString,
    /// Description markup (paragraphs and lists), raw XML per locale.
    pub description: TranslatedString,
    pub developer_name: TranslatedString,

    pub project_license: Option<String>,
    pub metadata_license: Option<String>,

    pub categories: Vec<String>,
    pub keywords: TranslatedList,
    pub urls: BTreeMap<String, String>,
    pub icons: Vec<Icon>,
    pub provided: ProvidedItems,
    /// Locale -> translation completion percentage.
    pub languages: BTreeMap<String, u32>,
    pub screenshots: Vec<Screenshot>,
    /// Launchable kind (e.g. `desktop-id`) -> entries.
    pub launchables: BTreeMap<String, Vec<String>>,
    pub extends: Vec<String>,
    pub compulsory_for_desktops: Vec<String>,
    pub translations: Vec<Translation>,
    pub releases: Vec<Release>,
    pub custom: BTreeMap<String, String>,
}

impl Component {
    pub fn new(kind: ComponentKind, cid: &str) -> Self {
        Self {
            kind: Some(kind),
            cid: cid.to_string(),
            ..Default::default()
        }
    }

    pub fn kind(&self) -> ComponentKind {
        self.kind.unwrap_or(ComponentKind::Unknown)
    }

    /// The untranslated name, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.get(C_LOCALE).map(String::as_str)
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.get(C_LOCALE).map(String::as_str)
    }

    /// The first stock icon name, which is what icon resolution starts from.
    pub fn stock_icon(&self) -> Option<&str> {
        self.icons.iter().find_map(|i| match i {
            Icon::Stock { name } => Some(name.as_str()),
            _ => None,
        })
    }

    /// The first local icon path (metainfo `<icon type="local">`).
    pub fn local_icon(&self) -> Option<&str> {
        self.icons.iter().find_map(|i| match i {
            Icon::Local { path } => Some(path.as_str()),
            _ => None,
        })
    }

    pub fn has_cached_icon(&self, size: u32, scale: u32) -> bool {
        self.icons.iter().any(|i| {
            matches!(i, Icon::Cached { width, height, scale: s, .. }
                if *width == size && *height == size && *s == scale)
        })
    }

    pub fn add_category(&mut self, category: &str) {
        if !self.categories.iter().any(|c| c == category) {
            self.categories.push(category.to_string());
        }
    }

    pub fn add_language(&mut self, locale: &str, percentage: u32) {
        self.languages.insert(locale.to_string(), percentage);
    }

    pub fn add_launchable(&mut self, kind: &str, value: &str) {
        let entries = self.launchables.entry(kind.to_string()).or_default();
        if !entries.iter().any(|e| e == value) {
            entries.push(value.to_string());
        }
    }

    /// Serialize as a single catalog XML `<component>` element, indented for
    /// inclusion under a `<components>` root.
    pub fn to_xml(&self) -> String {
        let mut w = XmlWriter::new();
        let kind = self.kind().to_string();
        if let Some(ComponentKind::Unknown) | None = self.kind {
            w.open("component", &[]);
        } else {
            w.open("component", &[("type", &kind)]);
        }
        w.text_element("id", &self.cid, &[]);
        if !self.pkgname.is_empty() {
            w.text_element("pkgname", &self.pkgname, &[]);
        }
        w.localized(&self.name, "name");
        w.localized(&self.summary, "summary");
        if let Some(license) = &self.project_license {
            w.text_element("project_license", license, &[]);
        }
        if let Some(developer) = self.developer_name.get(C_LOCALE) {
            w.text_element("developer_name", developer, &[]);
        }
        // Description content is markup already; emit it raw, one block per
        // locale.
        for (locale, markup) in &self.description {
            if locale == C_LOCALE {
                w.raw_element("description", markup, &[]);
            } else {
                w.raw_element("description", markup, &[("xml:lang", locale)]);
            }
        }
        for icon in &self.icons {
            match icon {
                Icon::Stock { name } => w.text_element("icon", name, &[("type", "stock")]),
                Icon::Cached {
                    name,
                    width,
                    height,
                    scale,
                } => {
                    let mut attrs = vec![
                        ("type".to_string(), "cached".to_string()),
                        ("width".to_string(), width.to_string()),
                        ("height".to_string(), height.to_string()),
                    ];
                    if *scale > 1 {
                        attrs.push(("scale".to_string(), scale.to_string()));
                    }
                    w.text_element_owned("icon", name, &attrs);
                }
                Icon::Local { path } => w.text_element("icon", path, &[("type", "local")]),
                Icon::Remote {
                    url,
                    width,
                    height,
                    scale,
                } => {
                    let mut attrs = vec![
                        ("type".to_string(), "remote".to_string()),
                        ("width".to_string(), width.to_string()),
                        ("height".to_string(), height.to_string()),
                    ];
                    if *scale > 1 {
                        attrs.push(("scale".to_string(), scale.to_string()));
                    }
                    w.text_element_owned("icon", url, &attrs);
                }
            }
        }
        if !self.categories.is_empty() {
            w.open("categories", &[]);
            for c in &self.categories {
                w.text_element("category", c, &[]);
            }
            w.close("categories");
        }
        for (locale, words) in &self.keywords {
            let attrs: &[(&str, &str)] = if locale == C_LOCALE {
                &[]
            } else {
                &[("xml:lang", locale)]
            };
            w.open("keywords", attrs);
            for word in words {
                w.text_element("keyword", word, &[]);
            }
            w.close("keywords");
        }
        for (kind, url) in &self.urls {
            w.text_element("url", url, &[("type", kind)]);
        }
        for (kind, entries) in &self.launchables {
            for entry in entries {
                w.text_element("launchable", entry, &[("type", kind)]);
            }
        }
        if !self.provided.is_empty() {
            w.open("provides", &[]);
            for b in &self.provided.binaries {
                w.text_element("binary", b, &[]);
            }
            for l in &self.provided.libraries {
                w.text_element("library", l, &[]);
            }
            for m in &self.provided.mimetypes {
                w.text_element("mediatype", m, &[]);
            }
            for f in &self.provided.fonts {
                w.text_element("font", f, &[]);
            }
            for d in &self.provided.dbus_services {
                w.text_element("dbus", d, &[("type", "system")]);
            }
            for f in &self.provided.firmware {
                w.text_element("firmware", f, &[("type", "runtime")]);
            }
            for m in &self.provided.modaliases {
                w.text_element("modalias", m, &[]);
            }
            for p in &self.provided.python {
                w.text_element("python3", p, &[]);
            }
            w.close("provides");
        }
        for desktop in &self.compulsory_for_desktops {
            w.text_element("compulsory_for_desktop", desktop, &[]);
        }
        for extends in &self.extends {
            w.text_element("extends", extends, &[]);
        }
        for translation in &self.translations {
            w.text_element("translation", &translation.name, &[("type", &translation.kind)]);
        }
        if !self.languages.is_empty() {
            w.open("languages", &[]);
            for (locale, percentage) in &self.languages {
                w.text_element_owned(
                    "lang",
                    locale,
                    &[("percentage".to_string(), percentage.to_string())],
                );
            }
            w.close("languages");
        }
        if !self.screenshots.is_empty() {
            w.open("screenshots", &[]);
            for shot in &self.screenshots {
                let attrs: &[(&str, &str)] = if shot.default {
                    &[("type", "default")]
                } else {
                    &[]
                };
                w.open("screenshot", attrs);
                for (locale, caption) in &shot.captions {
                    if locale == C_LOCALE {
                        w.text_element("caption", caption, &[]);
                    } else {
                        w.text_element("caption", caption, &[("xml:lang", locale)]);
                    }
                }
                for image in &shot.images {
                    let kind = match image.kind {
                        ImageKind::Source => "source",
                        ImageKind::Thumbnail => "thumbnail",
                    };
                    let mut attrs = vec![("type".to_string(), kind.to_string())];
                    if let Some(width) = image.width {
                        attrs.push(("width".to_string(), width.to_string()));
                    }
                    if let Some(height) = image.height {
                        attrs.push(("height".to_string(), height.to_string()));
                    }
                    w.text_element_owned("image", &image.url, &attrs);
                }
                for video in &shot.videos {
                    let mut attrs = Vec::new();
                    if let Some(container) = &video.container {
                        attrs.push(("container".to_string(), container.clone()));
                    }
                    if let Some(codec) = &video.codec {
                        attrs.push(("codec".to_string(), codec.clone()));
                    }
                    w.text_element_owned("video", &video.url, &attrs);
                }
                w.close("screenshot");
            }
            w.close("screenshots");
        }
        if !self.releases.is_empty() {
            w.open("releases", &[]);
            for release in &self.releases {
                let mut attrs = vec![("version".to_string(), release.version.clone())];
                if let Some(ts) = release.timestamp {
                    attrs.push(("timestamp".to_string(), ts.to_string()));
                } else if let Some(date) = &release.date {
                    attrs.push(("date".to_string(), date.clone()));
                }
                w.empty_element_owned("release", &attrs);
            }
            w.close("releases");
        }
        if !self.custom.is_empty() {
            w.open("custom", &[]);
            for (key, value) in &self.custom {
                w.text_element("value", value, &[("key", key)]);
            }
            w.close("custom");
        }
        w.close("component");
        w.finish()
    }

    /// Serialize as one DEP-11 YAML document (without the `---` marker).
    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        let mut doc = serde_yaml::Mapping::new();
        let mut put = |key: &str, value: Yaml| {
            doc.insert(Yaml::String(key.to_string()), value);
        };

        put("Type", Yaml::String(self.kind().to_string()));
        put("ID", Yaml::String(self.cid.clone()));
        if !self.pkgname.is_empty() {
            put("Package", Yaml::String(self.pkgname.clone()));
        }
        if !self.name.is_empty() {
            put("Name", translated_yaml(&self.name));
        }
        if !self.summary.is_empty() {
            put("Summary", translated_yaml(&self.summary));
        }
        if !self.description.is_empty() {
            put("Description", translated_yaml(&self.description));
        }
        if let Some(developer) = self.developer_name.get(C_LOCALE) {
            put("DeveloperName", Yaml::String(developer.clone()));
        }
        if let Some(license) = &self.project_license {
            put("ProjectLicense", Yaml::String(license.clone()));
        }
        if !self.categories.is_empty() {
            put("Categories", string_seq(&self.categories));
        }
        if !self.keywords.is_empty() {
            let mut map = serde_yaml::Mapping::new();
            for (locale, words) in &self.keywords {
                map.insert(Yaml::String(locale.clone()), string_seq(words));
            }
            put("Keywords", Yaml::Mapping(map));
        }
        if !self.urls.is_empty() {
            let mut map = serde_yaml::Mapping::new();
            for (kind, url) in &self.urls {
                map.insert(Yaml::String(kind.clone()), Yaml::String(url.clone()));
            }
            put("Url", Yaml::Mapping(map));
        }
        if !self.launchables.is_empty() {
            let mut map = serde_yaml::Mapping::new();
            for (kind, entries) in &self.launchables {
                map.insert(Yaml::String(kind.clone()), string_seq(entries));
            }
            put("Launchable", Yaml::Mapping(map));
        }
        if !self.icons.is_empty() {
            let mut icon_map = serde_yaml::Mapping::new();
            let mut cached = Vec::new();
            let mut remote = Vec::new();
            for icon in &self.icons {
                match icon {
                    Icon::Stock { name } => {
                        icon_map.insert(
                            Yaml::String("stock".to_string()),
                            Yaml::String(name.clone()),
                        );
                    }
                    Icon::Cached {
                        name,
                        width,
                        height,
                        scale,
                    } => cached.push(icon_entry_yaml("name", name, *width, *height, *scale)),
                    Icon::Remote {
                        url,
                        width,
                        height,
                        scale,
                    } => remote.push(icon_entry_yaml("url", url, *width, *height, *scale)),
                    Icon::Local { .. } => {}
                }
            }
            if !cached.is_empty() {
                icon_map.insert(Yaml::String("cached".to_string()), Yaml::Sequence(cached));
            }
            if !remote.is_empty() {
                icon_map.insert(Yaml::String("remote".to_string()), Yaml::Sequence(remote));
            }
            if !icon_map.is_empty() {
                put("Icon", Yaml::Mapping(icon_map));
            }
        }
        if !self.provided.is_empty() {
            let mut map = serde_yaml::Mapping::new();
            let mut add = |key: &str, values: &[String]| {
                if !values.is_empty() {
                    map.insert(Yaml::String(key.to_string()), string_seq(values));
                }
            };
            add("mediatypes", &self.provided.mimetypes);
            add("binaries", &self.provided.binaries);
            add("libraries", &self.provided.libraries);
            add("fonts", &self.provided.fonts);
            add("dbus", &self.provided.dbus_services);
            add("firmware", &self.provided.firmware);
            add("modaliases", &self.provided.modaliases);
            add("python3", &self.provided.python);
            put("Provides", Yaml::Mapping(map));
        }
        if !self.compulsory_for_desktops.is_empty() {
            put(
                "CompulsoryForDesktops",
                string_seq(&self.compulsory_for_desktops),
            );
        }
        if !self.extends.is_empty() {
            put("Extends", string_seq(&self.extends));
        }
        if !self.languages.is_empty() {
            let mut seq = Vec::new();
            for (locale, percentage) in &self.languages {
                let mut entry = serde_yaml::Mapping::new();
                entry.insert(
                    Yaml::String("locale".to_string()),
                    Yaml::String(locale.clone()),
                );
                entry.insert(
                    Yaml::String("percentage".to_string()),
                    Yaml::Number((*percentage).into()),
                );
                seq.push(Yaml::Mapping(entry));
            }
            put("Languages", Yaml::Sequence(seq));
        }
        if !self.screenshots.is_empty() {
            let mut seq = Vec::new();
            for shot in &self.screenshots {
                let mut entry = serde_yaml::Mapping::new();
                if shot.default {
                    entry.insert(Yaml::String("default".to_string()), Yaml::Bool(true));
                }
                if !shot.captions.is_empty() {
                    entry.insert(
                        Yaml::String("caption".to_string()),
                        translated_yaml(&shot.captions),
                    );
                }
                if let Some(source) = shot.source_image() {
                    entry.insert(
                        Yaml::String("source-image".to_string()),
                        image_yaml(source),
                    );
                }
                let thumbs: Vec<Yaml> = shot
                    .images
                    .iter()
                    .filter(|i| i.kind == ImageKind::Thumbnail)
                    .map(image_yaml)
                    .collect();
                if !thumbs.is_empty() {
                    entry.insert(Yaml::String("thumbnails".to_string()), Yaml::Sequence(thumbs));
                }
                if !shot.videos.is_empty() {
                    let videos: Vec<Yaml> = shot
                        .videos
                        .iter()
                        .map(|v| {
                            let mut video = serde_yaml::Mapping::new();
                            if let Some(container) = &v.container {
                                video.insert(
                                    Yaml::String("container".to_string()),
                                    Yaml::String(container.clone()),
                                );
                            }
                            if let Some(codec) = &v.codec {
                                video.insert(
                                    Yaml::String("codec".to_string()),
                                    Yaml::String(codec.clone()),
                                );
                            }
                            video.insert(
                                Yaml::String("url".to_string()),
                                Yaml::String(v.url.clone()),
                            );
                            Yaml::Mapping(video)
                        })
                        .collect();
                    entry.insert(Yaml::String("videos".to_string()), Yaml::Sequence(videos));
                }
                seq.push(Yaml::Mapping(entry));
            }
            put("Screenshots", Yaml::Sequence(seq));
        }
        if !self.releases.is_empty() {
            let mut seq = Vec::new();
            for release in &self.releases {
                let mut entry = serde_yaml::Mapping::new();
                entry.insert(
                    Yaml::String("version".to_string()),
                    Yaml::String(release.version.clone()),
                );
                if let Some(ts) = release.timestamp {
                    entry.insert(
                        Yaml::String("unix-timestamp".to_string()),
                        Yaml::Number(ts.into()),
                    );
                } else if let Some(date) = &release.date {
                    entry.insert(Yaml::String("date".to_string()), Yaml::String(date.clone()));
                }
                seq.push(Yaml::Mapping(entry));
            }
            put("Releases", Yaml::Sequence(seq));
        }
        if !self.custom.is_empty() {
            let mut map = serde_yaml::Mapping::new();
            for (key, value) in &self.custom {
                map.insert(Yaml::String(key.clone()), Yaml::String(value.clone()));
            }
            put("Custom", Yaml::Mapping(map));
        }

        serde_yaml::to_string(&Yaml::Mapping(doc))
    }
}

fn translated_yaml(map: &TranslatedString) -> Yaml {
    let mut out = serde_yaml::Mapping::new();
    for (locale, value) in map {
        out.insert(Yaml::String(locale.clone()), Yaml::String(value.clone()));
    }
    Yaml::Mapping(out)
}

fn string_seq(values: &[String]) -> Yaml {
    Yaml::Sequence(values.iter().map(|v| Yaml::String(v.clone())).collect())
}

fn icon_entry_yaml(url_key: &str, value: &str, width: u32, height: u32, scale: u32) -> Yaml {
    let mut entry = serde_yaml::Mapping::new();
    entry.insert(
        Yaml::String(url_key.to_string()),
        Yaml::String(value.to_string()),
    );
    entry.insert(Yaml::String("width".to_string()), Yaml::Number(width.into()));
    entry.insert(
        Yaml::String("height".to_string()),
        Yaml::Number(height.into()),
    );
    if scale > 1 {
        entry.insert(Yaml::String("scale".to_string()), Yaml::Number(scale.into()));
    }
    Yaml::Mapping(entry)
}

fn image_yaml(image: &Image) -> Yaml {
    let mut entry = serde_yaml::Mapping::new();
    entry.insert(
        Yaml::String("url".to_string()),
        Yaml::String(image.url.clone()),
    );
    if let Some(width) = image.width {
        entry.insert(Yaml::String("width".to_string()), Yaml::Number(width.into()));
    }
    if let Some(height) = image.height {
        entry.insert(
            Yaml::String("height".to_string()),
            Yaml::Number(height.into()),
        );
    }
    Yaml::Mapping(entry)
}

/// Minimal indenting XML writer for catalog documents. Component documents
/// start at one indent level so they slot under a `<components>` root.
struct XmlWriter {
    out: String,
    depth: usize,
}

impl XmlWriter {
    fn new() -> Self {
        Self {
            out: String::new(),
            depth: 1,
        }
    }

    fn indent(&mut self) {
        for _ in 0..self.depth {
            self.out.push_str("  ");
        }
    }

    fn attrs_str(attrs: &[(&str, &str)]) -> String {
        attrs
            .iter()
            .map(|(k, v)| format!(" {}=\"{}\"", k, escape_xml(v)))
            .collect()
    }

    fn open(&mut self, tag: &str, attrs: &[(&str, &str)]) {
        self.indent();
        self.out
            .push_str(&format!("<{}{}>\n", tag, Self::attrs_str(attrs)));
        self.depth += 1;
    }

    fn close(&mut self, tag: &str) {
        self.depth -= 1;
        self.indent();
        self.out.push_str(&format!("</{}>\n", tag));
    }

    /// One element per locale, `xml:lang` on everything but `"C"`.
    fn localized(&mut self, map: &TranslatedString, tag: &str) {
        for (locale, value) in map {
            if locale == C_LOCALE {
                self.text_element(tag, value, &[]);
            } else {
                self.text_element(tag, value, &[("xml:lang", locale)]);
            }
        }
    }

    fn text_element(&mut self, tag: &str, text: &str, attrs: &[(&str, &str)]) {
        self.indent();
        self.out.push_str(&format!(
            "<{tag}{}>{}</{tag}>\n",
            Self::attrs_str(attrs),
            escape_xml(text),
        ));
    }

    fn text_element_owned(&mut self, tag: &str, text: &str, attrs: &[(String, String)]) {
        let borrowed: Vec<(&str, &str)> = attrs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.text_element(tag, text, &borrowed);
    }

    fn empty_element_owned(&mut self, tag: &str, attrs: &[(String, String)]) {
        let borrowed: Vec<(&str, &str)> = attrs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        self.indent();
        self.out
            .push_str(&format!("<{}{}/>\n", tag, Self::attrs_str(&borrowed)));
    }

    /// Element whose content is already XML markup.
    fn raw_element(&mut self, tag: &str, raw: &str, attrs: &[(&str, &str)]) {
        self.indent();
        self.out
            .push_str(&format!("<{}{}>", tag, Self::attrs_str(attrs)));
        self.out.push_str(raw);
        self.out.push_str(&format!("</{}>\n", tag));
    }

    fn finish(self) -> String {
        self.out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreemap;

    fn sample_component() -> Component {
        let mut cpt = Component::new(ComponentKind::DesktopApp, "org.example.foobar");
        cpt.pkgname = "foobar".to_string();
        cpt.name = btreemap! {
            C_LOCALE.to_string() => "FooBar".to_string(),
            "de".to_string() => "FuuBar".to_string(),
        };
        cpt.summary
            .insert(C_LOCALE.to_string(), "An example & test".to_string());
        cpt.add_category("Utility");
        cpt.icons.push(Icon::Stock {
            name: "foobar".to_string(),
        });
        cpt.icons.push(Icon::Cached {
            name: "foobar_foobar.png".to_string(),
            width: 64,
            height: 64,
            scale: 1,
        });
        cpt.add_language("de", 96);
        cpt
    }

    #[test]
    fn kind_strings_round_trip() {
        for kind in [
            ComponentKind::Generic,
            ComponentKind::DesktopApp,
            ComponentKind::ConsoleApp,
            ComponentKind::Font,
            ComponentKind::InputMethod,
        ] {
            assert_eq!(kind.to_string().parse::<ComponentKind>().unwrap(), kind);
        }
        assert_eq!(
            "desktop".parse::<ComponentKind>().unwrap(),
            ComponentKind::DesktopApp
        );
        assert_eq!(
            "bogus".parse::<ComponentKind>().unwrap(),
            ComponentKind::Unknown
        );
    }

    #[test]
    fn xml_carries_localized_fields_and_escapes() {
        let xml = sample_component().to_xml();
        assert!(xml.contains("<component type=\"desktop-application\">"));
        assert!(xml.contains("<id>org.example.foobar</id>"));
        assert!(xml.contains("<name>FooBar</name>"));
        assert!(xml.contains("<name xml:lang=\"de\">FuuBar</name>"));
        assert!(xml.contains("<summary>An example &amp; test</summary>"));
        assert!(xml.contains("<icon type=\"cached\" width=\"64\" height=\"64\">foobar_foobar.png</icon>"));
        assert!(xml.contains("<lang percentage=\"96\">de</lang>"));
    }

    #[test]
    fn yaml_uses_dep11_keys() {
        let yaml = sample_component().to_yaml().unwrap();
        assert!(yaml.contains("Type: desktop-application"));
        assert!(yaml.contains("ID: org.example.foobar"));
        assert!(yaml.contains("Package: foobar"));
        assert!(yaml.contains("C: FooBar"));
        assert!(yaml.contains("de: FuuBar"));
        assert!(yaml.contains("cached:"));
        assert!(yaml.contains("stock: foobar"));
    }

    #[test]
    fn serialization_is_deterministic() {
        let cpt = sample_component();
        assert_eq!(cpt.to_xml(), cpt.clone().to_xml());
        assert_eq!(cpt.to_yaml().unwrap(), cpt.clone().to_yaml().unwrap());
    }

    #[test]
    fn stock_icon_lookup() {
        let cpt = sample_component();
        assert_eq!(cpt.stock_icon(), Some("foobar"));
        assert!(cpt.has_cached_icon(64, 1));
        assert!(!cpt.has_cached_icon(128, 1));
    }

    #[test]
    fn description_markup_is_not_escaped() {
        let mut cpt = sample_component();
        cpt.description.insert(
            C_LOCALE.to_string(),
            "<p>Hello</p><ul><li>one</li></ul>".to_string(),
        );
        let xml = cpt.to_xml();
        assert!(xml.contains("<description><p>Hello</p><ul><li>one</li></ul></description>"));
    }
}
