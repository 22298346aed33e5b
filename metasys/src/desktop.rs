/*!
Desktop-entry handling.

Desktop files are key-files in the freedesktop.org syntax, which the XDG
icon-theme index shares, so the [`KeyFile`] parser here serves both. On top
of it sit the rules that turn a desktop entry into a component of its own or
merge it into a component parsed from metainfo: metainfo fields always win,
the desktop entry fills gaps.
*/

use crate::component::{Component, ComponentKind, Icon, C_LOCALE};
use crate::result::is_reverse_dns;
use lazy_static::lazy_static;
use regex::Regex;
use snafu::ensure;

type Result<T> = std::result::Result<T, error::Error>;

const DESKTOP_GROUP: &str = "Desktop Entry";

/// Desktop categories that carry no information for a software catalog.
const CATEGORY_BLACKLIST: &[&str] = &["GTK", "Qt", "GNOME", "KDE", "GUI", "Application"];

lazy_static! {
    /// `language[_TERRITORY][.ENCODING][@MODIFIER]`
    static ref LOCALE_RE: Regex =
        Regex::new(r"^([A-Za-z]+(?:_[A-Za-z]+)?)(\.[A-Za-z0-9\-]+)?(@[A-Za-z]+)?$").unwrap();
}

/// A parsed freedesktop.org key-file.
#[derive(Debug, Clone, Default)]
pub struct KeyFile {
    groups: Vec<(String, Vec<(String, String)>)>,
}

impl KeyFile {
    pub fn parse(data: &str) -> Result<Self> {
        let mut groups: Vec<(String, Vec<(String, String)>)> = Vec::new();
        for (lineno, raw_line) in data.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('[') {
                ensure!(
                    line.ends_with(']'),
                    error::MalformedGroupSnafu { line: lineno + 1 }
                );
                groups.push((line[1..line.len() - 1].to_string(), Vec::new()));
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return error::MalformedLineSnafu { line: lineno + 1 }.fail();
            };
            let Some(group) = groups.last_mut() else {
                return error::EntryOutsideGroupSnafu { line: lineno + 1 }.fail();
            };
            group
                .1
                .push((key.trim().to_string(), unescape(value.trim())));
        }
        Ok(Self { groups })
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.iter().any(|(g, _)| g == name)
    }

    pub fn group_names(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(g, _)| g.as_str())
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|(g, _)| g == group)
            .and_then(|(_, entries)| {
                entries
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
            })
    }

    pub fn entries<'a>(&'a self, group: &'a str) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        self.groups
            .iter()
            .filter(move |(g, _)| g == group)
            .flat_map(|(_, entries)| entries.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }
}

/// Resolve the desktop-entry escape sequences.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('s') => out.push(' '),
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Split a `Key[locale]` desktop key into key and raw locale.
fn split_locale_key(raw: &str) -> (&str, Option<&str>) {
    match raw.find('[') {
        Some(start) if raw.ends_with(']') => (&raw[..start], Some(&raw[start + 1..raw.len() - 1])),
        _ => (raw, None),
    }
}

/// Validate and canonicalize a locale key. Test locales are rejected,
/// encoding suffixes (`.UTF-8`, `.ISO-8859-1`) are dropped, modifiers stay.
pub fn sanitize_locale(locale: &str) -> Option<String> {
    let caps = LOCALE_RE.captures(locale)?;
    let base = caps.get(1).map(|m| m.as_str())?;
    if base.eq_ignore_ascii_case("x-test") || base.eq_ignore_ascii_case("xx") {
        return None;
    }
    let mut out = base.to_string();
    if let Some(encoding) = caps.get(2) {
        let enc = &encoding.as_str()[1..];
        if !(enc.eq_ignore_ascii_case("utf-8") || enc.to_ascii_uppercase().starts_with("ISO")) {
            // Unknown middle part, leave the key alone.
            return Some(locale.to_string());
        }
    }
    if let Some(modifier) = caps.get(3) {
        out.push_str(modifier.as_str());
    }
    Some(out)
}

/// The locale of a desktop key, mapped onto the component convention where
/// `None` locale means the untranslated `"C"` entry.
fn entry_locale(raw: Option<&str>) -> Option<String> {
    match raw {
        None => Some(C_LOCALE.to_string()),
        Some(raw) => sanitize_locale(raw),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Drop blacklisted and `x-…` private categories.
pub fn filter_categories(categories: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for category in categories {
        if CATEGORY_BLACKLIST
            .iter()
            .any(|b| b.eq_ignore_ascii_case(category))
        {
            continue;
        }
        if category.to_ascii_lowercase().starts_with("x-") {
            continue;
        }
        if !out.contains(category) {
            out.push(category.clone());
        }
    }
    out
}

/// The desktop file name that would belong to a component id.
pub fn desktop_file_name_for_cid(cid: &str) -> String {
    if cid.ends_with(".desktop") {
        cid.to_string()
    } else {
        format!("{}.desktop", cid)
    }
}

/// Component id for a standalone desktop file: the file name, with the
/// `.desktop` suffix stripped when the rest is a reverse-DNS id.
pub fn cid_for_desktop_file(basename: &str) -> String {
    match basename.strip_suffix(".desktop") {
        Some(stem) if is_reverse_dns(stem) => stem.to_string(),
        _ => basename.to_string(),
    }
}

/// Whether this desktop entry describes a launchable application the
/// catalog should list.
fn is_catalog_relevant(kf: &KeyFile, ignore_nodisplay: bool) -> bool {
    if kf.get(DESKTOP_GROUP, "Type") != Some("Application") {
        return false;
    }
    if kf.get(DESKTOP_GROUP, "X-AppStream-Ignore").map(str::to_ascii_lowercase)
        == Some("true".to_string())
    {
        return false;
    }
    if !ignore_nodisplay
        && kf.get(DESKTOP_GROUP, "NoDisplay").map(str::to_ascii_lowercase)
            == Some("true".to_string())
    {
        return false;
    }
    true
}

/// Fill component gaps from a matched desktop entry. Metainfo data wins:
/// only missing locales and empty fields are taken from the desktop file.
pub fn merge_into_component(kf: &KeyFile, cpt: &mut Component) {
    for (raw_key, value) in kf.entries(DESKTOP_GROUP) {
        let (key, raw_locale) = split_locale_key(raw_key);
        let Some(locale) = entry_locale(raw_locale) else {
            continue;
        };
        match key {
            "Name" => {
                cpt.name.entry(locale).or_insert_with(|| value.to_string());
            }
            "Comment" => {
                cpt.summary
                    .entry(locale)
                    .or_insert_with(|| value.to_string());
            }
            "Keywords" => {
                cpt.keywords.entry(locale).or_insert_with(|| split_list(value));
            }
            _ => {}
        }
    }

    if cpt.categories.is_empty() {
        if let Some(value) = kf.get(DESKTOP_GROUP, "Categories") {
            cpt.categories = filter_categories(&split_list(value));
        }
    }
    if let Some(value) = kf.get(DESKTOP_GROUP, "MimeType") {
        for mimetype in split_list(value) {
            if !cpt.provided.mimetypes.contains(&mimetype) {
                cpt.provided.mimetypes.push(mimetype);
            }
        }
    }
    if cpt.stock_icon().is_none() {
        if let Some(icon) = kf.get(DESKTOP_GROUP, "Icon") {
            push_icon_value(cpt, icon);
        }
    }
    if cpt.compulsory_for_desktops.is_empty() {
        if let Some(value) = kf.get(DESKTOP_GROUP, "OnlyShowIn") {
            cpt.compulsory_for_desktops = split_list(value);
        }
    }
}

/// Record a desktop `Icon=` value on the component. Absolute paths become
/// local icons; names carrying an image extension are reduced to their stem.
fn push_icon_value(cpt: &mut Component, value: &str) {
    if value.starts_with('/') {
        cpt.icons.push(Icon::Local {
            path: value.to_string(),
        });
        return;
    }
    let mut name = value;
    for ext in [".png", ".svgz", ".svg", ".xpm"] {
        if let Some(stem) = name.strip_suffix(ext) {
            name = stem;
            break;
        }
    }
    cpt.icons.push(Icon::Stock {
        name: name.to_string(),
    });
}

/// Build a standalone component from a desktop file that matched no
/// metainfo. Returns `None` when the entry is not catalog material.
pub fn component_from_desktop(
    kf: &KeyFile,
    basename: &str,
    ignore_nodisplay: bool,
) -> Option<Component> {
    if !is_catalog_relevant(kf, ignore_nodisplay) {
        return None;
    }
    let cid = cid_for_desktop_file(basename);
    let mut cpt = Component::new(ComponentKind::DesktopApp, &cid);
    cpt.add_launchable("desktop-id", basename);
    merge_into_component(kf, &mut cpt);
    Some(cpt)
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Line {} contains an entry outside of any group", line))]
        EntryOutsideGroup { line: usize },

        #[snafu(display("Line {} opens a group without closing bracket", line))]
        MalformedGroup { line: usize },

        #[snafu(display("Line {} is neither a group, a comment nor a key=value entry", line))]
        MalformedLine { line: usize },
    }
}
