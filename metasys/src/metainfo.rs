/*!
Parsing of AppStream metainfo XML into components.

The parser is event-driven and tolerant: elements it does not know are
skipped wholesale, localized elements are folded into the component's
translation maps, and description markup is captured verbatim (per locale)
so it can be re-emitted without information loss. Only structural problems
(malformed XML, a missing component id) are errors; the caller converts
those into hints on the package.
*/

use crate::component::{
    Component, ComponentKind, Icon, Image, ImageKind, Release, Screenshot, Translation, Video,
    C_LOCALE,
};
use crate::desktop::sanitize_locale;
use quick_xml::events::{BytesStart, Event};
use quick_xml::name::QName;
use quick_xml::Reader;
use snafu::ResultExt;
use std::collections::BTreeMap;
use std::str::FromStr;

type Result<T> = std::result::Result<T, error::Error>;

/// Parse one metainfo document into a component.
pub fn parse_metainfo(data: &str) -> Result<Component> {
    let mut reader = Reader::from_str(data);
    let mut cpt = Component::default();
    let mut saw_root = false;

    loop {
        match reader.read_event().context(error::XmlSnafu)? {
            Event::Start(e) => {
                let name = local_name(&e);
                if !saw_root {
                    match name.as_str() {
                        "component" => {
                            cpt.kind = Some(component_kind(&e)?);
                        }
                        // Legacy appdata root element.
                        "application" => {
                            cpt.kind = Some(ComponentKind::DesktopApp);
                        }
                        other => {
                            return error::BadRootSnafu { element: other }.fail();
                        }
                    }
                    saw_root = true;
                    continue;
                }
                read_component_child(&mut reader, &e, &mut cpt)?;
            }
            Event::Empty(_) | Event::Text(_) | Event::Comment(_) | Event::CData(_) => {}
            Event::Decl(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::End(_) => {}
            Event::Eof => break,
        }
    }

    snafu::ensure!(saw_root, error::BadRootSnafu { element: "" });
    snafu::ensure!(!cpt.cid.is_empty(), error::NoIdSnafu);
    Ok(cpt)
}

fn component_kind(e: &BytesStart<'_>) -> Result<ComponentKind> {
    match attr(e, "type")? {
        Some(kind) => Ok(ComponentKind::from_str(&kind).unwrap_or(ComponentKind::Unknown)),
        None => Ok(ComponentKind::Generic),
    }
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).to_string()
}

fn attr(e: &BytesStart<'_>, name: &str) -> Result<Option<String>> {
    for a in e.attributes() {
        let a = a.context(error::AttrSnafu)?;
        if a.key.as_ref() == name.as_bytes() || a.key.local_name().as_ref() == name.as_bytes() {
            return Ok(Some(String::from_utf8_lossy(&a.value).to_string()));
        }
    }
    Ok(None)
}

/// The sanitized locale of an element, `"C"` when no `xml:lang` is present,
/// `None` when the locale is a test locale to drop.
fn element_locale(e: &BytesStart<'_>) -> Result<Option<String>> {
    match attr(e, "lang")? {
        None => Ok(Some(C_LOCALE.to_string())),
        Some(raw) => Ok(sanitize_locale(&raw)),
    }
}

fn read_text(reader: &mut Reader<&[u8]>, end: QName<'_>) -> Result<String> {
    let text = reader.read_text(end).context(error::XmlSnafu)?;
    Ok(text.trim().to_string())
}

fn read_component_child(
    reader: &mut Reader<&[u8]>,
    e: &BytesStart<'_>,
    cpt: &mut Component,
) -> Result<()> {
    let name = local_name(e);
    match name.as_str() {
        "id" => {
            cpt.cid = read_text(reader, e.name())?;
        }
        "pkgname" => {
            cpt.pkgname = read_text(reader, e.name())?;
        }
        "name" => {
            put_localized(reader, e, &mut cpt.name)?;
        }
        "summary" => {
            put_localized(reader, e, &mut cpt.summary)?;
        }
        "developer_name" => {
            put_localized(reader, e, &mut cpt.developer_name)?;
        }
        "project_license" => {
            cpt.project_license = Some(read_text(reader, e.name())?);
        }
        "metadata_license" => {
            cpt.metadata_license = Some(read_text(reader, e.name())?);
        }
        "description" => {
            read_description(reader, &mut cpt.description)?;
        }
        "icon" => {
            read_icon(reader, e, cpt)?;
        }
        "categories" => {
            read_string_list(reader, e.name(), "category", &mut cpt.categories)?;
        }
        "keywords" => {
            read_keywords(reader, &mut cpt.keywords)?;
        }
        "mimetypes" => {
            read_string_list(reader, e.name(), "mimetype", &mut cpt.provided.mimetypes)?;
        }
        "provides" => {
            read_provides(reader, cpt)?;
        }
        "url" => {
            let kind = attr(e, "type")?.unwrap_or_else(|| "homepage".to_string());
            let url = read_text(reader, e.name())?;
            cpt.urls.entry(kind).or_insert(url);
        }
        "launchable" => {
            let kind = attr(e, "type")?.unwrap_or_else(|| "desktop-id".to_string());
            let value = read_text(reader, e.name())?;
            if !value.is_empty() {
                cpt.add_launchable(&kind, &value);
            }
        }
        "translation" => {
            let kind = attr(e, "type")?.unwrap_or_else(|| "gettext".to_string());
            let domain = read_text(reader, e.name())?;
            if !domain.is_empty() {
                cpt.translations.push(Translation { kind, name: domain });
            }
        }
        "extends" => {
            let value = read_text(reader, e.name())?;
            if !value.is_empty() && !cpt.extends.contains(&value) {
                cpt.extends.push(value);
            }
        }
        "compulsory_for_desktop" => {
            let value = read_text(reader, e.name())?;
            if !value.is_empty() && !cpt.compulsory_for_desktops.contains(&value) {
                cpt.compulsory_for_desktops.push(value);
            }
        }
        "screenshots" => {
            read_screenshots(reader, cpt)?;
        }
        "releases" => {
            read_releases(reader, cpt)?;
        }
        "custom" => {
            read_custom(reader, cpt)?;
        }
        _ => {
            reader.read_to_end(e.name()).context(error::XmlSnafu)?;
        }
    }
    Ok(())
}

fn put_localized(
    reader: &mut Reader<&[u8]>,
    e: &BytesStart<'_>,
    map: &mut BTreeMap<String, String>,
) -> Result<()> {
    let locale = element_locale(e)?;
    let value = read_text(reader, e.name())?;
    if let Some(locale) = locale {
        if !value.is_empty() {
            map.entry(locale).or_insert(value);
        }
    }
    Ok(())
}

fn read_icon(reader: &mut Reader<&[u8]>, e: &BytesStart<'_>, cpt: &mut Component) -> Result<()> {
    let kind = attr(e, "type")?.unwrap_or_else(|| "stock".to_string());
    let width = attr(e, "width")?.and_then(|v| v.parse().ok()).unwrap_or(64);
    let height = attr(e, "height")?.and_then(|v| v.parse().ok()).unwrap_or(64);
    let scale = attr(e, "scale")?.and_then(|v| v.parse().ok()).unwrap_or(1);
    let value = read_text(reader, e.name())?;
    if value.is_empty() {
        return Ok(());
    }
    match kind.as_str() {
        "stock" => cpt.icons.push(Icon::Stock { name: value }),
        "cached" => cpt.icons.push(Icon::Cached {
            name: value,
            width,
            height,
            scale,
        }),
        "local" => cpt.icons.push(Icon::Local { path: value }),
        "remote" => cpt.icons.push(Icon::Remote {
            url: value,
            width,
            height,
            scale,
        }),
        _ => {}
    }
    Ok(())
}

fn read_string_list(
    reader: &mut Reader<&[u8]>,
    end: QName<'_>,
    item: &str,
    out: &mut Vec<String>,
) -> Result<()> {
    loop {
        match reader.read_event().context(error::XmlSnafu)? {
            Event::Start(e) => {
                let name = local_name(&e);
                let value = read_text(reader, e.name())?;
                if name == item && !value.is_empty() && !out.contains(&value) {
                    out.push(value);
                }
            }
            Event::End(e) if e.name() == end => break,
            Event::Eof => return error::TruncatedSnafu.fail(),
            _ => {}
        }
    }
    Ok(())
}

fn read_keywords(
    reader: &mut Reader<&[u8]>,
    out: &mut BTreeMap<String, Vec<String>>,
) -> Result<()> {
    loop {
        match reader.read_event().context(error::XmlSnafu)? {
            Event::Start(e) => {
                let name = local_name(&e);
                let locale = element_locale(&e)?;
                let value = read_text(reader, e.name())?;
                if name != "keyword" || value.is_empty() {
                    continue;
                }
                if let Some(locale) = locale {
                    let words = out.entry(locale).or_default();
                    if !words.contains(&value) {
                        words.push(value);
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"keywords" => break,
            Event::Eof => return error::TruncatedSnafu.fail(),
            _ => {}
        }
    }
    Ok(())
}

fn read_provides(reader: &mut Reader<&[u8]>, cpt: &mut Component) -> Result<()> {
    loop {
        match reader.read_event().context(error::XmlSnafu)? {
            Event::Start(e) => {
                let name = local_name(&e);
                let value = read_text(reader, e.name())?;
                if value.is_empty() {
                    continue;
                }
                let target = match name.as_str() {
                    "binary" => &mut cpt.provided.binaries,
                    "library" => &mut cpt.provided.libraries,
                    "font" => &mut cpt.provided.fonts,
                    "mimetype" | "mediatype" => &mut cpt.provided.mimetypes,
                    "dbus" => &mut cpt.provided.dbus_services,
                    "firmware" => &mut cpt.provided.firmware,
                    "modalias" => &mut cpt.provided.modaliases,
                    "python3" => &mut cpt.provided.python,
                    _ => continue,
                };
                if !target.contains(&value) {
                    target.push(value);
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"provides" => break,
            Event::Eof => return error::TruncatedSnafu.fail(),
            _ => {}
        }
    }
    Ok(())
}

fn read_screenshots(reader: &mut Reader<&[u8]>, cpt: &mut Component) -> Result<()> {
    loop {
        match reader.read_event().context(error::XmlSnafu)? {
            Event::Start(e) if local_name(&e) == "screenshot" => {
                let default = attr(&e, "type")?.as_deref() == Some("default");
                let shot = read_screenshot(reader, default)?;
                if !shot.images.is_empty() || !shot.videos.is_empty() {
                    cpt.screenshots.push(shot);
                }
            }
            Event::Start(e) => {
                reader.read_to_end(e.name()).context(error::XmlSnafu)?;
            }
            Event::End(e) if e.local_name().as_ref() == b"screenshots" => break,
            Event::Eof => return error::TruncatedSnafu.fail(),
            _ => {}
        }
    }
    Ok(())
}

fn read_screenshot(reader: &mut Reader<&[u8]>, default: bool) -> Result<Screenshot> {
    let mut shot = Screenshot {
        default,
        ..Default::default()
    };
    loop {
        match reader.read_event().context(error::XmlSnafu)? {
            Event::Start(e) => {
                let name = local_name(&e);
                match name.as_str() {
                    "caption" => {
                        let locale = element_locale(&e)?;
                        let value = read_text(reader, e.name())?;
                        if let Some(locale) = locale {
                            if !value.is_empty() {
                                shot.captions.entry(locale).or_insert(value);
                            }
                        }
                    }
                    "image" => {
                        let kind = match attr(&e, "type")?.as_deref() {
                            Some("thumbnail") => ImageKind::Thumbnail,
                            _ => ImageKind::Source,
                        };
                        let width = attr(&e, "width")?.and_then(|v| v.parse().ok());
                        let height = attr(&e, "height")?.and_then(|v| v.parse().ok());
                        let url = read_text(reader, e.name())?;
                        if !url.is_empty() {
                            shot.images.push(Image {
                                kind,
                                url,
                                width,
                                height,
                            });
                        }
                    }
                    "video" => {
                        let container = attr(&e, "container")?;
                        let codec = attr(&e, "codec")?;
                        let url = read_text(reader, e.name())?;
                        if !url.is_empty() {
                            shot.videos.push(Video {
                                url,
                                container,
                                codec,
                            });
                        }
                    }
                    _ => {
                        reader.read_to_end(e.name()).context(error::XmlSnafu)?;
                    }
                }
            }
            Event::End(e) if e.local_name().as_ref() == b"screenshot" => break,
            Event::Eof => return error::TruncatedSnafu.fail(),
            _ => {}
        }
    }
    Ok(shot)
}

fn read_releases(reader: &mut Reader<&[u8]>, cpt: &mut Component) -> Result<()> {
    loop {
        match reader.read_event().context(error::XmlSnafu)? {
            Event::Start(e) if local_name(&e) == "release" => {
                push_release(&e, cpt)?;
                reader.read_to_end(e.name()).context(error::XmlSnafu)?;
            }
            Event::Empty(e) if local_name(&e) == "release" => {
                push_release(&e, cpt)?;
            }
            Event::Start(e) => {
                reader.read_to_end(e.name()).context(error::XmlSnafu)?;
            }
            Event::End(e) if e.local_name().as_ref() == b"releases" => break,
            Event::Eof => return error::TruncatedSnafu.fail(),
            _ => {}
        }
    }
    Ok(())
}

fn push_release(e: &BytesStart<'_>, cpt: &mut Component) -> Result<()> {
    let Some(version) = attr(e, "version")? else {
        return Ok(());
    };
    cpt.releases.push(Release {
        version,
        timestamp: attr(e, "timestamp")?.and_then(|v| v.parse().ok()),
        date: attr(e, "date")?,
    });
    Ok(())
}

fn read_custom(reader: &mut Reader<&[u8]>, cpt: &mut Component) -> Result<()> {
    loop {
        match reader.read_event().context(error::XmlSnafu)? {
            Event::Start(e) if local_name(&e) == "value" => {
                let key = attr(&e, "key")?;
                let value = read_text(reader, e.name())?;
                if let Some(key) = key {
                    cpt.custom.entry(key).or_insert(value);
                }
            }
            Event::Start(e) => {
                reader.read_to_end(e.name()).context(error::XmlSnafu)?;
            }
            Event::End(e) if e.local_name().as_ref() == b"custom" => break,
            Event::Eof => return error::TruncatedSnafu.fail(),
            _ => {}
        }
    }
    Ok(())
}

/// Capture description markup verbatim, splitting the direct children by
/// their `xml:lang` attribute. The attribute itself is not reproduced; each
/// locale's buffer holds clean markup.
fn read_description(
    reader: &mut Reader<&[u8]>,
    out: &mut BTreeMap<String, String>,
) -> Result<()> {
    let mut depth = 0usize;
    let mut locale: Option<String> = None;
    let mut buf = String::new();

    loop {
        match reader.read_event().context(error::XmlSnafu)? {
            Event::Start(e) => {
                if depth == 0 {
                    locale = element_locale(&e)?;
                    buf.clear();
                    write_open_tag(&mut buf, &e, true)?;
                } else {
                    write_open_tag(&mut buf, &e, false)?;
                }
                depth += 1;
            }
            Event::Empty(e) => {
                let target_locale = if depth == 0 {
                    element_locale(&e)?
                } else {
                    locale.clone()
                };
                let mut tag = String::new();
                write_open_tag(&mut tag, &e, depth == 0)?;
                tag.insert(tag.len() - 1, '/');
                if depth == 0 {
                    if let Some(target) = target_locale {
                        out.entry(target).or_default().push_str(&tag);
                    }
                } else {
                    buf.push_str(&tag);
                }
            }
            Event::Text(t) => {
                if depth > 0 {
                    // Keep the escaped form so the markup stays valid.
                    buf.push_str(std::str::from_utf8(&t).context(error::Utf8Snafu)?);
                }
            }
            Event::CData(t) => {
                if depth > 0 {
                    buf.push_str(&crate::common::escape_xml(
                        std::str::from_utf8(&t).context(error::Utf8Snafu)?,
                    ));
                }
            }
            Event::End(e) => {
                if depth == 0 {
                    // This closes the description element itself.
                    break;
                }
                depth -= 1;
                buf.push_str("</");
                buf.push_str(&String::from_utf8_lossy(e.local_name().as_ref()));
                buf.push('>');
                if depth == 0 {
                    if let Some(target) = locale.take() {
                        out.entry(target).or_default().push_str(&buf);
                    }
                    buf.clear();
                }
            }
            Event::Eof => return error::TruncatedSnafu.fail(),
            _ => {}
        }
    }
    Ok(())
}

fn write_open_tag(buf: &mut String, e: &BytesStart<'_>, strip_lang: bool) -> Result<()> {
    buf.push('<');
    buf.push_str(&String::from_utf8_lossy(e.local_name().as_ref()));
    for a in e.attributes() {
        let a = a.context(error::AttrSnafu)?;
        if strip_lang && a.key.local_name().as_ref() == b"lang" {
            continue;
        }
        buf.push(' ');
        buf.push_str(&String::from_utf8_lossy(a.key.as_ref()));
        buf.push_str("=\"");
        buf.push_str(&String::from_utf8_lossy(&a.value));
        buf.push('"');
    }
    buf.push('>');
    Ok(())
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Invalid attribute: {}", source))]
        Attr {
            source: quick_xml::events::attributes::AttrError,
        },

        #[snafu(display("Document root is '{}', expected 'component'", element))]
        BadRoot { element: String },

        #[snafu(display("The component has no <id> element"))]
        NoId,

        #[snafu(display("Document ended unexpectedly"))]
        Truncated,

        #[snafu(display("Text is not valid UTF-8: {}", source))]
        Utf8 { source: std::str::Utf8Error },

        #[snafu(display("XML parsing failed: {}", source))]
        Xml { source: quick_xml::Error },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const FOOBAR_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<component type="desktop-application">
  <id>org.example.foobar</id>
  <metadata_license>CC0-1.0</metadata_license>
  <project_license>GPL-3.0+</project_license>
  <name>FooBar</name>
  <name xml:lang="de">FuuBar</name>
  <summary>An example application</summary>
  <description>
    <p>FooBar does many things, among them:</p>
    <ul>
      <li>foo &amp; bar</li>
    </ul>
    <p xml:lang="de">FooBar kann vieles.</p>
  </description>
  <icon type="stock">foobar</icon>
  <categories>
    <category>Utility</category>
  </categories>
  <keywords>
    <keyword>example</keyword>
    <keyword xml:lang="de">Beispiel</keyword>
  </keywords>
  <url type="homepage">https://example.org/foobar</url>
  <launchable type="desktop-id">org.example.foobar.desktop</launchable>
  <provides>
    <binary>foobar</binary>
    <mediatype>text/x-foobar</mediatype>
  </provides>
  <translation type="gettext">foobar</translation>
  <releases>
    <release version="1.2" timestamp="1462288512"/>
    <release version="1.1" date="2015-06-02"/>
  </releases>
  <custom>
    <value key="Example::Key">Value</value>
  </custom>
  <unknown-element><nested/></unknown-element>
</component>
"#;

    #[test]
    fn parses_a_full_component() {
        let cpt = parse_metainfo(FOOBAR_XML).unwrap();
        assert_eq!(cpt.cid, "org.example.foobar");
        assert_eq!(cpt.kind(), ComponentKind::DesktopApp);
        assert_eq!(cpt.name.get(C_LOCALE).unwrap(), "FooBar");
        assert_eq!(cpt.name.get("de").unwrap(), "FuuBar");
        assert_eq!(cpt.metadata_license.as_deref(), Some("CC0-1.0"));
        assert_eq!(cpt.project_license.as_deref(), Some("GPL-3.0+"));
        assert_eq!(cpt.stock_icon(), Some("foobar"));
        assert_eq!(cpt.categories, vec!["Utility".to_string()]);
        assert_eq!(
            cpt.keywords.get(C_LOCALE).unwrap(),
            &vec!["example".to_string()]
        );
        assert_eq!(
            cpt.keywords.get("de").unwrap(),
            &vec!["Beispiel".to_string()]
        );
        assert_eq!(
            cpt.urls.get("homepage").unwrap(),
            "https://example.org/foobar"
        );
        assert_eq!(
            cpt.launchables.get("desktop-id").unwrap(),
            &vec!["org.example.foobar.desktop".to_string()]
        );
        assert_eq!(cpt.provided.binaries, vec!["foobar".to_string()]);
        assert_eq!(cpt.provided.mimetypes, vec!["text/x-foobar".to_string()]);
        assert_eq!(cpt.translations.len(), 1);
        assert_eq!(cpt.translations[0].name, "foobar");
        assert_eq!(cpt.releases.len(), 2);
        assert_eq!(cpt.releases[0].timestamp, Some(1462288512));
        assert_eq!(cpt.releases[1].date.as_deref(), Some("2015-06-02"));
        assert_eq!(cpt.custom.get("Example::Key").unwrap(), "Value");
    }

    #[test]
    fn description_markup_is_split_by_locale() {
        let cpt = parse_metainfo(FOOBAR_XML).unwrap();
        let c_desc = cpt.description.get(C_LOCALE).unwrap();
        assert!(c_desc.contains("<p>FooBar does many things, among them:</p>"));
        assert!(c_desc.contains("<ul>"));
        assert!(c_desc.contains("<li>foo &amp; bar</li>"));
        let de_desc = cpt.description.get("de").unwrap();
        assert_eq!(de_desc, "<p>FooBar kann vieles.</p>");
        // The language attribute itself must not leak into the markup.
        assert!(!de_desc.contains("xml:lang"));
    }

    #[test]
    fn component_without_id_is_an_error() {
        let err = parse_metainfo("<component type=\"generic\"><name>X</name></component>")
            .unwrap_err();
        assert!(matches!(err, error::Error::NoId));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(parse_metainfo("<component><id>x</id></wrong>").is_err());
        assert!(parse_metainfo("not xml at all").is_err());
    }

    #[test]
    fn unknown_kind_becomes_unknown() {
        let cpt =
            parse_metainfo("<component type=\"flubber\"><id>org.x.y</id></component>").unwrap();
        assert_eq!(cpt.kind(), ComponentKind::Unknown);
    }

    #[test]
    fn missing_kind_is_generic() {
        let cpt = parse_metainfo("<component><id>org.x.y</id></component>").unwrap();
        assert_eq!(cpt.kind(), ComponentKind::Generic);
    }

    #[test]
    fn legacy_application_root_is_desktop_app() {
        let cpt = parse_metainfo("<application><id>foo.desktop</id></application>").unwrap();
        assert_eq!(cpt.kind(), ComponentKind::DesktopApp);
    }

    #[test]
    fn screenshots_are_parsed() {
        let xml = r#"<component type="desktop-application">
          <id>org.x.shots</id>
          <screenshots>
            <screenshot type="default">
              <caption>The main window</caption>
              <image type="source" width="1600" height="900">https://example.org/shot.png</image>
            </screenshot>
            <screenshot>
              <video container="webm" codec="vp9">https://example.org/demo.webm</video>
            </screenshot>
          </screenshots>
        </component>"#;
        let cpt = parse_metainfo(xml).unwrap();
        assert_eq!(cpt.screenshots.len(), 2);
        assert!(cpt.screenshots[0].default);
        let source = cpt.screenshots[0].source_image().unwrap();
        assert_eq!(source.url, "https://example.org/shot.png");
        assert_eq!(source.width, Some(1600));
        assert_eq!(cpt.screenshots[1].videos[0].codec.as_deref(), Some("vp9"));
    }

    #[test]
    fn test_locales_are_dropped() {
        let xml = r#"<component type="generic">
          <id>org.x.y</id>
          <name>Thing</name>
          <name xml:lang="x-test">xxThingxx</name>
          <name xml:lang="de_DE.UTF-8">Ding</name>
        </component>"#;
        let cpt = parse_metainfo(xml).unwrap();
        assert_eq!(cpt.name.len(), 2);
        assert_eq!(cpt.name.get("de_DE").unwrap(), "Ding");
    }
}
