/*!
Translation statistics from gettext machine-object files.

For every `<translation type="gettext">` domain a component declares, the
handler finds the domain's `.mo` files across the whole package set, reads
the translated-string count from the file header, and turns the counts into
per-locale completion percentages relative to the best-translated locale.
Locales above the threshold are recorded on the component.
*/

use crate::backend::Package;
use crate::component::Component;
use crate::desktop::sanitize_locale;
use crate::hint_vars;
use crate::hints::Hint;
use log::debug;
use snafu::ensure;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type Result<T> = std::result::Result<T, error::Error>;

const LOCALE_PREFIX: &str = "/usr/share/locale/";

/// Languages below this completion percentage are noise, not translations.
const MIN_PERCENTAGE: u64 = 25;

/// Read the number of strings in a gettext `.mo` file. The magic number
/// decides the byte order of the header.
pub fn mo_string_count(data: &[u8]) -> Result<u32> {
    ensure!(data.len() >= 12, error::TruncatedSnafu);
    let magic = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let count_bytes = [data[8], data[9], data[10], data[11]];
    match magic {
        0x950412de => Ok(u32::from_le_bytes(count_bytes)),
        0xde120495 => Ok(u32::from_be_bytes(count_bytes)),
        _ => error::BadMagicSnafu { magic }.fail(),
    }
}

/// The locale segment of `/usr/share/locale/<locale>/LC_MESSAGES/<domain>.mo`
/// when the path belongs to `domain`.
fn locale_for_domain_path(path: &str, domain: &str) -> Option<String> {
    let rest = path.strip_prefix(LOCALE_PREFIX)?;
    let (locale, tail) = rest.split_once('/')?;
    let expected = format!("LC_MESSAGES/{}.mo", domain);
    (tail == expected).then(|| locale.to_string())
}

pub struct LocaleHandler<'a> {
    locale_map: &'a HashMap<String, String>,
    packages: &'a HashMap<String, Arc<dyn Package>>,
}

impl<'a> LocaleHandler<'a> {
    pub fn new(
        locale_map: &'a HashMap<String, String>,
        packages: &'a HashMap<String, Arc<dyn Package>>,
    ) -> Self {
        Self {
            locale_map,
            packages,
        }
    }

    /// Compute language completeness for the component. Returns hints for
    /// declared domains with no translation data at all.
    pub fn process(&self, cpt: &mut Component) -> Vec<Hint> {
        let mut hints = Vec::new();
        let domains: Vec<String> = cpt
            .translations
            .iter()
            .filter(|t| t.kind == "gettext")
            .map(|t| t.name.clone())
            .collect();
        if domains.is_empty() {
            return hints;
        }

        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for domain in &domains {
            let mut found_any = false;
            for (path, pkid) in self.locale_map {
                let Some(raw_locale) = locale_for_domain_path(path, domain) else {
                    continue;
                };
                let Some(locale) = sanitize_locale(&raw_locale) else {
                    continue;
                };
                let Some(pkg) = self.packages.get(pkid) else {
                    continue;
                };
                match pkg.data(path).map_err(|e| e.to_string()).and_then(|data| {
                    mo_string_count(&data).map_err(|e| e.to_string())
                }) {
                    Ok(count) => {
                        found_any = true;
                        *counts.entry(locale).or_default() += u64::from(count);
                    }
                    Err(e) => {
                        debug!("Ignoring unreadable locale data '{}': {}", path, e);
                    }
                }
            }
            if !found_any {
                hints.push(Hint::new(
                    "gettext-missing-domain",
                    hint_vars! { "domain" => domain },
                ));
            }
        }

        let Some(&max) = counts.values().max() else {
            return hints;
        };
        if max == 0 {
            return hints;
        }
        for (locale, count) in counts {
            let percentage = count * 100 / max;
            if percentage > MIN_PERCENTAGE {
                cpt.add_language(&locale, percentage as u32);
            }
        }
        hints
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Not a gettext .mo file (magic {:#010x})", magic))]
        BadMagic { magic: u32 },

        #[snafu(display("File is too short for a .mo header"))]
        Truncated,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component::{ComponentKind, Translation};
    use crate::icons::test_support::MemPackage;

    /// A minimal .mo header: magic, revision, string count.
    fn mo_data(count: u32, little_endian: bool) -> Vec<u8> {
        let mut data = Vec::new();
        if little_endian {
            data.extend_from_slice(&0x950412deu32.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&count.to_le_bytes());
        } else {
            data.extend_from_slice(&0x950412deu32.to_be_bytes());
            data.extend_from_slice(&0u32.to_be_bytes());
            data.extend_from_slice(&count.to_be_bytes());
        }
        data
    }

    #[test]
    fn mo_header_both_byte_orders() {
        assert_eq!(mo_string_count(&mo_data(250, true)).unwrap(), 250);
        assert_eq!(mo_string_count(&mo_data(250, false)).unwrap(), 250);
        assert!(mo_string_count(&[0u8; 4]).is_err());
        assert!(mo_string_count(&[0xffu8; 12]).is_err());
    }

    #[test]
    fn domain_path_matching() {
        assert_eq!(
            locale_for_domain_path("/usr/share/locale/de/LC_MESSAGES/foo.mo", "foo"),
            Some("de".to_string())
        );
        assert_eq!(
            locale_for_domain_path("/usr/share/locale/de/LC_MESSAGES/bar.mo", "foo"),
            None
        );
        assert_eq!(locale_for_domain_path("/usr/share/doc/foo.mo", "foo"), None);
    }

    fn fixture(
        files: &[(&str, Vec<u8>)],
    ) -> (HashMap<String, String>, HashMap<String, Arc<dyn Package>>) {
        let borrowed: Vec<(&str, &[u8])> =
            files.iter().map(|(p, d)| (*p, d.as_slice())).collect();
        let pkg: Arc<dyn Package> = Arc::new(MemPackage::new("foo-l10n", &borrowed));
        let pkid = pkg.pkid();
        let mut locale_map = HashMap::new();
        for (path, _) in files {
            locale_map.insert(path.to_string(), pkid.clone());
        }
        let mut packages = HashMap::new();
        packages.insert(pkid, pkg);
        (locale_map, packages)
    }

    fn component_with_domain(domain: &str) -> Component {
        let mut cpt = Component::new(ComponentKind::DesktopApp, "org.example.app");
        cpt.translations.push(Translation {
            kind: "gettext".to_string(),
            name: domain.to_string(),
        });
        cpt
    }

    #[test]
    fn percentages_are_relative_to_the_best_locale() {
        let (locale_map, packages) = fixture(&[
            (
                "/usr/share/locale/de/LC_MESSAGES/foo.mo",
                mo_data(100, true),
            ),
            ("/usr/share/locale/fr/LC_MESSAGES/foo.mo", mo_data(50, true)),
            ("/usr/share/locale/pt/LC_MESSAGES/foo.mo", mo_data(20, true)),
        ]);
        let handler = LocaleHandler::new(&locale_map, &packages);
        let mut cpt = component_with_domain("foo");
        let hints = handler.process(&mut cpt);
        assert!(hints.is_empty());
        assert_eq!(cpt.languages.get("de"), Some(&100));
        assert_eq!(cpt.languages.get("fr"), Some(&50));
        // 20% is below the threshold.
        assert_eq!(cpt.languages.get("pt"), None);
    }

    #[test]
    fn counts_sum_across_domains() {
        let (locale_map, packages) = fixture(&[
            ("/usr/share/locale/de/LC_MESSAGES/a.mo", mo_data(40, true)),
            ("/usr/share/locale/de/LC_MESSAGES/b.mo", mo_data(60, true)),
            ("/usr/share/locale/fr/LC_MESSAGES/a.mo", mo_data(40, true)),
        ]);
        let handler = LocaleHandler::new(&locale_map, &packages);
        let mut cpt = component_with_domain("a");
        cpt.translations.push(Translation {
            kind: "gettext".to_string(),
            name: "b".to_string(),
        });
        handler.process(&mut cpt);
        assert_eq!(cpt.languages.get("de"), Some(&100));
        assert_eq!(cpt.languages.get("fr"), Some(&40));
    }

    #[test]
    fn missing_domain_is_reported() {
        let (locale_map, packages) = fixture(&[]);
        let handler = LocaleHandler::new(&locale_map, &packages);
        let mut cpt = component_with_domain("ghost");
        let hints = handler.process(&mut cpt);
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].tag, "gettext-missing-domain");
        assert!(cpt.languages.is_empty());
    }

    #[test]
    fn components_without_domains_are_untouched() {
        let (locale_map, packages) = fixture(&[]);
        let handler = LocaleHandler::new(&locale_map, &packages);
        let mut cpt = Component::new(ComponentKind::DesktopApp, "org.example.app");
        assert!(handler.process(&mut cpt).is_empty());
        assert!(cpt.languages.is_empty());
    }
}
