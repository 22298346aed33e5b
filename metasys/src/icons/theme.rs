/*!
XDG icon theme indices.

A theme's `index.theme` key-file declares a list of directories, each with a
size, a scale and a matching type. Size matching follows the icon-theme
specification for `Fixed` and `Scalable` directories; for `Threshold`
directories a larger declared size is additionally admitted, since the
generator can always downscale a bigger source.
*/

use crate::desktop::KeyFile;
use snafu::{OptionExt, ResultExt};

type Result<T> = std::result::Result<T, error::Error>;

const THEME_GROUP: &str = "Icon Theme";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryType {
    Fixed,
    Scalable,
    Threshold,
}

#[derive(Debug, Clone)]
pub struct ThemeDirectory {
    pub path: String,
    pub size: u32,
    pub scale: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub threshold: u32,
    pub dtype: DirectoryType,
}

impl ThemeDirectory {
    /// Whether icons in this directory satisfy a request for
    /// `size` x `size` at `scale`.
    pub fn matches_size(&self, size: u32, scale: u32) -> bool {
        if self.scale != scale {
            return false;
        }
        match self.dtype {
            DirectoryType::Fixed => self.size == size,
            DirectoryType::Scalable => self.min_size <= size && size <= self.max_size,
            // The icon-theme spec admits [size-threshold, size+threshold];
            // any larger declared size is accepted as well since a
            // downscale keeps full quality.
            DirectoryType::Threshold => size <= self.size + self.threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Theme {
    pub name: String,
    directories: Vec<ThemeDirectory>,
}

impl Theme {
    /// Parse an `index.theme` document.
    pub fn parse(name: &str, data: &str) -> Result<Self> {
        let kf = KeyFile::parse(data).context(error::KeyFileSnafu { theme: name })?;
        let dir_list = kf
            .get(THEME_GROUP, "Directories")
            .context(error::NoDirectoriesSnafu { theme: name })?;
        let mut dir_names: Vec<String> = dir_list
            .split(',')
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect();
        if let Some(scaled) = kf.get(THEME_GROUP, "ScaledDirectories") {
            dir_names.extend(
                scaled
                    .split(',')
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(str::to_string),
            );
        }

        let mut directories = Vec::new();
        for dir_name in dir_names {
            // Directories without a size declaration are unusable.
            let Some(size) = kf.get(&dir_name, "Size").and_then(|v| v.parse().ok()) else {
                continue;
            };
            let dtype = match kf.get(&dir_name, "Type") {
                Some("Fixed") => DirectoryType::Fixed,
                Some("Scalable") => DirectoryType::Scalable,
                _ => DirectoryType::Threshold,
            };
            let parse_or = |key: &str, default: u32| {
                kf.get(&dir_name, key)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(default)
            };
            directories.push(ThemeDirectory {
                size,
                scale: parse_or("Scale", 1),
                min_size: parse_or("MinSize", size),
                max_size: parse_or("MaxSize", size),
                threshold: parse_or("Threshold", 2),
                dtype,
                path: dir_name,
            });
        }

        Ok(Self {
            name: name.to_string(),
            directories,
        })
    }

    /// Directories matching the requested size, best first: exact declared
    /// sizes, then larger ones nearest first.
    pub fn matching_directories(&self, size: u32, scale: u32) -> Vec<&ThemeDirectory> {
        let mut dirs: Vec<&ThemeDirectory> = self
            .directories
            .iter()
            .filter(|d| d.matches_size(size, scale))
            .collect();
        dirs.sort_by_key(|d| (d.size != size, d.size.abs_diff(size), d.path.clone()));
        dirs
    }

    /// All directories of a scale, for fallback lookups beyond the strict
    /// size match.
    pub fn directories_for_scale(&self, scale: u32) -> impl Iterator<Item = &ThemeDirectory> {
        self.directories.iter().filter(move |d| d.scale == scale)
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Theme index of '{}' is not a valid key-file: {}", theme, source))]
        KeyFile {
            theme: String,
            source: crate::desktop::error::Error,
        },

        #[snafu(display("Theme index of '{}' declares no directories", theme))]
        NoDirectories { theme: String },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const INDEX: &str = "\
[Icon Theme]
Name=Test
Directories=48x48/apps,64x64/apps,128x128/apps,scalable/apps,fixed16

[48x48/apps]
Size=48
Type=Threshold

[64x64/apps]
Size=64
Type=Threshold

[128x128/apps]
Size=128
Type=Threshold

[scalable/apps]
Size=128
MinSize=8
MaxSize=512
Type=Scalable

[fixed16]
Size=16
Type=Fixed
";

    fn theme() -> Theme {
        Theme::parse("test", INDEX).unwrap()
    }

    #[test]
    fn parses_directory_declarations() {
        let theme = theme();
        assert_eq!(theme.name, "test");
        assert_eq!(theme.directories.len(), 5);
    }

    #[test]
    fn fixed_matches_only_its_size() {
        let theme = theme();
        let fixed = theme
            .directories
            .iter()
            .find(|d| d.path == "fixed16")
            .unwrap();
        assert!(fixed.matches_size(16, 1));
        assert!(!fixed.matches_size(17, 1));
        assert!(!fixed.matches_size(16, 2));
    }

    #[test]
    fn scalable_matches_its_range() {
        let theme = theme();
        let scalable = theme
            .directories
            .iter()
            .find(|d| d.path == "scalable/apps")
            .unwrap();
        assert!(scalable.matches_size(8, 1));
        assert!(scalable.matches_size(256, 1));
        assert!(!scalable.matches_size(513, 1));
    }

    #[test]
    fn threshold_admits_larger_declared_sizes() {
        let theme = theme();
        let dir128 = theme
            .directories
            .iter()
            .find(|d| d.path == "128x128/apps")
            .unwrap();
        // Within threshold.
        assert!(dir128.matches_size(128, 1));
        assert!(dir128.matches_size(130, 1));
        // Downscaling from a larger declared size is allowed.
        assert!(dir128.matches_size(64, 1));
        // Upscaling beyond the threshold is not.
        assert!(!dir128.matches_size(131, 1));
    }

    #[test]
    fn matching_directories_prefer_exact_sizes() {
        let theme = theme();
        let dirs = theme.matching_directories(64, 1);
        assert_eq!(dirs[0].path, "64x64/apps");
        // Larger sources follow, nearest first.
        assert!(dirs.iter().any(|d| d.path == "128x128/apps"));
    }

    #[test]
    fn missing_directories_key_is_an_error() {
        assert!(Theme::parse("broken", "[Icon Theme]\nName=Broken\n").is_err());
    }
}
