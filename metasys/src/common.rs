//! Small helpers shared across the generator: XML escaping, deterministic
//! gzip output and filesystem odds and ends.

use flate2::{Compression, GzBuilder};
use snafu::ResultExt;
use std::fs;
use std::io::Write;
use std::path::Path;

type Result<T> = std::result::Result<T, error::Error>;

/// Escape a string for use in XML text content or attribute values.
pub fn escape_xml(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Write `data` gzip-compressed to `path`, creating parent directories.
///
/// The gzip header carries no mtime and no filename, so identical input
/// produces byte-identical output across runs.
pub fn write_gzip<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
    }
    let file = fs::File::create(path).context(error::CreateSnafu { path })?;
    let mut encoder = GzBuilder::new().mtime(0).write(file, Compression::default());
    encoder.write_all(data).context(error::WriteSnafu { path })?;
    encoder.finish().context(error::WriteSnafu { path })?;
    Ok(())
}

/// Write `data` to `path` atomically: the bytes land in a temporary sibling
/// file first and are renamed into place, so readers never observe a torn
/// write and reruns can safely overwrite.
pub fn write_atomic<P: AsRef<Path>>(path: P, data: &[u8]) -> Result<()> {
    let path = path.as_ref();
    let parent = path.parent().unwrap_or(Path::new("."));
    fs::create_dir_all(parent).context(error::CreateDirSnafu { path: parent })?;
    let mut tmp =
        tempfile::NamedTempFile::new_in(parent).context(error::CreateSnafu { path })?;
    tmp.write_all(data).context(error::WriteSnafu { path })?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .context(error::WriteSnafu { path })?;
    Ok(())
}

/// The last path component of a slash-separated string.
pub fn path_basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Replace the extension of a file name with `.png`.
pub fn with_png_extension(name: &str) -> String {
    match name.rfind('.') {
        Some(idx) => format!("{}.png", &name[..idx]),
        None => format!("{}.png", name),
    }
}

pub mod error {
    use snafu::Snafu;
    use std::path::PathBuf;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to create directory '{}': {}", path.display(), source))]
        CreateDir {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to create '{}': {}", path.display(), source))]
        Create {
            path: PathBuf,
            source: std::io::Error,
        },

        #[snafu(display("Failed to write '{}': {}", path.display(), source))]
        Write {
            path: PathBuf,
            source: std::io::Error,
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn escapes_markup_characters() {
        assert_eq!(
            escape_xml("a <b> & \"c\" 'd'"),
            "a &lt;b&gt; &amp; &quot;c&quot; &apos;d&apos;"
        );
        assert_eq!(escape_xml("plain"), "plain");
    }

    #[test]
    fn basename_of_paths() {
        assert_eq!(path_basename("/usr/share/pixmaps/foo.png"), "foo.png");
        assert_eq!(path_basename("foo.png"), "foo.png");
    }

    #[test]
    fn png_extension_replacement() {
        assert_eq!(with_png_extension("foo.svgz"), "foo.png");
        assert_eq!(with_png_extension("foo"), "foo.png");
        assert_eq!(with_png_extension("a.b.c.xpm"), "a.b.c.png");
    }

    #[test]
    fn gzip_output_is_reproducible() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.gz");
        let b = dir.path().join("b.gz");
        write_gzip(&a, b"catalog data").unwrap();
        write_gzip(&b, b"catalog data").unwrap();
        assert_eq!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
    }
}
