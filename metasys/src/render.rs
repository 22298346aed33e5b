/*!
Raster operations behind a trait.

Icon and screenshot processing needs to know source image dimensions and to
produce PNGs at exact target sizes. PNG and JPEG are handled in-process;
SVG/SVGZ and XPM sources are delegated to external command line tools
(`rsvg-convert`, ImageMagick), located once at startup. Tests substitute the
whole trait with a pure fake, so none of the subprocess plumbing runs there.
*/

use flate2::read::GzDecoder;
use image::imageops::FilterType;
use image::ImageFormat;
use lazy_static::lazy_static;
use log::{debug, warn};
use snafu::{ensure, OptionExt, ResultExt};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub use error::Error;
pub type Result<T> = std::result::Result<T, error::Error>;

/// Source image formats accepted anywhere in the generator. `.ico` and
/// `.gif` sources are deliberately absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    Png,
    Jpeg,
    Svg,
    Svgz,
    Xpm,
}

impl RasterFormat {
    /// Derive the format from a file name, `None` for unsupported formats.
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".png") {
            Some(RasterFormat::Png)
        } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
            Some(RasterFormat::Jpeg)
        } else if lower.ends_with(".svgz") {
            Some(RasterFormat::Svgz)
        } else if lower.ends_with(".svg") {
            Some(RasterFormat::Svg)
        } else if lower.ends_with(".xpm") {
            Some(RasterFormat::Xpm)
        } else {
            None
        }
    }

    /// Sniff the format from magic bytes; used for downloads whose URL does
    /// not carry a useful extension.
    pub fn guess(data: &[u8]) -> Option<Self> {
        if data.starts_with(&[0x89, b'P', b'N', b'G']) {
            Some(RasterFormat::Png)
        } else if data.starts_with(&[0xff, 0xd8]) {
            Some(RasterFormat::Jpeg)
        } else if data.starts_with(&[0x1f, 0x8b]) {
            Some(RasterFormat::Svgz)
        } else if data.starts_with(b"/* XPM */") {
            Some(RasterFormat::Xpm)
        } else if data.starts_with(b"<?xml") || data.starts_with(b"<svg") {
            Some(RasterFormat::Svg)
        } else {
            None
        }
    }

    /// Vector formats have no intrinsic pixel size.
    pub fn is_scalable(&self) -> bool {
        matches!(self, RasterFormat::Svg | RasterFormat::Svgz)
    }
}

/// Probed source information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub width: u32,
    pub height: u32,
    pub scalable: bool,
}

/// The raster seam the icon and screenshot handlers run against.
pub trait Rasterizer: Send + Sync {
    fn probe(&self, data: &[u8], format: RasterFormat) -> Result<ImageInfo>;

    /// Produce a PNG of exactly `width` x `height` pixels.
    fn render_png(&self, data: &[u8], format: RasterFormat, width: u32, height: u32)
        -> Result<Vec<u8>>;

    /// Post-process a PNG the generator just stored. The default does
    /// nothing; the production implementation runs `optipng` here.
    fn optimize_stored_png(&self, _path: &Path) {}
}

lazy_static! {
    static ref SVG_WIDTH_RE: regex::Regex =
        regex::Regex::new(r#"width\s*=\s*"(\d+)(?:px)?""#).unwrap();
    static ref SVG_HEIGHT_RE: regex::Regex =
        regex::Regex::new(r#"height\s*=\s*"(\d+)(?:px)?""#).unwrap();
}

/// The production rasterizer: PNG/JPEG via the `image` crate, SVG via
/// `rsvg-convert`, XPM via ImageMagick.
pub struct DefaultRasterizer {
    rsvg_convert: Option<PathBuf>,
    imagemagick: Option<PathBuf>,
    optipng: Option<PathBuf>,
}

impl DefaultRasterizer {
    pub fn new() -> Self {
        let rsvg_convert = which::which("rsvg-convert").ok();
        let imagemagick = which::which("magick")
            .or_else(|_| which::which("convert"))
            .ok();
        let optipng = which::which("optipng").ok();
        if rsvg_convert.is_none() {
            debug!("rsvg-convert not found, SVG icons will be skipped");
        }
        if imagemagick.is_none() {
            debug!("ImageMagick not found, XPM icons will be skipped");
        }
        Self {
            rsvg_convert,
            imagemagick,
            optipng,
        }
    }

    /// Run `optipng` over a stored PNG if the tool is available. Failure to
    /// optimize never fails the pipeline.
    pub fn optimize_png(&self, path: &Path) {
        let Some(optipng) = &self.optipng else {
            return;
        };
        match Command::new(optipng).arg("-o2").arg("-quiet").arg(path).status() {
            Ok(status) if status.success() => {}
            Ok(status) => warn!(
                "optipng exited with {} for '{}'",
                status,
                path.display()
            ),
            Err(e) => warn!("Could not run optipng on '{}': {}", path.display(), e),
        }
    }

    fn decode(data: &[u8], format: RasterFormat) -> Result<image::DynamicImage> {
        let fmt = match format {
            RasterFormat::Png => ImageFormat::Png,
            RasterFormat::Jpeg => ImageFormat::Jpeg,
            _ => return error::NotBitmapSnafu.fail(),
        };
        image::load_from_memory_with_format(data, fmt).context(error::DecodeSnafu)
    }

    fn encode_png(img: &image::DynamicImage) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
            .context(error::EncodeSnafu)?;
        Ok(out)
    }

    fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        GzDecoder::new(data)
            .read_to_end(&mut out)
            .context(error::GunzipSnafu)?;
        Ok(out)
    }

    fn svg_info(data: &[u8]) -> ImageInfo {
        let text = String::from_utf8_lossy(data);
        let width = SVG_WIDTH_RE
            .captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(512);
        let height = SVG_HEIGHT_RE
            .captures(&text)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .unwrap_or(width);
        ImageInfo {
            width,
            height,
            scalable: true,
        }
    }

    /// The `"W H ncolors cpp"` values string of an XPM document.
    fn xpm_info(data: &[u8]) -> Result<ImageInfo> {
        let text = String::from_utf8_lossy(data);
        let values = text
            .split('"')
            .nth(1)
            .context(error::XpmHeaderSnafu)?
            .to_string();
        let mut numbers = values.split_whitespace().filter_map(|n| n.parse::<u32>().ok());
        let width = numbers.next().context(error::XpmHeaderSnafu)?;
        let height = numbers.next().context(error::XpmHeaderSnafu)?;
        Ok(ImageInfo {
            width,
            height,
            scalable: false,
        })
    }

    fn run_tool(tool: &Path, args: &[String], stdin_data: &[u8]) -> Result<Vec<u8>> {
        let tool_name = tool.display().to_string();
        let mut child = Command::new(tool)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context(error::ToolSpawnSnafu { tool: &tool_name })?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(stdin_data)
                .context(error::ToolIoSnafu { tool: &tool_name })?;
        }
        let output = child
            .wait_with_output()
            .context(error::ToolIoSnafu { tool: &tool_name })?;
        ensure!(
            output.status.success(),
            error::ToolFailedSnafu {
                tool: tool_name,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
        );
        Ok(output.stdout)
    }
}

impl Default for DefaultRasterizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Rasterizer for DefaultRasterizer {
    fn optimize_stored_png(&self, path: &Path) {
        self.optimize_png(path);
    }

    fn probe(&self, data: &[u8], format: RasterFormat) -> Result<ImageInfo> {
        match format {
            RasterFormat::Png | RasterFormat::Jpeg => {
                let fmt = if format == RasterFormat::Png {
                    ImageFormat::Png
                } else {
                    ImageFormat::Jpeg
                };
                let mut reader = image::ImageReader::new(Cursor::new(data));
                reader.set_format(fmt);
                let (width, height) = reader.into_dimensions().context(error::DecodeSnafu)?;
                Ok(ImageInfo {
                    width,
                    height,
                    scalable: false,
                })
            }
            RasterFormat::Svg => Ok(Self::svg_info(data)),
            RasterFormat::Svgz => Ok(Self::svg_info(&Self::gunzip(data)?)),
            RasterFormat::Xpm => Self::xpm_info(data),
        }
    }

    fn render_png(
        &self,
        data: &[u8],
        format: RasterFormat,
        width: u32,
        height: u32,
    ) -> Result<Vec<u8>> {
        match format {
            RasterFormat::Png | RasterFormat::Jpeg => {
                let img = Self::decode(data, format)?;
                if img.width() == width && img.height() == height && format == RasterFormat::Png
                {
                    return Ok(data.to_vec());
                }
                let scaled = img.resize_exact(width, height, FilterType::Lanczos3);
                Self::encode_png(&scaled)
            }
            RasterFormat::Svg | RasterFormat::Svgz => {
                let tool = self
                    .rsvg_convert
                    .as_ref()
                    .context(error::ToolMissingSnafu {
                        tool: "rsvg-convert",
                    })?;
                let svg = if format == RasterFormat::Svgz {
                    Self::gunzip(data)?
                } else {
                    data.to_vec()
                };
                let args = vec![
                    "--format".to_string(),
                    "png".to_string(),
                    "--width".to_string(),
                    width.to_string(),
                    "--height".to_string(),
                    height.to_string(),
                ];
                Self::run_tool(tool, &args, &svg)
            }
            RasterFormat::Xpm => {
                let tool = self
                    .imagemagick
                    .as_ref()
                    .context(error::ToolMissingSnafu { tool: "magick" })?;
                let args = vec![
                    "xpm:-".to_string(),
                    "-resize".to_string(),
                    format!("{}x{}!", width, height),
                    "png:-".to_string(),
                ];
                Self::run_tool(tool, &args, data)
            }
        }
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to decode image: {}", source))]
        Decode { source: image::error::ImageError },

        #[snafu(display("Failed to encode PNG: {}", source))]
        Encode { source: image::error::ImageError },

        #[snafu(display("Failed to decompress SVGZ data: {}", source))]
        Gunzip { source: std::io::Error },

        #[snafu(display("A vector or XPM source cannot be decoded in-process"))]
        NotBitmap,

        #[snafu(display("{} failed: {}", tool, stderr))]
        ToolFailed { tool: String, stderr: String },

        #[snafu(display("I/O with {} failed: {}", tool, source))]
        ToolIo {
            tool: String,
            source: std::io::Error,
        },

        #[snafu(display(
            "The '{}' tool is required for this image format but was not found",
            tool
        ))]
        ToolMissing { tool: String },

        #[snafu(display("Failed to spawn {}: {}", tool, source))]
        ToolSpawn {
            tool: String,
            source: std::io::Error,
        },

        #[snafu(display("XPM data has no readable values header"))]
        XpmHeader,
    }
}
