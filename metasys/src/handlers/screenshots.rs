/*!
Screenshot and video processing.

Upstream screenshot images are downloaded, re-encoded as PNG sources and
scaled into a fixed thumbnail ladder. Videos are probed with `ffprobe` and
accepted only as WebM/Matroska containers carrying AV1 or VP9 video and, at
most, Opus audio, below a configured size limit.

Like icon handling this runs in two phases: `fetch` pulls the remote bytes
so they can enter the component fingerprint, `store` writes media under the
final global id and rewrites the component's screenshot entries.
*/

use crate::common::{write_atomic, path_basename};
use crate::component::{Component, Image, ImageKind, Screenshot, Video};
use crate::hint_vars;
use crate::hints::Hint;
use crate::render::{RasterFormat, Rasterizer};
use log::debug;
use serde::Deserialize;
use snafu::ResultExt;
use std::io::Write;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use url::Url;

type Result<T> = std::result::Result<T, error::Error>;

/// Thumbnail ladder; only downscales are produced.
const THUMBNAIL_SIZES: &[(u32, u32)] = &[(1248, 702), (752, 423), (624, 351), (224, 126)];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_ATTEMPTS: usize = 5;

const ALLOWED_CONTAINERS: &[&str] = &["webm", "matroska"];
const ALLOWED_VIDEO_CODECS: &[&str] = &["av1", "vp9"];
const ALLOWED_AUDIO_CODECS: &[&str] = &["opus"];

/// Scale (width, height) to fit into a target box, never enlarging.
fn fit_size(width: u32, height: u32, max_width: u32, max_height: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || (width <= max_width && height <= max_height) {
        return None;
    }
    let scale = f64::min(
        f64::from(max_width) / f64::from(width),
        f64::from(max_height) / f64::from(height),
    );
    let w = (f64::from(width) * scale).round().max(1.0) as u32;
    let h = (f64::from(height) * scale).round().max(1.0) as u32;
    Some((w, h))
}

/// The relevant parts of `ffprobe -print_format json` output.
#[derive(Debug, Deserialize)]
struct ProbeDoc {
    format: ProbeFormat,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    format_name: String,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: String,
    codec_name: String,
}

/// A probed, policy-checked video.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoInfo {
    pub container: String,
    pub codec: String,
}

/// Validate ffprobe output against the accepted container/codec set.
fn check_probe(doc: &ProbeDoc) -> std::result::Result<VideoInfo, String> {
    let container = ALLOWED_CONTAINERS
        .iter()
        .find(|c| doc.format.format_name.contains(*c))
        .ok_or_else(|| format!("container '{}' is not allowed", doc.format.format_name))?;

    let mut codec = None;
    for stream in &doc.streams {
        match stream.codec_type.as_str() {
            "video" => {
                if !ALLOWED_VIDEO_CODECS.contains(&stream.codec_name.as_str()) {
                    return Err(format!("video codec '{}' is not allowed", stream.codec_name));
                }
                codec.get_or_insert(stream.codec_name.clone());
            }
            "audio" => {
                if !ALLOWED_AUDIO_CODECS.contains(&stream.codec_name.as_str()) {
                    return Err(format!("audio codec '{}' is not allowed", stream.codec_name));
                }
            }
            _ => {}
        }
    }
    let codec = codec.ok_or_else(|| "no video stream found".to_string())?;
    Ok(VideoInfo {
        container: container.to_string(),
        codec,
    })
}

/// One downloaded screenshot with its probed source dimensions.
#[derive(Debug)]
pub struct FetchedImage {
    pub url: String,
    pub data: Vec<u8>,
    pub format: RasterFormat,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug)]
pub struct FetchedVideo {
    pub url: String,
    pub data: Vec<u8>,
    pub info: VideoInfo,
}

/// Everything fetched for one screenshot entry.
#[derive(Debug, Default)]
pub struct FetchedShot {
    pub default: bool,
    pub captions: crate::component::TranslatedString,
    pub images: Vec<FetchedImage>,
    pub videos: Vec<FetchedVideo>,
}

/// All fetched screenshot media of a component.
#[derive(Debug, Default)]
pub struct FetchedShots {
    pub shots: Vec<FetchedShot>,
}

impl FetchedShots {
    pub fn is_empty(&self) -> bool {
        self.shots.is_empty()
    }

    /// Media bytes entering the component fingerprint, in URL order.
    pub fn fingerprint_parts(&self) -> Vec<Vec<u8>> {
        let mut entries: Vec<(&str, &Vec<u8>)> = Vec::new();
        for shot in &self.shots {
            for image in &shot.images {
                entries.push((&image.url, &image.data));
            }
            for video in &shot.videos {
                entries.push((&video.url, &video.data));
            }
        }
        entries.sort_by_key(|(url, _)| *url);
        entries.iter().map(|(_, data)| (*data).clone()).collect()
    }
}

pub struct ScreenshotHandler<'a> {
    client: reqwest::blocking::Client,
    rasterizer: &'a dyn Rasterizer,
    media_dir: PathBuf,
    media_base_url: Url,
    store_screenshots: bool,
    process_videos: bool,
    max_video_bytes: u64,
    ffprobe: Option<PathBuf>,
}

impl<'a> ScreenshotHandler<'a> {
    pub fn new(
        rasterizer: &'a dyn Rasterizer,
        media_dir: PathBuf,
        media_base_url: Url,
        store_screenshots: bool,
        process_videos: bool,
        max_video_mib: u64,
    ) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .build()
            .context(error::ClientSnafu)?;
        let ffprobe = which::which("ffprobe").ok();
        if process_videos && ffprobe.is_none() {
            debug!("ffprobe not found, screenshot videos will be rejected");
        }
        Ok(Self {
            client,
            rasterizer,
            media_dir,
            media_base_url,
            store_screenshots,
            process_videos,
            max_video_bytes: max_video_mib * 1024 * 1024,
            ffprobe,
        })
    }

    fn download(&self, url: &str) -> std::result::Result<Vec<u8>, String> {
        let mut last_error = String::new();
        for attempt in 1..=DOWNLOAD_ATTEMPTS {
            match self.try_download(url) {
                Ok(data) => return Ok(data),
                Err(e) => {
                    debug!("Download attempt {} for '{}' failed: {}", attempt, url, e);
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    fn try_download(&self, url: &str) -> std::result::Result<Vec<u8>, String> {
        let response = self.client.get(url).send().map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("HTTP status {}", status));
        }
        let data = response.bytes().map_err(|e| e.to_string())?;
        Ok(data.to_vec())
    }

    fn probe_video(&self, data: &[u8]) -> std::result::Result<VideoInfo, String> {
        let Some(ffprobe) = &self.ffprobe else {
            return Err("ffprobe is not available".to_string());
        };
        let mut tmp = tempfile::NamedTempFile::new().map_err(|e| e.to_string())?;
        tmp.write_all(data).map_err(|e| e.to_string())?;
        let output = Command::new(ffprobe)
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(tmp.path())
            .output()
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(format!("ffprobe exited with {}", output.status));
        }
        let doc: ProbeDoc =
            serde_json::from_slice(&output.stdout).map_err(|e| e.to_string())?;
        check_probe(&doc)
    }

    /// Download every screenshot image and video of the component. The
    /// component itself is untouched; hints report failed entries.
    pub fn fetch(&self, cpt: &Component) -> (FetchedShots, Vec<Hint>) {
        let mut hints = Vec::new();
        let mut fetched = FetchedShots::default();

        for shot in &cpt.screenshots {
            let mut out = FetchedShot {
                default: shot.default,
                captions: shot.captions.clone(),
                ..Default::default()
            };
            if let Some(source) = shot.source_image() {
                match self.fetch_image(&source.url) {
                    Ok(image) => out.images.push(image),
                    Err(hint) => hints.push(hint),
                }
            }
            if self.process_videos {
                for video in &shot.videos {
                    match self.fetch_video(&video.url) {
                        Ok(video) => out.videos.push(video),
                        Err(hint) => hints.push(hint),
                    }
                }
            }
            if !out.images.is_empty() || !out.videos.is_empty() {
                fetched.shots.push(out);
            }
        }
        (fetched, hints)
    }

    fn fetch_image(&self, url: &str) -> std::result::Result<FetchedImage, Hint> {
        let data = self.download(url).map_err(|e| {
            Hint::new(
                "screenshot-download-error",
                hint_vars! { "url" => url, "error" => e },
            )
        })?;
        let format = RasterFormat::from_path(url)
            .or_else(|| RasterFormat::guess(&data))
            .ok_or_else(|| {
                Hint::new(
                    "screenshot-save-error",
                    hint_vars! { "url" => url, "error" => "unrecognized image format" },
                )
            })?;
        let info = self.rasterizer.probe(&data, format).map_err(|e| {
            Hint::new(
                "screenshot-save-error",
                hint_vars! { "url" => url, "error" => e },
            )
        })?;
        Ok(FetchedImage {
            url: url.to_string(),
            data,
            format,
            width: info.width,
            height: info.height,
        })
    }

    fn fetch_video(&self, url: &str) -> std::result::Result<FetchedVideo, Hint> {
        let data = self.download(url).map_err(|e| {
            Hint::new(
                "screenshot-download-error",
                hint_vars! { "url" => url, "error" => e },
            )
        })?;
        if data.len() as u64 > self.max_video_bytes {
            return Err(Hint::new(
                "video-too-big",
                hint_vars! {
                    "url" => url,
                    "max_size" => self.max_video_bytes / (1024 * 1024),
                },
            ));
        }
        let info = self.probe_video(&data).map_err(|reason| {
            if reason.contains("not allowed") || reason.contains("no video stream") {
                Hint::new(
                    "video-format-unsupported",
                    hint_vars! { "url" => url, "reason" => reason },
                )
            } else {
                Hint::new(
                    "video-probe-error",
                    hint_vars! { "url" => url, "error" => reason },
                )
            }
        })?;
        Ok(FetchedVideo {
            url: url.to_string(),
            data,
            info,
        })
    }

    /// Write media for the fetched screenshots and replace the component's
    /// screenshot entries with catalog-ready ones.
    pub fn store(&self, cpt: &mut Component, gcid: &str, fetched: &FetchedShots) -> Vec<Hint> {
        let mut hints = Vec::new();
        let mut shots = Vec::new();

        for (index, shot) in fetched.shots.iter().enumerate() {
            let number = index + 1;
            let mut out = Screenshot {
                default: shot.default,
                captions: shot.captions.clone(),
                ..Default::default()
            };
            for image in &shot.images {
                match self.store_image(gcid, number, image, &mut out) {
                    Ok(()) => {}
                    Err(e) => hints.push(Hint::new(
                        "screenshot-save-error",
                        hint_vars! { "url" => image.url, "error" => e },
                    )),
                }
            }
            for video in &shot.videos {
                match self.store_video(gcid, video, &mut out) {
                    Ok(()) => {}
                    Err(e) => hints.push(Hint::new(
                        "screenshot-save-error",
                        hint_vars! { "url" => video.url, "error" => e },
                    )),
                }
            }
            if !out.images.is_empty() || !out.videos.is_empty() {
                shots.push(out);
            }
        }

        // First screenshot is the default if none was marked.
        if !shots.is_empty() && !shots.iter().any(|s| s.default) {
            shots[0].default = true;
        }
        cpt.screenshots = shots;
        hints
    }

    fn media_url(&self, gcid: &str, kind: &str, filename: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.media_base_url.as_str().trim_end_matches('/'),
            gcid,
            kind,
            filename
        )
    }

    fn store_image(
        &self,
        gcid: &str,
        number: usize,
        image: &FetchedImage,
        out: &mut Screenshot,
    ) -> std::result::Result<(), String> {
        if !self.store_screenshots {
            // Pass-through mode: reference upstream, but with known dims.
            out.images.push(Image {
                kind: ImageKind::Source,
                url: image.url.clone(),
                width: Some(image.width),
                height: Some(image.height),
            });
            return Ok(());
        }

        let shots_dir = self.media_dir.join(gcid).join("screenshots");
        let source_name = format!("image-{}_source.png", number);
        let source_png = self
            .rasterizer
            .render_png(&image.data, image.format, image.width, image.height)
            .map_err(|e| e.to_string())?;
        write_atomic(shots_dir.join(&source_name), &source_png).map_err(|e| e.to_string())?;
        out.images.push(Image {
            kind: ImageKind::Source,
            url: self.media_url(gcid, "screenshots", &source_name),
            width: Some(image.width),
            height: Some(image.height),
        });

        for (max_w, max_h) in THUMBNAIL_SIZES {
            let Some((w, h)) = fit_size(image.width, image.height, *max_w, *max_h) else {
                continue;
            };
            let thumb_name = format!("image-{}_{}x{}.png", number, w, h);
            let png = self
                .rasterizer
                .render_png(&image.data, image.format, w, h)
                .map_err(|e| e.to_string())?;
            write_atomic(shots_dir.join(&thumb_name), &png).map_err(|e| e.to_string())?;
            out.images.push(Image {
                kind: ImageKind::Thumbnail,
                url: self.media_url(gcid, "screenshots", &thumb_name),
                width: Some(w),
                height: Some(h),
            });
        }
        Ok(())
    }

    fn store_video(
        &self,
        gcid: &str,
        video: &FetchedVideo,
        out: &mut Screenshot,
    ) -> std::result::Result<(), String> {
        let url = if self.store_screenshots {
            let basename = path_basename(video.url.split('?').next().unwrap_or(&video.url));
            let filename = if basename.is_empty() {
                "video.webm".to_string()
            } else {
                basename.to_string()
            };
            let dest = self.media_dir.join(gcid).join("videos").join(&filename);
            write_atomic(&dest, &video.data).map_err(|e| e.to_string())?;
            self.media_url(gcid, "videos", &filename)
        } else {
            video.url.clone()
        };
        out.videos.push(Video {
            url,
            container: Some(video.info.container.clone()),
            codec: Some(video.info.codec.clone()),
        });
        Ok(())
    }
}

pub mod error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub(super)))]
    pub enum Error {
        #[snafu(display("Failed to build HTTP client: {}", source))]
        Client { source: reqwest::Error },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::component::ComponentKind;
    use crate::icons::test_support::FakeRasterizer;

    #[test]
    fn fit_size_only_downscales() {
        // Smaller than every target box: no thumbnail.
        assert_eq!(fit_size(600, 300, 1248, 702), None);
        // 16:9 source scales into the ladder boxes.
        assert_eq!(fit_size(1920, 1080, 1248, 702), Some((1248, 702)));
        assert_eq!(fit_size(1920, 1080, 624, 351), Some((624, 351)));
        // Odd aspect ratios fit the limiting edge.
        assert_eq!(fit_size(2000, 500, 1248, 702), Some((1248, 312)));
        assert_eq!(fit_size(0, 0, 1248, 702), None);
    }

    fn probe_doc(container: &str, streams: &[(&str, &str)]) -> ProbeDoc {
        ProbeDoc {
            format: ProbeFormat {
                format_name: container.to_string(),
            },
            streams: streams
                .iter()
                .map(|(t, c)| ProbeStream {
                    codec_type: t.to_string(),
                    codec_name: c.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn probe_checks_accept_good_videos() {
        let doc = probe_doc("matroska,webm", &[("video", "vp9"), ("audio", "opus")]);
        let info = check_probe(&doc).unwrap();
        assert_eq!(info.container, "webm");
        assert_eq!(info.codec, "vp9");

        let doc = probe_doc("matroska", &[("video", "av1")]);
        assert!(check_probe(&doc).is_ok());
    }

    #[test]
    fn probe_checks_reject_bad_videos() {
        let doc = probe_doc("mp4", &[("video", "h264")]);
        assert!(check_probe(&doc).unwrap_err().contains("container"));

        let doc = probe_doc("webm", &[("video", "h264")]);
        assert!(check_probe(&doc).unwrap_err().contains("video codec"));

        let doc = probe_doc("webm", &[("video", "vp9"), ("audio", "mp3")]);
        assert!(check_probe(&doc).unwrap_err().contains("audio codec"));

        let doc = probe_doc("webm", &[("audio", "opus")]);
        assert!(check_probe(&doc).unwrap_err().contains("no video stream"));
    }

    #[test]
    fn ffprobe_json_shape_deserializes() {
        let json = r#"{
            "format": {"format_name": "matroska,webm", "duration": "12.5"},
            "streams": [
                {"codec_type": "video", "codec_name": "vp9", "width": 1280},
                {"codec_type": "audio", "codec_name": "opus"}
            ]
        }"#;
        let doc: ProbeDoc = serde_json::from_str(json).unwrap();
        assert!(check_probe(&doc).is_ok());
    }

    #[test]
    fn store_writes_source_and_ladder() {
        let media = tempfile::tempdir().unwrap();
        let raster = FakeRasterizer;
        let handler = ScreenshotHandler::new(
            &raster,
            media.path().to_path_buf(),
            Url::parse("https://media.example.org").unwrap(),
            true,
            false,
            100,
        )
        .unwrap();

        let mut cpt = Component::new(ComponentKind::DesktopApp, "org.example.app");
        let fetched = FetchedShots {
            shots: vec![FetchedShot {
                default: false,
                captions: Default::default(),
                images: vec![FetchedImage {
                    url: "https://example.org/shot.png".to_string(),
                    data: FakeRasterizer::image(1920, 1080),
                    format: RasterFormat::Png,
                    width: 1920,
                    height: 1080,
                }],
                videos: Vec::new(),
            }],
        };
        let hints = handler.store(&mut cpt, "org/example/app/AA", &fetched);
        assert!(hints.is_empty());
        assert_eq!(cpt.screenshots.len(), 1);
        let shot = &cpt.screenshots[0];
        assert!(shot.default);
        let source = shot.source_image().unwrap();
        assert_eq!(
            source.url,
            "https://media.example.org/org/example/app/AA/screenshots/image-1_source.png"
        );
        // All four ladder sizes downscale from 1920x1080.
        let thumbs: Vec<&Image> = shot
            .images
            .iter()
            .filter(|i| i.kind == ImageKind::Thumbnail)
            .collect();
        assert_eq!(thumbs.len(), 4);
        assert!(media
            .path()
            .join("org/example/app/AA/screenshots/image-1_624x351.png")
            .is_file());
    }

    #[test]
    fn pass_through_mode_keeps_upstream_urls() {
        let media = tempfile::tempdir().unwrap();
        let raster = FakeRasterizer;
        let handler = ScreenshotHandler::new(
            &raster,
            media.path().to_path_buf(),
            Url::parse("https://media.example.org").unwrap(),
            false,
            false,
            100,
        )
        .unwrap();
        let mut cpt = Component::new(ComponentKind::DesktopApp, "org.example.app");
        let fetched = FetchedShots {
            shots: vec![FetchedShot {
                default: true,
                captions: Default::default(),
                images: vec![FetchedImage {
                    url: "https://example.org/shot.png".to_string(),
                    data: FakeRasterizer::image(800, 450),
                    format: RasterFormat::Png,
                    width: 800,
                    height: 450,
                }],
                videos: Vec::new(),
            }],
        };
        handler.store(&mut cpt, "org/example/app/AA", &fetched);
        let source = cpt.screenshots[0].source_image().unwrap();
        assert_eq!(source.url, "https://example.org/shot.png");
        assert_eq!(source.width, Some(800));
        // Nothing was written to the media pool.
        assert!(!media.path().join("org/example/app/AA").exists());
    }

    #[test]
    fn fingerprint_parts_are_sorted_by_url() {
        let fetched = FetchedShots {
            shots: vec![FetchedShot {
                default: true,
                captions: Default::default(),
                images: vec![
                    FetchedImage {
                        url: "https://b.example.org/2.png".to_string(),
                        data: b"two".to_vec(),
                        format: RasterFormat::Png,
                        width: 1,
                        height: 1,
                    },
                    FetchedImage {
                        url: "https://a.example.org/1.png".to_string(),
                        data: b"one".to_vec(),
                        format: RasterFormat::Png,
                        width: 1,
                        height: 1,
                    },
                ],
                videos: Vec::new(),
            }],
        };
        assert_eq!(
            fetched.fingerprint_parts(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }
}
