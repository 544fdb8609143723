//! Video-platform extraction through yt-dlp: metadata, thumbnail lookup,
//! quality-bracketed format choice and streaming the chosen format.

use std::{io::ErrorKind, process::Stdio, time::Duration};

use serde::Deserialize;
use tokio::{
    process::{Child, ChildStdout, Command},
    time::timeout,
};
use tracing::debug;
use url::Url;

use crate::pricing::Quality;

const PLATFORM_DOMAINS: [&str; 2] = ["youtube.com", "youtu.be"];
const FALLBACK_SELECTOR: &str = "best[vcodec!=none][acodec!=none]/best";

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("yt-dlp is not available: {0}")]
    Unavailable(String),

    #[error("yt-dlp failed: {0}")]
    Failed(String),

    #[error("yt-dlp did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("unreadable yt-dlp metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("could not run yt-dlp: {0}")]
    Io(std::io::Error),
}

#[derive(Debug, Deserialize)]
pub struct VideoInfo {
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub thumbnails: Vec<Thumbnail>,
    #[serde(default)]
    pub formats: Vec<VideoFormat>,
}

#[derive(Debug, Deserialize)]
pub struct Thumbnail {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VideoFormat {
    pub format_id: String,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
}

impl VideoInfo {
    /// Largest thumbnail: yt-dlp lists them smallest first.
    pub fn best_thumbnail(&self) -> Option<&str> {
        self.thumbnails
            .last()
            .map(|thumbnail| thumbnail.url.as_str())
            .or(self.thumbnail.as_deref())
    }
}

fn has_video(format: &VideoFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &VideoFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

pub fn is_video_platform_url(input: &str) -> bool {
    Url::parse(input)
        .ok()
        .and_then(|parsed| parsed.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| {
            PLATFORM_DOMAINS
                .iter()
                .any(|domain| host == *domain || host.ends_with(&format!(".{domain}")))
        })
}

/// Pick a muxed (audio+video) format whose height fits the quality bracket.
/// `None` means "let yt-dlp take the best muxed stream".
pub fn pick_format(formats: &[VideoFormat], quality: Quality) -> Option<&VideoFormat> {
    let muxed: Vec<&VideoFormat> = formats
        .iter()
        .filter(|format| has_video(format) && has_audio(format) && format.height.is_some())
        .collect();
    let mp4: Vec<&VideoFormat> = muxed
        .iter()
        .copied()
        .filter(|format| format.ext.as_deref().is_some_and(|ext| ext.contains("mp4")))
        .collect();

    let mut candidates = if mp4.is_empty() { muxed } else { mp4 };
    candidates.sort_by_key(|format| format.height.unwrap_or_default());

    let height = |format: &&VideoFormat| format.height.unwrap_or_default();
    match quality {
        Quality::Low => candidates
            .iter()
            .copied()
            .find(|format| height(format) <= 360)
            .or_else(|| candidates.first().copied()),
        Quality::Medium => candidates
            .iter()
            .copied()
            .rev()
            .find(|format| height(format) <= 720)
            .or_else(|| candidates.get(candidates.len() / 2).copied()),
        Quality::High => candidates.last().copied(),
    }
}

pub fn format_selector(info: &VideoInfo, quality: Quality) -> String {
    pick_format(&info.formats, quality)
        .map(|format| format.format_id.clone())
        .unwrap_or_else(|| FALLBACK_SELECTOR.to_string())
}

/// A running yt-dlp whose stdout carries the media bytes. Dropping it kills
/// the process.
pub struct VideoDownload {
    pub child: Child,
    pub stdout: ChildStdout,
}

#[derive(Clone)]
pub struct VideoExtractor {
    yt_dlp_path: String,
    metadata_timeout: Duration,
}

impl VideoExtractor {
    pub fn new(yt_dlp_path: impl Into<String>, metadata_timeout: Duration) -> Self {
        Self {
            yt_dlp_path: yt_dlp_path.into(),
            metadata_timeout,
        }
    }

    fn map_spawn_error(&self, error: std::io::Error) -> ExtractError {
        if error.kind() == ErrorKind::NotFound {
            ExtractError::Unavailable(format!("{} not found", self.yt_dlp_path))
        } else {
            ExtractError::Io(error)
        }
    }

    pub async fn fetch_info(&self, url: &str) -> Result<VideoInfo, ExtractError> {
        let command_future = Command::new(&self.yt_dlp_path)
            .args(["-J", "--no-playlist", "--no-warnings", url])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(self.metadata_timeout, command_future)
            .await
            .map_err(|_| ExtractError::TimedOut(self.metadata_timeout))?
            .map_err(|error| self.map_spawn_error(error))?;

        if !output.status.success() {
            return Err(ExtractError::Failed(run_error_message(&output.stderr)));
        }

        let info: VideoInfo = serde_json::from_slice(&output.stdout)?;
        debug!(url, formats = info.formats.len(), "fetched video metadata");
        Ok(info)
    }

    /// Start streaming `selector` of `url` to stdout.
    pub fn spawn_download(&self, url: &str, selector: &str) -> Result<VideoDownload, ExtractError> {
        let mut child = Command::new(&self.yt_dlp_path)
            .args([
                "--no-playlist",
                "--no-warnings",
                "--quiet",
                "-f",
                selector,
                "-o",
                "-",
                url,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| self.map_spawn_error(error))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExtractError::Failed("yt-dlp stdout was not captured".to_string()))?;

        Ok(VideoDownload { child, stdout })
    }
}

fn run_error_message(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp could not complete the operation")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format(id: &str, ext: &str, height: Option<u32>, audio: bool) -> VideoFormat {
        VideoFormat {
            format_id: id.to_string(),
            ext: Some(ext.to_string()),
            vcodec: Some("avc1".to_string()),
            acodec: Some(if audio { "mp4a" } else { "none" }.to_string()),
            height,
        }
    }

    fn ladder() -> Vec<VideoFormat> {
        vec![
            format("1080", "mp4", Some(1080), true),
            format("240", "mp4", Some(240), true),
            format("720", "mp4", Some(720), true),
            format("360", "mp4", Some(360), true),
            format("2160-silent", "mp4", Some(2160), false),
            format("480-webm", "webm", Some(480), true),
        ]
    }

    #[test]
    fn platform_detection_is_host_based() {
        assert!(is_video_platform_url("https://www.youtube.com/watch?v=abc"));
        assert!(is_video_platform_url("https://youtu.be/abc"));
        assert!(is_video_platform_url("https://m.youtube.com/watch?v=abc"));
        assert!(!is_video_platform_url("https://notyoutube.com/watch"));
        assert!(!is_video_platform_url("https://cdn.example/youtube.com.mp4"));
    }

    #[test]
    fn low_takes_the_first_format_at_or_under_360p() {
        let formats = ladder();
        assert_eq!(pick_format(&formats, Quality::Low).unwrap().format_id, "240");
    }

    #[test]
    fn medium_takes_the_tallest_format_at_or_under_720p() {
        let formats = ladder();
        assert_eq!(pick_format(&formats, Quality::Medium).unwrap().format_id, "720");
    }

    #[test]
    fn high_takes_the_tallest_muxed_mp4() {
        let formats = ladder();
        assert_eq!(pick_format(&formats, Quality::High).unwrap().format_id, "1080");
    }

    #[test]
    fn brackets_fall_back_when_nothing_fits() {
        let formats = vec![
            format("1440", "mp4", Some(1440), true),
            format("1080", "mp4", Some(1080), true),
            format("2160", "mp4", Some(2160), true),
        ];
        assert_eq!(pick_format(&formats, Quality::Low).unwrap().format_id, "1080");
        assert_eq!(pick_format(&formats, Quality::Medium).unwrap().format_id, "1440");
    }

    #[test]
    fn non_mp4_formats_are_used_only_without_mp4() {
        let formats = vec![format("480-webm", "webm", Some(480), true)];
        assert_eq!(pick_format(&formats, Quality::High).unwrap().format_id, "480-webm");
    }

    #[test]
    fn no_muxed_format_falls_back_to_selector() {
        let info = VideoInfo {
            title: None,
            thumbnail: None,
            thumbnails: Vec::new(),
            formats: vec![format("video-only", "mp4", Some(720), false)],
        };
        assert_eq!(format_selector(&info, Quality::High), FALLBACK_SELECTOR);
    }

    #[test]
    fn metadata_parses_and_picks_the_last_thumbnail() {
        let info: VideoInfo = serde_json::from_value(serde_json::json!({
            "title": "Clip",
            "thumbnail": "https://i.example/default.jpg",
            "thumbnails": [
                {"url": "https://i.example/small.jpg", "height": 90},
                {"url": "https://i.example/large.jpg", "height": 720}
            ],
            "formats": [
                {"format_id": "18", "ext": "mp4", "vcodec": "avc1", "acodec": "mp4a", "height": 360, "fps": 30}
            ]
        }))
        .unwrap();

        assert_eq!(info.best_thumbnail(), Some("https://i.example/large.jpg"));
        assert_eq!(format_selector(&info, Quality::Low), "18");

        let bare: VideoInfo =
            serde_json::from_value(serde_json::json!({"thumbnail": "https://i.example/t.jpg"}))
                .unwrap();
        assert_eq!(bare.best_thumbnail(), Some("https://i.example/t.jpg"));
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_unavailable() {
        let extractor = VideoExtractor::new("/definitely/not/yt-dlp", Duration::from_secs(5));
        let error = extractor
            .fetch_info("https://youtu.be/abc")
            .await
            .unwrap_err();
        assert!(matches!(error, ExtractError::Unavailable(_)));

        let spawn_error = extractor
            .spawn_download("https://youtu.be/abc", "18")
            .err()
            .unwrap();
        assert!(matches!(spawn_error, ExtractError::Unavailable(_)));
    }
}
