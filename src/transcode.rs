//! HLS manifest to single-file MP4 conversion through ffmpeg.
//!
//! The transcoder only ever writes its output file. Deleting it is the
//! caller's responsibility, on success and on failure alike.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use tokio::{process::Command, sync::Semaphore, time::timeout};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::pricing::Quality;

pub const OUTPUT_PREFIX: &str = "hls-";

#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("ffmpeg is not available: {0}")]
    Unavailable(String),

    #[error("ffmpeg exited with {status}: {message}")]
    Failed { status: String, message: String },

    #[error("ffmpeg did not finish within {0:?}")]
    TimedOut(Duration),

    #[error("could not run ffmpeg: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct Transcoder {
    ffmpeg_path: String,
    output_dir: PathBuf,
    attempt_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl Transcoder {
    pub fn new(
        ffmpeg_path: impl Into<String>,
        output_dir: impl Into<PathBuf>,
        attempt_timeout: Duration,
        max_concurrent: usize,
    ) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            output_dir: output_dir.into(),
            attempt_timeout,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// A fresh, not yet existing output path.
    pub fn allocate_output(&self) -> PathBuf {
        self.output_dir
            .join(format!("{OUTPUT_PREFIX}{}.mp4", Uuid::new_v4()))
    }

    /// Convert `manifest_url` into `output`. `high` first tries a lossless
    /// stream copy; every tier ends with its re-encode profile.
    pub async fn convert(
        &self,
        manifest_url: &str,
        quality: Quality,
        output: &Path,
    ) -> Result<(), TranscodeError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| TranscodeError::Unavailable("transcoder is shutting down".to_string()))?;

        if quality == Quality::High {
            match self.run(&stream_copy_args(manifest_url, output)).await {
                Ok(()) => {
                    info!("Stream-copied {manifest_url} without re-encoding");
                    return Ok(());
                }
                Err(TranscodeError::Unavailable(message)) => {
                    return Err(TranscodeError::Unavailable(message));
                }
                Err(error) => {
                    warn!("Stream copy of {manifest_url} failed, re-encoding instead: {error}");
                }
            }
        }

        self.run(&reencode_args(manifest_url, quality, output)).await?;
        info!("Re-encoded {manifest_url} at {} quality", quality.as_str());
        Ok(())
    }

    async fn run(&self, args: &[String]) -> Result<(), TranscodeError> {
        debug!(ffmpeg = %self.ffmpeg_path, ?args, "starting ffmpeg");
        let command_future = Command::new(&self.ffmpeg_path)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = timeout(self.attempt_timeout, command_future)
            .await
            .map_err(|_| TranscodeError::TimedOut(self.attempt_timeout))?
            .map_err(|error| {
                if error.kind() == ErrorKind::NotFound {
                    TranscodeError::Unavailable(format!("{} not found", self.ffmpeg_path))
                } else {
                    TranscodeError::Io(error)
                }
            })?;

        if !output.status.success() {
            return Err(TranscodeError::Failed {
                status: output.status.to_string(),
                message: last_stderr_line(&output.stderr),
            });
        }

        Ok(())
    }
}

fn last_stderr_line(stderr: &[u8]) -> String {
    String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("ffmpeg failed without output")
        .to_string()
}

fn to_args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(ToString::to_string).collect()
}

fn input_args(manifest_url: &str) -> Vec<String> {
    to_args(&["-hide_banner", "-loglevel", "error", "-y", "-i", manifest_url])
}

fn output_args(output: &Path) -> Vec<String> {
    vec![
        "-f".to_string(),
        "mp4".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

pub fn stream_copy_args(manifest_url: &str, output: &Path) -> Vec<String> {
    let mut args = input_args(manifest_url);
    args.extend(to_args(&["-c:v", "copy", "-c:a", "copy", "-movflags", "+faststart"]));
    args.extend(output_args(output));
    args
}

/// Re-encode profile per tier. These values are part of the output contract.
pub fn quality_profile(quality: Quality) -> &'static [&'static str] {
    match quality {
        Quality::Low => &[
            "-movflags", "+faststart", "-preset", "veryfast", "-crf", "30", "-b:v", "1200k",
            "-maxrate", "1200k", "-bufsize", "2400k", "-b:a", "96k",
        ],
        Quality::Medium => &[
            "-movflags", "+faststart", "-preset", "veryfast", "-crf", "23", "-b:a", "128k",
        ],
        Quality::High => &[
            "-movflags", "+faststart", "-preset", "fast", "-crf", "18", "-b:a", "160k",
        ],
    }
}

pub fn reencode_args(manifest_url: &str, quality: Quality, output: &Path) -> Vec<String> {
    let mut args = input_args(manifest_url);
    args.extend(to_args(&["-c:v", "libx264", "-c:a", "aac"]));
    args.extend(to_args(quality_profile(quality)));
    args.extend(output_args(output));
    args
}

/// Remove transcoder leftovers older than `older_than`, e.g. after a crash.
pub async fn cleanup_stale_outputs(output_dir: &Path, older_than: Duration) {
    let mut entries = match tokio::fs::read_dir(output_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open {:?} for cleanup: {error}", output_dir);
            }
            return;
        }
    };

    let now = std::time::SystemTime::now();
    let mut removed = 0usize;

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate {:?} for cleanup: {error}", output_dir);
                break;
            }
        };

        let path = entry.path();
        let is_output = path
            .file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.starts_with(OUTPUT_PREFIX) && name.ends_with(".mp4"));
        if !is_output {
            continue;
        }

        let age = entry
            .metadata()
            .await
            .and_then(|metadata| metadata.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .unwrap_or_default();
        if age < older_than {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove stale output {:?}: {error}", path),
        }
    }

    if removed > 0 {
        info!("Removed {removed} stale transcoder output(s) from {:?}", output_dir);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn joined(args: &[String]) -> String {
        args.join(" ")
    }

    /// An ffmpeg stand-in that logs every invocation, refuses stream copies
    /// and otherwise writes a fixed payload to its last argument.
    #[cfg(unix)]
    fn fake_ffmpeg(dir: &Path) -> (String, PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("fake-ffmpeg");
        let log = dir.join("ffmpeg.log");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 echo \"$*\" >> '{}'\n\
                 for last; do :; done\n\
                 case \" $* \" in *\" copy \"*) echo 'copy not possible' >&2; exit 1 ;; esac\n\
                 printf transcoded > \"$last\"\n",
                log.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.to_string_lossy().into_owned(), log)
    }

    fn logged_calls(log: &Path) -> Vec<String> {
        std::fs::read_to_string(log)
            .unwrap()
            .lines()
            .map(ToString::to_string)
            .collect()
    }

    #[test]
    fn profiles_match_the_published_tiers() {
        assert_eq!(
            quality_profile(Quality::Low).join(" "),
            "-movflags +faststart -preset veryfast -crf 30 -b:v 1200k -maxrate 1200k -bufsize 2400k -b:a 96k"
        );
        assert_eq!(
            quality_profile(Quality::Medium).join(" "),
            "-movflags +faststart -preset veryfast -crf 23 -b:a 128k"
        );
        assert_eq!(
            quality_profile(Quality::High).join(" "),
            "-movflags +faststart -preset fast -crf 18 -b:a 160k"
        );
    }

    #[test]
    fn stream_copy_never_reencodes() {
        let args = stream_copy_args("https://cdn.example/a.m3u8", Path::new("/tmp/out.mp4"));
        let line = joined(&args);
        assert!(line.contains("-i https://cdn.example/a.m3u8"));
        assert!(line.contains("-c:v copy -c:a copy -movflags +faststart"));
        assert!(!line.contains("libx264"));
        assert!(line.ends_with("-f mp4 /tmp/out.mp4"));
    }

    #[test]
    fn reencode_uses_h264_aac_and_the_profile() {
        let args = reencode_args(
            "https://cdn.example/a.m3u8",
            Quality::Medium,
            Path::new("/tmp/out.mp4"),
        );
        let line = joined(&args);
        assert!(line.contains("-c:v libx264 -c:a aac -movflags +faststart -preset veryfast -crf 23 -b:a 128k"));
        assert!(line.ends_with("-f mp4 /tmp/out.mp4"));
    }

    #[test]
    fn outputs_are_unique_and_prefixed() {
        let transcoder = Transcoder::new("ffmpeg", "/tmp/transfers", Duration::from_secs(1), 1);
        let first = transcoder.allocate_output();
        let second = transcoder.allocate_output();
        assert_ne!(first, second);
        assert!(first.starts_with("/tmp/transfers"));
        let name = first.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(OUTPUT_PREFIX) && name.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn missing_binary_is_reported_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let transcoder = Transcoder::new(
            "/definitely/not/a/real/ffmpeg",
            dir.path(),
            Duration::from_secs(5),
            1,
        );
        let output = transcoder.allocate_output();

        let error = transcoder
            .convert("https://cdn.example/a.m3u8", Quality::High, &output)
            .await
            .unwrap_err();
        assert!(matches!(error, TranscodeError::Unavailable(_)));
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn stale_cleanup_only_touches_transcoder_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("hls-old.mp4");
        let unrelated = dir.path().join("keep.mp4");
        std::fs::write(&output, b"x").unwrap();
        std::fs::write(&unrelated, b"y").unwrap();

        cleanup_stale_outputs(dir.path(), Duration::ZERO).await;

        assert!(!output.exists());
        assert!(unrelated.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_stream_copy_falls_back_to_reencoding() {
        let dir = tempfile::tempdir().unwrap();
        let (ffmpeg, log) = fake_ffmpeg(dir.path());
        let transcoder = Transcoder::new(ffmpeg, dir.path(), Duration::from_secs(10), 1);
        let output = transcoder.allocate_output();

        transcoder
            .convert("https://cdn.example/a.m3u8", Quality::High, &output)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&output).unwrap(), b"transcoded");
        let calls = logged_calls(&log);
        assert_eq!(calls.len(), 2);
        assert!(calls[0].contains("-c:v copy -c:a copy"));
        assert!(calls[1].contains("-c:v libx264 -c:a aac"));
        assert!(calls[1].contains("-preset fast -crf 18 -b:a 160k"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn lower_tiers_go_straight_to_reencoding() {
        let dir = tempfile::tempdir().unwrap();
        let (ffmpeg, log) = fake_ffmpeg(dir.path());
        let transcoder = Transcoder::new(ffmpeg, dir.path(), Duration::from_secs(10), 1);
        let output = transcoder.allocate_output();

        transcoder
            .convert("https://cdn.example/a.m3u8", Quality::Low, &output)
            .await
            .unwrap();

        let calls = logged_calls(&log);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].contains("-crf 30"));
        assert!(!calls[0].contains("copy"));
    }
}
