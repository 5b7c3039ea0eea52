//! A concrete `Downloader` that shells out to `yt-dlp` for video downloads.
//! The `Downloader` trait is the stable contract; this is one reasonable
//! implementation satisfying it.

use std::path::Path;
use std::time::Instant;

use chrono::SecondsFormat;
use tracing::{Level, event};

use crate::downloader::{DownloadResult, Downloader, is_retryable_x_error};
use crate::url_classifier::Platform;

pub struct YtDlpDownloader;

impl YtDlpDownloader {
    fn run_once(&self, input_url: &str, tmp_dir: &Path, debug: bool, extractor_args: Option<&str>) -> anyhow::Result<std::process::Output> {
        let mut cmd = std::process::Command::new("yt-dlp");
        cmd.env_clear()
            .current_dir(tmp_dir)
            .arg("--no-playlist")
            .arg("--socket-timeout")
            .arg("30")
            .arg("--output")
            .arg(tmp_dir.join("download.%(ext)s"));

        if debug {
            cmd.arg("--format").arg("worst");
        } else {
            cmd.arg("--format").arg("bestvideo*+bestaudio/best").arg("--merge-output-format").arg("mp4");
        }

        if let Some(args) = extractor_args {
            cmd.arg("--extractor-args").arg(format!("twitter:api={args}"));
        }

        cmd.arg(input_url);
        Ok(cmd.output()?)
    }
}

impl Downloader for YtDlpDownloader {
    fn download(&self, input_url: &str, platform: Platform, downloads_dir: &Path, debug: bool) -> anyhow::Result<DownloadResult> {
        std::fs::create_dir_all(downloads_dir)?;
        let tmp_dir = downloads_dir.join(format!("tmp-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&tmp_dir)?;

        let attempts: &[Option<&str>] = if platform == Platform::X {
            &[None, Some("legacy"), Some("syndication")]
        } else {
            &[None]
        };

        let start = Instant::now();
        let mut last_stderr = String::new();
        let mut output = None;
        for extractor_args in attempts {
            let attempt = self.run_once(input_url, &tmp_dir, debug, *extractor_args)?;
            if attempt.status.success() {
                output = Some(attempt);
                break;
            }
            last_stderr = String::from_utf8_lossy(&attempt.stderr).into_owned();
            if !is_retryable_x_error(&last_stderr) {
                break;
            }
            event!(Level::DEBUG, "Retrying {input_url} with extractor_args={extractor_args:?}");
        }

        let Some(_) = output else {
            let _ = std::fs::remove_dir_all(&tmp_dir);
            return Err(anyhow::anyhow!(last_stderr));
        };

        let downloaded = std::fs::read_dir(&tmp_dir)?
            .filter_map(std::result::Result::ok)
            .find(|entry| entry.file_name().to_string_lossy().starts_with("download."))
            .ok_or_else(|| anyhow::anyhow!("yt-dlp reported success but no output file was found"))?;

        let metadata = downloaded.metadata()?;
        let final_path = downloads_dir.join(downloaded.file_name());
        std::fs::rename(downloaded.path(), &final_path)?;
        let _ = std::fs::remove_dir_all(&tmp_dir);

        Ok(DownloadResult {
            file_path: final_path.display().to_string(),
            file_size_bytes: metadata.len(),
            duration_sec: start.elapsed().as_secs_f64(),
            platform,
            downloaded_at: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
        })
    }
}
