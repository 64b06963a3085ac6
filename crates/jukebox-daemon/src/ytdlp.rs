//! yt-dlp backed [`Downloader`].
//!
//! Audio lands in the cache directory as `<resource id>.<ext>`, so a
//! re-download of the same video overwrites the old file instead of piling
//! up copies.

use anyhow::{Context, Result};
use async_trait::async_trait;
use jukebox_core::collab::Downloader;
use jukebox_core::resource::resource_id;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Metadata and search calls should answer quickly; downloads get longer.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

pub struct YtDlp {
    binary: PathBuf,
    output_dir: PathBuf,
}

impl YtDlp {
    pub fn new(binary: PathBuf, output_dir: PathBuf) -> Self {
        Self { binary, output_dir }
    }

    async fn download_audio(&self, url: &str) -> Result<PathBuf> {
        let base_name = resource_id(url);
        let output_template = format!("{}/{}.%(ext)s", self.output_dir.display(), base_name);
        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;

        info!("yt-dlp: downloading {} to {}", url, output_template);

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--no-playlist")
            .arg("--no-progress")
            .arg("--newline")
            .arg("-x")
            .arg("--audio-format")
            .arg("mp3")
            .arg("-o")
            .arg(&output_template)
            .arg(url)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().context("Failed to spawn yt-dlp")?;

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("yt-dlp: {}", line);
                }
            });
        }

        if let Some(stderr) = child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("yt-dlp stderr: {}", line);
                }
            });
        }

        let status = tokio::time::timeout(DOWNLOAD_TIMEOUT, child.wait())
            .await
            .context("yt-dlp download timed out")?
            .context("Failed to wait for yt-dlp")?;
        if !status.success() {
            anyhow::bail!("yt-dlp exited with status: {:?}", status.code());
        }

        let path = find_downloaded_file(&self.output_dir, &base_name)
            .await
            .context("Could not find downloaded file")?;
        info!("yt-dlp: download complete: {}", path.display());
        Ok(path)
    }

    /// Runs yt-dlp without downloading and returns the first non-empty
    /// stdout line.
    async fn query(&self, args: &[&str]) -> Result<Option<String>> {
        let output = tokio::time::timeout(
            QUERY_TIMEOUT,
            Command::new(&self.binary)
                .args(["--no-playlist", "--skip-download", "--no-warnings"])
                .args(args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .context("yt-dlp query timed out")?
        .context("Failed to spawn yt-dlp")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "yt-dlp exited with status {:?}: {}",
                output.status.code(),
                stderr.trim()
            );
        }
        Ok(first_line(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl Downloader for YtDlp {
    async fn download(&self, url: &str) -> Option<PathBuf> {
        match self.download_audio(url).await {
            Ok(path) => Some(path),
            Err(e) => {
                warn!("yt-dlp: download of {} failed: {:#}", url, e);
                None
            }
        }
    }

    async fn get_title(&self, url: &str) -> Option<String> {
        match self.query(&["--print", "title", url]).await {
            Ok(title) => title,
            Err(e) => {
                warn!("yt-dlp: title lookup for {} failed: {:#}", url, e);
                None
            }
        }
    }

    async fn search_first_url(&self, query: &str) -> Option<String> {
        let search = format!("ytsearch1:{}", query);
        match self.query(&["--print", "webpage_url", &search]).await {
            Ok(url) => url,
            Err(e) => {
                warn!("yt-dlp: search for '{}' failed: {:#}", query, e);
                None
            }
        }
    }
}

fn first_line(stdout: &str) -> Option<String> {
    stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(str::to_string)
}

/// Find the downloaded file by base name. yt-dlp picks the extension.
async fn find_downloaded_file(output_dir: &Path, base_name: &str) -> Result<PathBuf> {
    let mut entries = tokio::fs::read_dir(output_dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_partial = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| matches!(e, "part" | "ytdl" | "temp"))
            .unwrap_or(false);
        if is_partial {
            continue;
        }
        if path.file_stem().and_then(|n| n.to_str()) == Some(base_name) {
            return Ok(path);
        }
    }

    anyhow::bail!("Downloaded file not found for: {}", base_name)
}
