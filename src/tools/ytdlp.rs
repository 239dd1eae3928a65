use crate::error::ToolError;
use anyhow::{bail, Context, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of a yt-dlp run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub success: bool,
    pub exit_code: i32,
    /// Collected stderr when the run failed.
    pub message: Option<String>,
}

impl DownloadResult {
    fn succeeded() -> Self {
        Self {
            success: true,
            exit_code: 0,
            message: None,
        }
    }

    fn failed(exit_code: i32, stderr: &[String]) -> Self {
        let message = if stderr.is_empty() {
            format!("yt-dlp exited with code {}", exit_code)
        } else {
            stderr.join("\n")
        };
        Self {
            success: false,
            exit_code,
            message: Some(message),
        }
    }
}

/// A leased yt-dlp executable paired with the directory holding ffmpeg.
pub struct YtDlpTool<'a> {
    executable: &'a Path,
    ffmpeg_dir: &'a Path,
}

impl<'a> YtDlpTool<'a> {
    pub fn new(executable: &'a Path, ffmpeg_dir: &'a Path) -> Self {
        Self {
            executable,
            ffmpeg_dir,
        }
    }

    /// Downloads `url` into `destination`, which is created if needed.
    ///
    /// yt-dlp's stdout goes straight to ours. Stderr is echoed as well and kept so a failed
    /// run can report it.
    pub async fn download_to_directory(
        &self,
        url: &str,
        destination: &Path,
        audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult> {
        if url.trim().is_empty() {
            bail!("URL must be specified");
        }
        if !destination.is_absolute() {
            bail!(
                "Destination directory {} must be an absolute path",
                destination.display()
            );
        }

        tokio::fs::create_dir_all(destination)
            .await
            .with_context(|| format!("Failed to create {}", destination.display()))?;

        let mut command = Command::new(self.executable);
        command
            .arg(url)
            .arg("--ffmpeg-location")
            .arg(self.ffmpeg_dir)
            .current_dir(destination)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if audio_only {
            command.arg("--extract-audio");
        }

        if cancel.is_cancelled() {
            return Err(ToolError::Cancelled.into());
        }

        info!("Downloading {} into {}", url, destination.display());
        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to start {}", self.executable.display()))?;

        let stderr = child.stderr.take().context("yt-dlp stderr was not captured")?;
        let collect = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                eprintln!("{}", line);
                collected.push(line);
            }
            collected
        });

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    warn!("Failed to stop yt-dlp: {}", e);
                }
                return Err(ToolError::Cancelled.into());
            }
            status = child.wait() => status.context("Failed to wait for yt-dlp")?,
        };

        let stderr = collect.await.unwrap_or_default();

        if status.success() {
            info!("✅ Download of {} finished", url);
            Ok(DownloadResult::succeeded())
        } else {
            let exit_code = status.code().unwrap_or(-1);
            warn!("❌ yt-dlp exited with code {}", exit_code);
            Ok(DownloadResult::failed(exit_code, &stderr))
        }
    }

    /// Asks the executable for its version, mostly as a sanity check after a download.
    pub async fn version(&self) -> Result<String> {
        let output = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            Command::new(self.executable).arg("--version").output(),
        )
        .await
        .context("yt-dlp version check timed out")?
        .with_context(|| format!("Failed to run {}", self.executable.display()))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            bail!("yt-dlp version check failed: {}", error.trim());
        }

        let version = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!("yt-dlp reports version {}", version);
        Ok(version)
    }
}
