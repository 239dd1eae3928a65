pub mod github;
pub mod install;
pub mod lease;
pub mod page;
pub mod resolver;
pub mod source;
pub mod version;
pub mod ytdlp;

pub use github::GitHubReleaseSource;
pub use page::PageScrapeSource;
pub use resolver::ToolResolver;
pub use ytdlp::{DownloadResult, YtDlpTool};

use crate::config::Config;
use crate::error::ToolError;
use anyhow::Result;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A tool managed by [`ToolSet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Tool {
    #[value(name = "yt-dlp", alias = "ytdlp")]
    YtDlp,
    Ffmpeg,
}

/// The two tools needed to download media: yt-dlp and the ffmpeg it merges with.
pub struct ToolSet {
    yt_dlp: ToolResolver,
    ffmpeg: ToolResolver,
}

impl ToolSet {
    pub fn from_config(config: &Config) -> Result<Self, ToolError> {
        let cache_dir = config.cache_dir()?;

        let mut yt_dlp_source = GitHubReleaseSource::new(
            &config.yt_dlp.owner,
            &config.yt_dlp.repo,
            &config.yt_dlp.asset,
            &config.user_agent,
        )?
        .with_archive_entry(config.yt_dlp.archive_entry.clone());
        if let Some(api_base) = &config.yt_dlp.api_base {
            yt_dlp_source = yt_dlp_source.with_api_base(api_base);
        }
        let ffmpeg_source = PageScrapeSource::new(
            &config.ffmpeg.page_url,
            &config.ffmpeg.pattern,
            &config.user_agent,
        )?
        .with_archive_entry(config.ffmpeg.archive_entry.clone());

        Ok(Self::new(
            ToolResolver::new(cache_dir.join("yt-dlp"), &config.yt_dlp.file_name, yt_dlp_source),
            ToolResolver::new(cache_dir.join("ffmpeg"), &config.ffmpeg.file_name, ffmpeg_source),
        ))
    }

    pub fn new(yt_dlp: ToolResolver, ffmpeg: ToolResolver) -> Self {
        Self { yt_dlp, ffmpeg }
    }

    pub fn resolver(&self, tool: Tool) -> &ToolResolver {
        match tool {
            Tool::YtDlp => &self.yt_dlp,
            Tool::Ffmpeg => &self.ffmpeg,
        }
    }

    pub fn purge_old_versions(&self) {
        self.yt_dlp.purge_old_versions();
        self.ffmpeg.purge_old_versions();
    }

    /// Purges stale versions, then checks both tools for updates at the same time.
    pub async fn check_for_tool_updates(&self, cancel: &CancellationToken) -> Result<(), ToolError> {
        self.purge_old_versions();

        let (yt_dlp, ffmpeg) = tokio::join!(
            self.yt_dlp.check_for_updates(cancel),
            self.ffmpeg.check_for_updates(cancel)
        );
        yt_dlp?;
        ffmpeg?;
        Ok(())
    }

    /// Downloads `url` into `destination` with the current yt-dlp and ffmpeg.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        audio_only: bool,
        cancel: &CancellationToken,
    ) -> Result<DownloadResult> {
        let missing = match (
            self.ffmpeg.current_version().is_none(),
            self.yt_dlp.current_version().is_none(),
        ) {
            (true, true) => Some("ffmpeg and yt-dlp"),
            (true, false) => Some("ffmpeg"),
            (false, true) => Some("yt-dlp"),
            (false, false) => None,
        };
        if let Some(missing) = missing {
            info!("Downloading {}...", missing);
        }

        let (ffmpeg, yt_dlp) = tokio::join!(
            self.ffmpeg.lease_tool(cancel),
            self.yt_dlp.lease_tool(cancel)
        );
        let (ffmpeg, yt_dlp) = (ffmpeg?, yt_dlp?);

        let tool = YtDlpTool::new(yt_dlp.file_path()?, ffmpeg.directory()?);
        let result = tool
            .download_to_directory(url, destination, audio_only, cancel)
            .await;
        yt_dlp.dispose();
        ffmpeg.dispose();
        let result = result?;

        if let Some(message) = &result.message {
            warn!("Download of {} failed: {}", url, message);
        }
        Ok(result)
    }

    pub fn dispose(&self) {
        self.yt_dlp.dispose();
        self.ffmpeg.dispose();
    }
}
