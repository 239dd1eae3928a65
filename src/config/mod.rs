use crate::error::ToolError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_USER_AGENT: &str = concat!("toolcache/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Root of the tool cache. Each tool gets its own subdirectory.
    pub cache_dir: Option<PathBuf>,
    pub user_agent: String,
    pub logging: LoggingConfig,
    pub yt_dlp: YtDlpConfig,
    pub ffmpeg: FfmpegConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `json` or `text`.
    pub format: String,
}

/// Where yt-dlp releases come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct YtDlpConfig {
    pub owner: String,
    pub repo: String,
    pub asset: String,
    /// Entry to extract when the asset is a zip; `{version}` is substituted.
    pub archive_entry: Option<String>,
    pub file_name: String,
    /// GitHub API host, for mirrors and GitHub Enterprise.
    pub api_base: Option<String>,
}

/// Where ffmpeg builds come from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FfmpegConfig {
    pub page_url: String,
    /// File name pattern with a `*` where the version goes.
    pub pattern: String,
    /// Entry to extract when the download is a zip; `{version}` is substituted.
    pub archive_entry: Option<String>,
    pub file_name: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            logging: LoggingConfig::default(),
            yt_dlp: YtDlpConfig::default(),
            ffmpeg: FfmpegConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: "json".to_string(),
        }
    }
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        let asset = if cfg!(windows) {
            "yt-dlp.exe"
        } else if cfg!(target_os = "macos") {
            "yt-dlp_macos"
        } else {
            "yt-dlp_linux"
        };

        Self {
            owner: "yt-dlp".to_string(),
            repo: "yt-dlp".to_string(),
            asset: asset.to_string(),
            archive_entry: None,
            file_name: executable_name("yt-dlp"),
            api_base: None,
        }
    }
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        // gyan.dev publishes Windows essentials builds; other platforms point this elsewhere.
        Self {
            page_url: "https://www.gyan.dev/ffmpeg/builds/packages/".to_string(),
            pattern: "ffmpeg-*-essentials_build.zip".to_string(),
            archive_entry: Some("ffmpeg-{version}-essentials_build/bin/ffmpeg.exe".to_string()),
            file_name: executable_name("ffmpeg"),
        }
    }
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).context("Failed to parse config")
    }

    pub fn get_logging_format(&self) -> &str {
        &self.logging.format
    }

    /// The configured cache root, falling back to the platform cache directory.
    pub fn cache_dir(&self) -> Result<PathBuf, ToolError> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        dirs::cache_dir()
            .map(|dir| dir.join("toolcache"))
            .ok_or_else(|| ToolError::config("No cache directory configured and none found for this platform"))
    }
}

fn executable_name(stem: &str) -> String {
    format!("{}{}", stem, std::env::consts::EXE_SUFFIX)
}
