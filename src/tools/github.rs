use super::source::{http_client, unzip_single_file, AvailableDownload, DownloadSource};
use crate::error::ToolError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

const GITHUB_API: &str = "https://api.github.com";

/// GitHub release metadata from the API.
#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
    assets: Vec<Asset>,
}

#[derive(Debug, Deserialize)]
struct Asset {
    name: String,
    browser_download_url: String,
}

/// Downloads a named asset from the latest GitHub release of a repository.
pub struct GitHubReleaseSource {
    owner: String,
    repo: String,
    asset_name: String,
    user_agent: String,
    api_base: String,
    archive_entry: Option<String>,
}

impl GitHubReleaseSource {
    pub fn new(owner: &str, repo: &str, asset_name: &str, user_agent: &str) -> Result<Self, ToolError> {
        for (value, what) in [
            (owner, "Owner"),
            (repo, "Repository"),
            (asset_name, "Asset name"),
            (user_agent, "User agent"),
        ] {
            if value.trim().is_empty() {
                return Err(ToolError::config(format!("{} must be specified", what)));
            }
        }

        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            asset_name: asset_name.to_string(),
            user_agent: user_agent.to_string(),
            api_base: GITHUB_API.to_string(),
            archive_entry: None,
        })
    }

    /// Points the source at a different API host.
    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self
    }

    /// Treat the asset as a zip archive and extract this entry. `{version}` is replaced by
    /// the release tag.
    pub fn with_archive_entry(mut self, entry: Option<String>) -> Self {
        self.archive_entry = entry.filter(|e| !e.trim().is_empty());
        self
    }

    async fn fetch_release(&self, client: &reqwest::Client) -> Result<Release> {
        let url = format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base, self.owner, self.repo
        );
        debug!(%url, "Fetching latest GitHub release");

        let mut request = client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json");

        if let Ok(token) = std::env::var("GITHUB_TOKEN").or_else(|_| std::env::var("GH_TOKEN")) {
            request = request.header(reqwest::header::AUTHORIZATION, format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to fetch latest release of {}/{}", self.owner, self.repo))?
            .error_for_status()
            .with_context(|| format!("Latest release of {}/{} not available", self.owner, self.repo))?;

        response
            .json::<Release>()
            .await
            .context("Failed to parse GitHub release")
    }
}

#[async_trait]
impl DownloadSource for GitHubReleaseSource {
    fn name(&self) -> &str {
        &self.repo
    }

    async fn latest(&self) -> Result<AvailableDownload> {
        let client = http_client(&self.user_agent)?;
        let release = self.fetch_release(&client).await?;

        let wanted = self.asset_name.to_lowercase();
        let asset = release
            .assets
            .into_iter()
            .find(|asset| asset.name.to_lowercase() == wanted)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unable to find {} in latest GitHub release {} of {}/{}",
                    self.asset_name,
                    release.tag_name,
                    self.owner,
                    self.repo
                )
            })?;

        info!(
            "Latest {} release is {} ({})",
            self.repo, release.tag_name, asset.browser_download_url
        );

        let mut download =
            AvailableDownload::new(&release.tag_name, client, asset.browser_download_url);
        if let Some(entry) = &self.archive_entry {
            download =
                download.with_transform(unzip_single_file(entry.replace("{version}", &release.tag_name)));
        }
        Ok(download)
    }
}
