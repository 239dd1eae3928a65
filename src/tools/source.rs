use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::Client;
use std::io::{Cursor, Read};
use tracing::debug;

/// Body of a download, chunk by chunk.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Rewrites a fully buffered download, e.g. to pull the executable out of an archive.
pub type StreamTransform = Box<dyn FnOnce(Bytes) -> Result<Bytes> + Send>;

#[async_trait]
pub trait DownloadSource: Send + Sync {
    /// Human-readable name of the upstream
    fn name(&self) -> &str;

    /// Look up the latest available version and how to fetch it
    async fn latest(&self) -> Result<AvailableDownload>;
}

/// A version that upstream offers, together with the client needed to fetch it.
///
/// [`AvailableDownload::open`] consumes the descriptor and moves the client into the
/// returned stream. Dropping an unopened descriptor closes the client.
pub struct AvailableDownload {
    version: String,
    client: Client,
    url: String,
    transform: Option<StreamTransform>,
}

impl AvailableDownload {
    pub fn new(version: impl Into<String>, client: Client, url: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            client,
            url: url.into(),
            transform: None,
        }
    }

    pub fn with_transform(mut self, transform: StreamTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn open(self) -> Result<ByteStream> {
        debug!("Downloading {}", self.url);

        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .with_context(|| format!("Failed to start download from {}", self.url))?
            .error_for_status()
            .with_context(|| format!("Download from {} failed", self.url))?;

        match self.transform {
            None => Ok(response
                .bytes_stream()
                .map(|chunk| chunk.context("Failed to read download stream"))
                .boxed()),
            Some(transform) => {
                let body = response
                    .bytes()
                    .await
                    .context("Failed to read download body")?;
                let transformed = tokio::task::spawn_blocking(move || transform(body))
                    .await
                    .context("Download transform panicked")??;
                Ok(stream::once(async move { Ok(transformed) }).boxed())
            }
        }
    }
}

/// Upper bound on what a zip header's declared size may reserve up front.
const MAX_PREALLOCATION: u64 = 64 * 1024 * 1024;

/// Extracts a single entry from a zip archive.
pub fn unzip_single_file(entry_path: impl Into<String>) -> StreamTransform {
    let entry_path = entry_path.into();
    Box::new(move |archive: Bytes| {
        let mut archive =
            zip::ZipArchive::new(Cursor::new(archive)).context("Failed to open zip archive")?;
        let mut entry = archive
            .by_name(&entry_path)
            .with_context(|| format!("No entry was found with the path {}", entry_path))?;

        let mut data = Vec::with_capacity(preallocation(entry.size()));
        entry
            .read_to_end(&mut data)
            .with_context(|| format!("Failed to extract {}", entry_path))?;
        Ok(Bytes::from(data))
    })
}

/// The declared size comes from the archive and is not trusted beyond a sane reservation.
fn preallocation(declared_size: u64) -> usize {
    usize::try_from(declared_size.min(MAX_PREALLOCATION)).unwrap_or(0)
}

/// Builds the HTTP client used by the download strategies.
pub fn http_client(user_agent: &str) -> Result<Client> {
    Client::builder()
        .user_agent(user_agent)
        .build()
        .context("Failed to create HTTP client")
}
