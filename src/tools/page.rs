use super::source::{http_client, unzip_single_file, AvailableDownload, DownloadSource};
use super::version::NumericVersion;
use crate::error::ToolError;
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use regex::Regex;
use scraper::{Html, Selector};
use tracing::{debug, info};
use url::Url;

/// Finds the newest download on an HTML directory listing.
///
/// Every `<a href>` on the page is matched against a file name pattern with a `*`
/// wildcard standing in for the version, e.g. `ffmpeg-*-essentials_build.zip`. The link
/// with the numerically greatest version wins.
pub struct PageScrapeSource {
    page_url: Url,
    pattern: Regex,
    user_agent: String,
    archive_entry: Option<String>,
}

#[derive(Debug)]
struct Candidate {
    version: NumericVersion,
    raw_version: String,
    href: String,
}

impl PageScrapeSource {
    pub fn new(page_url: &str, link_pattern: &str, user_agent: &str) -> Result<Self, ToolError> {
        if page_url.trim().is_empty() {
            return Err(ToolError::config("Page URL must be specified"));
        }
        if user_agent.trim().is_empty() {
            return Err(ToolError::config("User agent must be specified"));
        }

        let page_url = Url::parse(page_url)
            .map_err(|e| ToolError::config(format!("Invalid page URL {}: {}", page_url, e)))?;

        Ok(Self {
            page_url,
            pattern: compile_link_pattern(link_pattern)?,
            user_agent: user_agent.to_string(),
            archive_entry: None,
        })
    }

    /// Treat the download as a zip archive and extract this entry. `{version}` is replaced
    /// by the matched version.
    pub fn with_archive_entry(mut self, entry: Option<String>) -> Self {
        self.archive_entry = entry.filter(|e| !e.trim().is_empty());
        self
    }

    fn select_latest(&self, page: &str) -> Result<Candidate> {
        let mut latest: Option<Candidate> = None;

        for href in extract_links(page)? {
            let Some(candidate) = match_link(&self.pattern, &href)? else {
                continue;
            };

            let newer = match &latest {
                Some(current) => candidate.version > current.version,
                None => true,
            };
            if newer {
                latest = Some(candidate);
            }
        }

        latest.ok_or_else(|| {
            anyhow!(
                "No link on {} matched the pattern with a wildcard that parses as a version",
                self.page_url
            )
        })
    }
}

#[async_trait]
impl DownloadSource for PageScrapeSource {
    fn name(&self) -> &str {
        self.page_url.as_str()
    }

    async fn latest(&self) -> Result<AvailableDownload> {
        let client = http_client(&self.user_agent)?;

        debug!("Fetching download page {}", self.page_url);
        let page = client
            .get(self.page_url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", self.page_url))?
            .error_for_status()
            .with_context(|| format!("Download page {} not available", self.page_url))?
            .text()
            .await
            .context("Failed to read download page")?;

        let latest = self.select_latest(&page)?;
        let download_url = self
            .page_url
            .join(&latest.href)
            .with_context(|| format!("Invalid link {}", latest.href))?;

        info!("Latest version on {} is {}", self.page_url, latest.raw_version);

        let mut download = AvailableDownload::new(&latest.raw_version, client, download_url);
        if let Some(entry) = &self.archive_entry {
            download =
                download.with_transform(unzip_single_file(entry.replace("{version}", &latest.raw_version)));
        }
        Ok(download)
    }
}

/// Turns `name-*.zip` into a regex matching a whole path segment of an `href`.
fn compile_link_pattern(pattern: &str) -> Result<Regex, ToolError> {
    if pattern.trim().is_empty() {
        return Err(ToolError::config("Link pattern must be specified"));
    }
    if !pattern.contains('*') {
        return Err(ToolError::config(
            "Link pattern needs a '*' wildcard to match the version part of the URL",
        ));
    }

    let mut literals: Vec<&str> = pattern.split('*').collect();
    // Runs of wildcards collapse into one.
    let last = literals.len() - 1;
    let mut index = 0;
    literals.retain(|part| {
        let keep = !part.is_empty() || index == 0 || index == last;
        index += 1;
        keep
    });

    let body = literals
        .iter()
        .map(|part| regex::escape(part))
        .collect::<Vec<_>>()
        .join(r"([^/\\]*)");

    Regex::new(&format!(r"(?i)(?:\A|/|\\){}\z", body))
        .map_err(|e| ToolError::config(format!("Invalid link pattern {}: {}", pattern, e)))
}

fn extract_links(page: &str) -> Result<Vec<String>> {
    let document = Html::parse_document(page);
    let selector =
        Selector::parse("a[href]").map_err(|e| anyhow!("Invalid link selector: {}", e))?;

    Ok(document
        .select(&selector)
        .filter_map(|link| link.value().attr("href"))
        .map(|href| href.to_string())
        .collect())
}

fn match_link(pattern: &Regex, href: &str) -> Result<Option<Candidate>> {
    let Some(captures) = pattern.captures(href) else {
        return Ok(None);
    };

    let mut found: Option<Candidate> = None;
    for group in captures.iter().skip(1).flatten() {
        if let Some(version) = NumericVersion::parse(group.as_str()) {
            if found.is_some() {
                bail!(
                    "More than one wildcard in {} matched a version; the link pattern is ambiguous",
                    href
                );
            }
            found = Some(Candidate {
                version,
                raw_version: group.as_str().to_string(),
                href: href.to_string(),
            });
        }
    }

    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn listing(links: &[&str]) -> String {
        let items: String = links
            .iter()
            .map(|href| format!("<li><a href=\"{}\">{}</a></li>\n", href, href))
            .collect();
        format!("<html><body><ul>\n{}</ul></body></html>", items)
    }

    #[test]
    fn test_pattern_requires_wildcard() {
        assert!(compile_link_pattern("ffmpeg.zip").is_err());
        assert!(compile_link_pattern("").is_err());
        assert!(compile_link_pattern("*.zip").is_ok());
        assert!(compile_link_pattern("ffmpeg-*").is_ok());
    }

    #[test]
    fn test_pattern_matches_whole_segment() {
        let pattern = compile_link_pattern("a-*.zip").unwrap();
        assert!(pattern.is_match("a-1.0.zip"));
        assert!(pattern.is_match("/releases/a-1.0.zip"));
        assert!(pattern.is_match("https://host/dir/A-1.0.ZIP"));
        assert!(!pattern.is_match("ba-1.0.zip"));
        assert!(!pattern.is_match("a-1.0.zip.sha256"));
        assert!(!pattern.is_match("a-1.0/b.zip"));
    }

    #[test]
    fn test_repeated_wildcards_collapse() {
        let pattern = compile_link_pattern("a-**.zip").unwrap();
        assert_eq!(pattern.captures_len(), 2);
    }

    #[test]
    fn test_selects_numerically_greatest() {
        let source =
            PageScrapeSource::new("https://example.com/builds/", "a-*.zip", "toolcache-test").unwrap();
        let page = listing(&["a-1.0.0.zip", "a-1.2.0.zip", "a-1.10.0.zip", "b-9.9.zip"]);

        let latest = source.select_latest(&page).unwrap();
        assert_eq!(latest.raw_version, "1.10.0");
        assert_eq!(latest.href, "a-1.10.0.zip");
    }

    #[test]
    fn test_links_without_version_are_skipped() {
        let source =
            PageScrapeSource::new("https://example.com/", "a-*.zip", "toolcache-test").unwrap();
        let page = listing(&["a-latest.zip", "a-2.1.zip"]);
        assert_eq!(source.select_latest(&page).unwrap().raw_version, "2.1");
    }

    #[test]
    fn test_no_matching_link_fails() {
        let source =
            PageScrapeSource::new("https://example.com/", "a-*.zip", "toolcache-test").unwrap();
        let page = listing(&["readme.txt", "a-latest.zip"]);
        assert!(source.select_latest(&page).is_err());
    }

    #[test]
    fn test_ambiguous_pattern_fails() {
        let source =
            PageScrapeSource::new("https://example.com/", "tool-*-*.zip", "toolcache-test").unwrap();
        let page = listing(&["tool-1.0-2.0.zip"]);
        let err = source.select_latest(&page).unwrap_err();
        assert!(err.to_string().contains("ambiguous"));
    }

    #[test]
    fn test_invalid_configuration() {
        assert!(PageScrapeSource::new("", "a-*.zip", "ua").is_err());
        assert!(PageScrapeSource::new("not a url", "a-*.zip", "ua").is_err());
        assert!(PageScrapeSource::new("https://example.com/", "a.zip", "ua").is_err());
        assert!(PageScrapeSource::new("https://example.com/", "a-*.zip", " ").is_err());
    }

    #[tokio::test]
    async fn test_latest_resolves_relative_link() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ffmpeg/builds/"))
            .respond_with(ResponseTemplate::new(200).set_body_string(listing(&[
                "packages/ffmpeg-7.0.2-essentials_build.zip",
                "packages/ffmpeg-7.1-essentials_build.zip",
                "/other/ffmpeg-6.1-essentials_build.zip",
            ])))
            .mount(&server)
            .await;

        let source = PageScrapeSource::new(
            &format!("{}/ffmpeg/builds/", server.uri()),
            "ffmpeg-*-essentials_build.zip",
            "toolcache-test",
        )
        .unwrap();

        let download = source.latest().await.unwrap();
        assert_eq!(download.version(), "7.1");
        assert_eq!(
            download.url(),
            format!(
                "{}/ffmpeg/builds/packages/ffmpeg-7.1-essentials_build.zip",
                server.uri()
            )
        );
    }

    #[tokio::test]
    async fn test_error_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let source =
            PageScrapeSource::new(&format!("{}/", server.uri()), "a-*.zip", "toolcache-test").unwrap();
        assert!(source.latest().await.is_err());
    }
}
