use std::cmp::Ordering;
use std::fmt;
use std::path::Path;

/// Prefix that turns a version into its cache directory name.
pub const DIRECTORY_PREFIX: &str = "v";

/// A dotted-numeric version such as `1.10.0` or `2024.08.06`.
///
/// Accepts two to four non-negative integer components. Leading zeros are allowed, so
/// `2024.08.06` and `2024.8.6` compare equal here even though they are different
/// releases; use [`same_version`] to decide whether two raw strings name the same one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NumericVersion(Vec<u64>);

impl NumericVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        let components = raw
            .split('.')
            .map(|part| {
                if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                    None
                } else {
                    part.parse::<u64>().ok()
                }
            })
            .collect::<Option<Vec<_>>>()?;

        if (2..=4).contains(&components.len()) {
            Some(Self(components))
        } else {
            None
        }
    }
}

impl fmt::Display for NumericVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|c| c.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

/// A raw version string with its parsed ordering key.
#[derive(Debug, Clone)]
pub struct ToolVersion {
    raw: String,
    parsed: NumericVersion,
}

impl ToolVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        NumericVersion::parse(raw).map(|parsed| Self {
            raw: raw.to_string(),
            parsed,
        })
    }

    /// Reads the version out of a `v<raw>` cache directory name.
    pub fn from_directory(dir: &Path) -> Option<Self> {
        let name = dir.file_name()?.to_str()?;
        Self::parse(name.strip_prefix(DIRECTORY_PREFIX)?)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for ToolVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ToolVersion {}

impl PartialOrd for ToolVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ToolVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed
            .cmp(&other.parsed)
            .then_with(|| self.raw.cmp(&other.raw))
    }
}

impl fmt::Display for ToolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

pub fn directory_name(raw: &str) -> String {
    format!("{}{}", DIRECTORY_PREFIX, raw)
}

/// Whether two raw version strings name the same release. Case-insensitive.
pub fn same_version(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

/// Whether `raw` can be used verbatim as part of a directory name.
pub fn is_safe_directory_component(raw: &str) -> bool {
    !raw.trim().is_empty()
        && raw != "."
        && raw != ".."
        && !raw
            .chars()
            .any(|c| matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') || c.is_control())
}
