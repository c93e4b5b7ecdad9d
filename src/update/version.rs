//! Runtime version parsing and ordering.

use std::cmp::Ordering;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use semver::Version;

use crate::update::error::VersionParseError;

static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.(\d+)(?:[.-](\d+))?").expect("version pattern is valid"));

/// A runtime version like `"3.0-1"`, `"4.2.6"` or `"3.0-1-nightly20241216"`.
///
/// Only the leading major/minor/patch triple takes part in ordering and
/// equality; trailing metadata such as `-nightly20241216` is kept in the raw
/// string but ignored for comparisons. A missing patch segment counts as 0.
#[derive(Debug, Clone)]
pub struct RuntimeVersion {
    raw: String,
    parsed: Version,
}

impl RuntimeVersion {
    pub fn parse(raw: &str) -> Result<Self, VersionParseError> {
        let caps = VERSION_RE
            .captures(raw)
            .ok_or_else(|| VersionParseError::new(raw))?;

        let number = |m: &str| m.parse::<u64>().map_err(|_| VersionParseError::new(raw));
        let major = number(&caps[1])?;
        let minor = number(&caps[2])?;
        let patch = match caps.get(3) {
            Some(m) => number(m.as_str())?,
            None => 0,
        };

        Ok(Self {
            raw: raw.to_string(),
            parsed: Version::new(major, minor, patch),
        })
    }

    /// The release line this version belongs to.
    pub fn major(&self) -> u64 {
        self.parsed.major
    }

    pub fn minor(&self) -> u64 {
        self.parsed.minor
    }

    pub fn patch(&self) -> u64 {
        self.parsed.patch
    }

    /// The version string as the host reported it, metadata included.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl PartialEq for RuntimeVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parsed == other.parsed
    }
}

impl Eq for RuntimeVersion {}

impl PartialOrd for RuntimeVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RuntimeVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parsed.cmp(&other.parsed)
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
