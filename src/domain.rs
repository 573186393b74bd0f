use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use camino::Utf8PathBuf;
use chrono::NaiveDateTime;
use percent_encoding::percent_decode_str;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::DevUpdateError;

/// Timestamp layout embedded in snapshot build file names.
pub const BUILD_TIMESTAMP_FMT: &str = "%Y%m%d%H%M%S";

/// Default short date layout used when displaying a build.
pub const DISPLAY_DATE_FMT: &str = "%d %b %y";

/// Image files which make up an update, each paired with a `<name>.md5` file.
pub const UPDATE_IMAGES: &[&str] = &["SYSTEM", "KERNEL"];

/// Distribution and target board, e.g. `LibreELEC` / `RPi2.arm`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    dist: String,
    arch: String,
}

impl Platform {
    pub fn new(dist: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            dist: dist.into(),
            arch: arch.into(),
        }
    }

    /// Distribution name as published, e.g. `LibreELEC`.
    pub fn dist_name(&self) -> &str {
        &self.dist
    }

    /// Lower-case distribution name used in host names and patterns.
    pub fn dist(&self) -> String {
        self.dist.to_lowercase()
    }

    pub fn arch(&self) -> &str {
        &self.arch
    }

    /// Board part of the arch, `RPi2` for `RPi2.arm`.
    pub fn board(&self) -> &str {
        self.arch.split('.').next().unwrap_or(&self.arch)
    }

    pub fn is_rpi(&self) -> bool {
        self.arch.starts_with("RPi")
    }

    pub fn update_images(&self) -> &'static [&'static str] {
        UPDATE_IMAGES
    }

    /// Expand `{dist}`, `{Dist}`, `{arch}` and `{board}` in a template.
    pub fn expand(&self, template: &str) -> String {
        template
            .replace("{Dist}", &self.dist)
            .replace("{dist}", &self.dist())
            .replace("{arch}", &self.arch)
            .replace("{board}", self.board())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.arch)
    }
}

/// Dotted release number such as `8.0.1`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ReleaseVersion {
    label: String,
    parts: Vec<u32>,
}

impl ReleaseVersion {
    /// Oldest release the release sources will offer.
    pub fn floor() -> Self {
        Self::from_parts(&[3, 95, 0])
    }

    pub fn from_parts(parts: &[u32]) -> Self {
        let label = parts
            .iter()
            .map(|part| part.to_string())
            .collect::<Vec<_>>()
            .join(".");
        Self {
            label,
            parts: parts.to_vec(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.label
    }

    pub fn parts(&self) -> &[u32] {
        &self.parts
    }

    pub fn major(&self) -> u32 {
        self.parts.first().copied().unwrap_or(0)
    }

    pub fn minor(&self) -> u32 {
        self.parts.get(1).copied().unwrap_or(0)
    }

    pub fn patch(&self) -> u32 {
        self.parts.get(2).copied().unwrap_or(0)
    }
}

impl PartialEq for ReleaseVersion {
    fn eq(&self, other: &Self) -> bool {
        self.parts == other.parts
    }
}

impl Eq for ReleaseVersion {}

impl Hash for ReleaseVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts.hash(state);
    }
}

impl PartialOrd for ReleaseVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReleaseVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.parts.cmp(&other.parts)
    }
}

impl fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label)
    }
}

impl FromStr for ReleaseVersion {
    type Err = DevUpdateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_end_matches('.');
        if trimmed.is_empty() {
            return Err(DevUpdateError::InvalidVersion(value.to_string()));
        }
        let parts = trimmed
            .split('.')
            .map(|part| part.parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| DevUpdateError::InvalidVersion(value.to_string()))?;
        Ok(Self {
            label: trimmed.to_string(),
            parts,
        })
    }
}

impl TryFrom<String> for ReleaseVersion {
    type Error = DevUpdateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ReleaseVersion> for String {
    fn from(value: ReleaseVersion) -> Self {
        value.label
    }
}

/// Identity of one installable build.
///
/// A `Build` carries its timestamp in its file name. A `Release` only has a
/// timestamp when the release tag index knows its version; releases without
/// one cannot be ordered and comparisons against them fail.
///
/// Two identities are equal when both their version label and timestamp
/// match. Ordering is by timestamp, with the version label breaking ties so
/// that the order is total over resolved identities.
#[derive(Debug, Clone)]
pub enum BuildIdentity {
    Build {
        version: String,
        timestamp: NaiveDateTime,
    },
    Release {
        version: ReleaseVersion,
        timestamp: Option<NaiveDateTime>,
    },
}

impl BuildIdentity {
    /// Snapshot build from the raw `YYYYmmddHHMMSS` file name timestamp.
    pub fn build(timestamp: &str, version: impl Into<String>) -> Result<Self, DevUpdateError> {
        let timestamp = NaiveDateTime::parse_from_str(timestamp, BUILD_TIMESTAMP_FMT)
            .map_err(|_| DevUpdateError::InvalidRecord(format!("bad build timestamp {timestamp}")))?;
        Ok(BuildIdentity::Build {
            version: version.into(),
            timestamp,
        })
    }

    pub fn release(version: ReleaseVersion, timestamp: Option<NaiveDateTime>) -> Self {
        BuildIdentity::Release { version, timestamp }
    }

    pub fn version(&self) -> &str {
        match self {
            BuildIdentity::Build { version, .. } => version,
            BuildIdentity::Release { version, .. } => version.as_str(),
        }
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            BuildIdentity::Build { timestamp, .. } => Some(*timestamp),
            BuildIdentity::Release { timestamp, .. } => *timestamp,
        }
    }

    pub fn is_release(&self) -> bool {
        matches!(self, BuildIdentity::Release { .. })
    }

    /// Releases must have a tag date and not be older than `floor`.
    pub fn is_offered(&self, floor: &ReleaseVersion) -> bool {
        match self {
            BuildIdentity::Build { .. } => true,
            BuildIdentity::Release { version, timestamp } => {
                timestamp.is_some() && version >= floor
            }
        }
    }

    pub fn try_cmp(&self, other: &Self) -> Result<Ordering, DevUpdateError> {
        let lhs = self
            .timestamp()
            .ok_or_else(|| DevUpdateError::UnresolvedTimestamp(self.version().to_string()))?;
        let rhs = other
            .timestamp()
            .ok_or_else(|| DevUpdateError::UnresolvedTimestamp(other.version().to_string()))?;
        Ok(lhs
            .cmp(&rhs)
            .then_with(|| self.version().cmp(other.version())))
    }

    pub fn date(&self, fmt: &str) -> Option<String> {
        self.timestamp().map(|ts| ts.format(fmt).to_string())
    }

    /// Single-line form used by the notify record; see [`RecordedIdentity`].
    pub fn record(&self) -> String {
        match self {
            BuildIdentity::Build { version, timestamp } => {
                format!("build {} {}", timestamp.format(BUILD_TIMESTAMP_FMT), version)
            }
            BuildIdentity::Release { version, .. } => format!("release {version}"),
        }
    }
}

impl PartialEq for BuildIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.version() == other.version() && self.timestamp() == other.timestamp()
    }
}

impl Eq for BuildIdentity {}

impl Hash for BuildIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.version().hash(state);
        self.timestamp().hash(state);
    }
}

impl PartialOrd for BuildIdentity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        self.try_cmp(other).ok()
    }
}

impl fmt::Display for BuildIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.date(DISPLAY_DATE_FMT) {
            Some(date) => write!(f, "{} ({})", self.version(), date),
            None => write!(f, "{}", self.version()),
        }
    }
}

/// Parsed notify record line. Releases still need a tag lookup for their
/// timestamp before they become a full [`BuildIdentity`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedIdentity {
    Build(BuildIdentity),
    Release(ReleaseVersion),
}

impl FromStr for RecordedIdentity {
    type Err = DevUpdateError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut fields = value.split_whitespace();
        match (fields.next(), fields.next(), fields.next(), fields.next()) {
            (Some("build"), Some(timestamp), Some(version), None) => Ok(RecordedIdentity::Build(
                BuildIdentity::build(timestamp, version)
                    .map_err(|_| DevUpdateError::InvalidRecord(value.to_string()))?,
            )),
            (Some("release"), Some(version), None, None) => {
                Ok(RecordedIdentity::Release(version.parse()?))
            }
            _ => Err(DevUpdateError::InvalidRecord(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    Bzip2,
    Gzip,
}

impl Compression {
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "bz2" => Some(Compression::Bzip2),
            "gz" => Some(Compression::Gzip),
            _ => None,
        }
    }
}

/// Where and under which name a build's artifact can be downloaded.
#[derive(Debug, Clone)]
pub struct Locator {
    pub url: Url,
    pub file_name: String,
    pub size: Option<u64>,
    pub compression: Option<Compression>,
    pub tar_name: String,
    pub archive_path: Option<Utf8PathBuf>,
}

impl Locator {
    /// Resolve an href from a listing page against the listing's URL.
    pub fn from_href(base: &Url, href: &str) -> Result<Self, DevUpdateError> {
        let href = href.trim();
        let url = match Url::parse(href) {
            Ok(url) => fix_dropbox(url),
            Err(_) => with_trailing_slash(base)
                .join(href)
                .map_err(|err| DevUpdateError::InvalidUrl(format!("{href}: {err}")))?,
        };
        Self::new(url)
    }

    pub fn new(url: Url) -> Result<Self, DevUpdateError> {
        let file_name = url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(|segment| percent_decode_str(segment).decode_utf8_lossy().into_owned())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| DevUpdateError::InvalidUrl(format!("no file name in {url}")))?;
        if !is_plain_file_name(&file_name) {
            return Err(DevUpdateError::InvalidUrl(format!(
                "file name {file_name:?} in {url} is not a plain file name"
            )));
        }
        let (compression, tar_name) = split_compression(&file_name);
        Ok(Self {
            url,
            file_name,
            size: None,
            compression,
            tar_name,
            archive_path: None,
        })
    }

    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    pub fn is_compressed(&self) -> bool {
        self.compression.is_some()
    }
}

/// A build found in a listing together with where to fetch it.
#[derive(Debug, Clone)]
pub struct BuildLink {
    pub identity: BuildIdentity,
    pub locator: Locator,
}

impl BuildLink {
    pub fn new(identity: BuildIdentity, locator: Locator) -> Self {
        Self { identity, locator }
    }
}

impl fmt::Display for BuildLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.identity)
    }
}

/// Short description of a build, optionally with a page holding the details.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    pub summary: String,
    pub details_url: Option<String>,
}

impl BuildInfo {
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            details_url: None,
        }
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary)
    }
}

pub(crate) fn with_trailing_slash(url: &Url) -> Url {
    if url.path().ends_with('/') {
        return url.clone();
    }
    let mut url = url.clone();
    let path = format!("{}/", url.path());
    url.set_path(&path);
    url
}

fn fix_dropbox(url: Url) -> Url {
    if url.host_str() != Some("www.dropbox.com") {
        return url;
    }
    let mut fixed = url;
    if fixed.set_host(Some("dl.dropbox.com")).is_ok() {
        fixed.set_query(None);
        fixed.set_fragment(None);
    }
    fixed
}

fn split_compression(file_name: &str) -> (Option<Compression>, String) {
    file_name
        .rsplit_once('.')
        .and_then(|(stem, ext)| Compression::from_extension(ext).map(|c| (Some(c), stem.to_string())))
        .unwrap_or_else(|| (None, file_name.to_string()))
}

/// Names are joined onto local directories, so they must stay a single
/// path component.
fn is_plain_file_name(name: &str) -> bool {
    !matches!(name, "." | "..") && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn base() -> Url {
        Url::parse("http://snapshots.libreelec.tv").unwrap()
    }

    #[test]
    fn release_versions_order_numerically() {
        let older: ReleaseVersion = "7.0.3".parse().unwrap();
        let newer: ReleaseVersion = "7.90.10".parse().unwrap();
        assert!(older < newer);
        assert!(ReleaseVersion::from_parts(&[3, 95, 0]) == ReleaseVersion::floor());
    }

    #[test]
    fn release_version_rejects_text() {
        let err = "8.0.beta".parse::<ReleaseVersion>().unwrap_err();
        assert_matches!(err, DevUpdateError::InvalidVersion(_));
    }

    #[test]
    fn build_ordering_breaks_ties_on_version() {
        let a = BuildIdentity::build("20150101000000", "abc123").unwrap();
        let b = BuildIdentity::build("20150101000000", "def456").unwrap();
        assert_eq!(a.try_cmp(&b).unwrap(), Ordering::Less);
        assert_ne!(a, b);
    }

    #[test]
    fn unresolved_release_fails_to_compare() {
        let build = BuildIdentity::build("20150101000000", "abc123").unwrap();
        let release = BuildIdentity::release("8.0.1".parse().unwrap(), None);
        assert_matches!(
            build.try_cmp(&release),
            Err(DevUpdateError::UnresolvedTimestamp(_))
        );
        assert_eq!(build.partial_cmp(&release), None);
    }

    #[test]
    fn locator_joins_relative_href() {
        let locator = Locator::from_href(
            &base(),
            "LibreELEC-RPi2.arm-8.0-devel-20170101000000-r100-gabc1234.tar.bz2",
        )
        .unwrap();
        assert_eq!(
            locator.url.as_str(),
            "http://snapshots.libreelec.tv/LibreELEC-RPi2.arm-8.0-devel-20170101000000-r100-gabc1234.tar.bz2"
        );
        assert_eq!(locator.compression, Some(Compression::Bzip2));
        assert_eq!(
            locator.tar_name,
            "LibreELEC-RPi2.arm-8.0-devel-20170101000000-r100-gabc1234.tar"
        );
    }

    #[test]
    fn locator_keeps_plain_tar_name() {
        let locator = Locator::from_href(&base(), "/dir/LibreELEC-RPi2.arm-8.0.1.tar").unwrap();
        assert!(!locator.is_compressed());
        assert_eq!(locator.tar_name, locator.file_name);
    }

    #[test]
    fn locator_rewrites_dropbox_links() {
        let locator = Locator::from_href(
            &base(),
            "https://www.dropbox.com/s/xyz/OpenELEC-RPi.arm-devel-20150101000000-r1-gabc.tar?dl=0",
        )
        .unwrap();
        assert_eq!(locator.url.host_str(), Some("dl.dropbox.com"));
        assert_eq!(locator.url.query(), None);
    }

    #[test]
    fn locator_decodes_file_name() {
        let locator = Locator::from_href(
            &base(),
            "milhouse/LibreELEC-RPi2.arm-9.0-Milhouse-20180101000000-%230101-gabc.tar",
        )
        .unwrap();
        assert_eq!(
            locator.file_name,
            "LibreELEC-RPi2.arm-9.0-Milhouse-20180101000000-#0101-gabc.tar"
        );
    }

    #[test]
    fn locator_rejects_names_escaping_their_directory() {
        for href in [
            "x/..%2F..%2Fescaped%2FOpenELEC-RPi.arm-devel-20150101000000-r100-gabc123.tar.bz2",
            "x/..%5Cescaped.tar",
            "x/evil%00.tar",
            "x/%2E%2E",
        ] {
            assert_matches!(
                Locator::from_href(&base(), href),
                Err(DevUpdateError::InvalidUrl(_)),
                "{href}"
            );
        }
    }

    #[test]
    fn record_round_trips_build() {
        let build = BuildIdentity::build("20150503135721", "bfd3782").unwrap();
        let parsed: RecordedIdentity = build.record().parse().unwrap();
        assert_eq!(parsed, RecordedIdentity::Build(build));
    }

    #[test]
    fn platform_expands_templates() {
        let platform = Platform::new("LibreELEC", "RPi2.arm");
        assert_eq!(platform.expand("master/{board}"), "master/RPi2");
        assert_eq!(platform.expand("{Dist}-{arch}"), "LibreELEC-RPi2.arm");
        assert_eq!(platform.expand("milhouse.{dist}.tv"), "milhouse.libreelec.tv");
    }
}
