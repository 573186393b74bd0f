use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::domain::{BuildIdentity, Platform};
use crate::error::DevUpdateError;
use crate::http::Transport;
use crate::tags::ReleaseTags;

pub const OS_RELEASE_PATH: &str = "/etc/os-release";

const KNOWN_DISTS: &[&str] = &["LibreELEC", "OpenELEC"];
const DEFAULT_DIST: &str = "LibreELEC";
const DEFAULT_ARCH: &str = "RPi.arm";

static DEVEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^devel-(\d+)-r\d+-g([a-z0-9]+)").unwrap());
static MILHOUSE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^devel-(\d+)-[r#](\d{4}[a-z]?)").unwrap());

/// Key/value pairs of an os-release file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsRelease {
    values: HashMap<String, String>,
}

impl OsRelease {
    pub fn load(path: &Path) -> Result<Self, DevUpdateError> {
        let content = fs::read_to_string(path)
            .map_err(|err| DevUpdateError::Filesystem(format!("{}: {err}", path.display())))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let values = content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(|line| line.split_once('='))
            .map(|(key, value)| {
                let value = value.trim().trim_matches('"').trim_matches('\'');
                (key.trim().to_string(), value.to_string())
            })
            .collect();
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.get("NAME")
    }

    pub fn is_known_dist(&self) -> bool {
        self.name().is_some_and(|name| KNOWN_DISTS.contains(&name))
    }

    /// Distribution and arch of this system. Anything unrecognised is treated
    /// as a LibreELEC Raspberry Pi, unless `arch` overrides the arch.
    pub fn platform(&self, arch: Option<&str>) -> Platform {
        let dist = self
            .name()
            .filter(|_| self.is_known_dist())
            .unwrap_or(DEFAULT_DIST);
        let detected = self.get(&format!("{}_ARCH", dist.to_uppercase()));
        let arch = arch.or(detected).unwrap_or(DEFAULT_ARCH);
        Platform::new(dist, arch)
    }

    /// The installed build, from `VERSION`. Development builds carry their
    /// timestamp; anything else is a release looked up in the tag index.
    pub fn installed_build(
        &self,
        tags: &ReleaseTags,
        transport: &dyn Transport,
    ) -> Result<BuildIdentity, DevUpdateError> {
        let version = self
            .get("VERSION")
            .ok_or_else(|| DevUpdateError::InvalidRecord("os-release has no VERSION".to_string()))?;
        let devel = if self.get("MILHOUSE_BUILD").is_some() {
            &*MILHOUSE_RE
        } else {
            &*DEVEL_RE
        };
        if let Some(caps) = devel.captures(version) {
            debug!(version, "installed development build");
            return BuildIdentity::build(&caps[1], &caps[2]);
        }
        tags.release(version.parse()?, transport)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::domain::ReleaseVersion;
    use crate::http::RemoteFile;

    struct Offline;

    impl Transport for Offline {
        fn get_text(&self, url: &reqwest::Url) -> Result<String, DevUpdateError> {
            Err(DevUpdateError::ListingUnavailable {
                url: url.to_string(),
                status: 503,
            })
        }

        fn open(&self, url: &reqwest::Url) -> Result<RemoteFile, DevUpdateError> {
            Err(DevUpdateError::Connection {
                url: url.to_string(),
                message: "offline".to_string(),
            })
        }

        fn exists(&self, _url: &reqwest::Url) -> bool {
            false
        }
    }

    const OS_RELEASE: &str = r#"
NAME="LibreELEC"
VERSION="devel-20170101000000-r100-gabc1234"
LIBREELEC_ARCH="RPi2.arm"
"#;

    #[test]
    fn platform_from_os_release() {
        let release = OsRelease::parse(OS_RELEASE);
        assert_eq!(release.platform(None), Platform::new("LibreELEC", "RPi2.arm"));
        assert_eq!(
            release.platform(Some("Generic.x86_64")),
            Platform::new("LibreELEC", "Generic.x86_64")
        );
        assert_eq!(
            OsRelease::parse("NAME=Ubuntu").platform(None),
            Platform::new("LibreELEC", "RPi.arm")
        );
    }

    #[test]
    fn installed_development_build() {
        let tags = ReleaseTags::preloaded(HashMap::new(), ReleaseVersion::floor());
        let build = OsRelease::parse(OS_RELEASE)
            .installed_build(&tags, &Offline)
            .unwrap();
        assert_eq!(build, BuildIdentity::build("20170101000000", "abc1234").unwrap());
    }

    #[test]
    fn installed_milhouse_build() {
        let tags = ReleaseTags::preloaded(HashMap::new(), ReleaseVersion::floor());
        let release = OsRelease::parse(
            "NAME=LibreELEC\nVERSION=devel-20180101000000-#0101a\nMILHOUSE_BUILD=1\n",
        );
        let build = release.installed_build(&tags, &Offline).unwrap();
        assert_eq!(build.version(), "0101a");
    }

    #[test]
    fn installed_release_uses_tag_index() {
        let date = chrono::NaiveDate::from_ymd_opt(2017, 2, 21)
            .unwrap()
            .and_hms_opt(10, 0, 5)
            .unwrap();
        let tags = ReleaseTags::preloaded(
            HashMap::from([("8.0.1".to_string(), date)]),
            ReleaseVersion::floor(),
        );
        let build = OsRelease::parse("NAME=LibreELEC\nVERSION=8.0.1\n")
            .installed_build(&tags, &Offline)
            .unwrap();
        assert!(build.is_release());
        assert_eq!(build.timestamp(), Some(date));
    }
}
