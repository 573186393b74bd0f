use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use crate::domain::{BuildIdentity, BuildLink, Locator, Platform};
use crate::error::DevUpdateError;

use super::html::anchors;
use super::{ExtractRequest, LinkExtractor, LinkIter};

const SNAPSHOT_TEMPLATE: &str = r".*{dist}.*-{arch}-(?:\d+\.\d+-|)[a-zA-Z]+-(?P<timestamp>\d+)-r\d+[a-z]*-g(?P<version>[0-9a-z]+)\.tar(?:\.bz2|\.gz)?(?:$|[?#])";
const MILHOUSE_TEMPLATE: &str = r"{dist}-{arch}-(?:\d+\.\d+-|)Milhouse-(?P<timestamp>\d+)-(?:r|%23|#)(?P<version>\d+[a-z]*)-g[0-9a-z]+\.tar(?:\.bz2|\.gz)?(?:$|[?#])";

/// File name pattern with `{dist}` and `{arch}` placeholders.
///
/// The compiled pattern must name a `timestamp` group (`YYYYmmddHHMMSS`) and
/// a `version` group. It is matched case-insensitively from the start of the
/// href.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildPattern {
    template: String,
    css_class: Option<String>,
}

impl BuildPattern {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            css_class: None,
        }
    }

    /// Snapshot builds, versioned by their short commit hash.
    pub fn snapshot() -> Self {
        Self::new(SNAPSHOT_TEMPLATE)
    }

    /// Milhouse test builds, versioned by their revision number.
    pub fn milhouse() -> Self {
        Self::new(MILHOUSE_TEMPLATE)
    }

    /// Only consider anchors carrying this CSS class (Dropbox folder pages).
    pub fn with_css_class(mut self, class: impl Into<String>) -> Self {
        self.css_class = Some(class.into());
        self
    }

    pub fn css_class(&self) -> Option<&str> {
        self.css_class.as_deref()
    }

    pub fn compile(&self, platform: &Platform) -> Result<Regex, DevUpdateError> {
        let source = self
            .template
            .replace("{dist}", &regex::escape(&platform.dist()))
            .replace("{arch}", &regex::escape(platform.arch()));
        RegexBuilder::new(&format!("^(?:{source})"))
            .case_insensitive(true)
            .build()
            .map_err(|err| DevUpdateError::ListingMalformed(format!("bad build pattern: {err}")))
    }
}

/// Scans one HTML page for anchors whose href matches a [`BuildPattern`].
#[derive(Debug, Clone)]
pub struct PatternLinkExtractor {
    pattern: BuildPattern,
}

impl PatternLinkExtractor {
    pub fn new(pattern: BuildPattern) -> Self {
        Self { pattern }
    }

    pub fn snapshot() -> Self {
        Self::new(BuildPattern::snapshot())
    }

    pub fn milhouse() -> Self {
        Self::new(BuildPattern::milhouse())
    }

    pub fn dropbox() -> Self {
        Self::new(BuildPattern::snapshot().with_css_class("filename-link"))
    }

    pub fn pattern(&self) -> &BuildPattern {
        &self.pattern
    }
}

impl LinkExtractor for PatternLinkExtractor {
    fn extract<'a>(&'a self, req: ExtractRequest<'a>) -> Result<LinkIter<'a>, DevUpdateError> {
        let html = req.transport.get_text(req.url)?;
        let re = self.pattern.compile(req.platform)?;
        let base = req.url.clone();

        let matching = anchors(&html).into_iter().filter(move |anchor| {
            self.pattern
                .css_class()
                .is_none_or(|class| anchor.has_class(class))
        });

        let links = matching.filter_map(move |anchor| {
            let caps = re.captures(&anchor.href)?;
            let identity = match BuildIdentity::build(&caps["timestamp"], &caps["version"]) {
                Ok(identity) => identity,
                Err(err) => {
                    debug!(href = %anchor.href, error = %err, "skipping build link");
                    return None;
                }
            };
            match Locator::from_href(&base, &anchor.href) {
                Ok(locator) => Some(Ok(BuildLink::new(identity, locator))),
                Err(err) => {
                    warn!(href = %anchor.href, error = %err, "ignoring unusable build link");
                    None
                }
            }
        });
        Ok(Box::new(links))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn platform() -> Platform {
        Platform::new("OpenELEC", "RPi.arm")
    }

    #[test]
    fn snapshot_pattern_captures_timestamp_and_hash() {
        let re = BuildPattern::snapshot().compile(&platform()).unwrap();
        let caps = re
            .captures("OpenELEC-RPi.arm-devel-20150101000000-r100-gabc123.tar.bz2")
            .unwrap();
        assert_eq!(&caps["timestamp"], "20150101000000");
        assert_eq!(&caps["version"], "abc123");
        assert!(re.is_match("/builds/openelec-RPi.arm-6.0-devel-20150101000000-r100-gabc123.tar"));
        assert!(!re.is_match("OpenELEC-RPi2.arm-devel-20150101000000-r100-gabc123.tar"));
        assert!(!re.is_match("OpenELEC-RPi.arm-devel-20150101000000-r100-gabc123.tar.bz2.md5"));
    }

    #[test]
    fn milhouse_pattern_accepts_encoded_hash() {
        let platform = Platform::new("LibreELEC", "RPi2.arm");
        let re = BuildPattern::milhouse().compile(&platform).unwrap();
        let caps = re
            .captures("LibreELEC-RPi2.arm-9.0-Milhouse-20180101000000-%230101a-gabc1234.tar")
            .unwrap();
        assert_eq!(&caps["version"], "0101a");
        assert!(re.is_match("LibreELEC-RPi2.arm-Milhouse-20180101000000-r0101-gabc1234.tar.bz2"));
    }
}
