use std::collections::HashSet;

use regex::RegexBuilder;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, info};

use crate::domain::{BuildLink, Locator, Platform, ReleaseVersion, with_trailing_slash};
use crate::error::DevUpdateError;
use crate::http::Transport;

use super::html::anchors;
use super::{ExtractRequest, LinkExtractor, LinkIter};

const RELEASE_TEMPLATE: &str = r".*{dist}.*-{arch}-(?P<version>[\d\.]+)\.tar(?:\.bz2|\.gz)?(?:$|[?#])";

/// Listing of release archives named `<Dist>-<arch>-<x.y.z>.tar[.bz2]`.
///
/// With probing enabled, versions older than the newest tagged listed release are
/// synthesized down to the floor and each one is looked for at
/// `<base>/<Dist>-<arch>-<version>.tar.bz2`, then `.tar`. Every probe is one
/// HEAD request.
#[derive(Debug, Clone)]
pub struct ReleaseLinkExtractor {
    base_url: Option<Url>,
    probe: bool,
}

impl ReleaseLinkExtractor {
    pub fn new() -> Self {
        Self {
            base_url: None,
            probe: false,
        }
    }

    /// Resolve download links against `base_url` instead of the listing URL.
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = Some(base_url);
        self
    }

    pub fn probing_older(mut self) -> Self {
        self.probe = true;
        self
    }

    fn listed(
        &self,
        html: &str,
        req: &ExtractRequest<'_>,
    ) -> Result<Vec<(ReleaseVersion, Result<Locator, DevUpdateError>)>, DevUpdateError> {
        let source = RELEASE_TEMPLATE
            .replace("{dist}", &regex::escape(&req.platform.dist()))
            .replace("{arch}", &regex::escape(req.platform.arch()));
        let re = RegexBuilder::new(&format!("^(?:{source})"))
            .case_insensitive(true)
            .build()
            .map_err(|err| DevUpdateError::ListingMalformed(format!("bad release pattern: {err}")))?;
        let base = self.base_url.as_ref().unwrap_or(req.url);

        let mut found = Vec::new();
        for anchor in anchors(html) {
            let Some(caps) = re.captures(&anchor.href) else {
                continue;
            };
            match caps["version"].parse::<ReleaseVersion>() {
                Ok(version) => found.push((version, Locator::from_href(base, &anchor.href))),
                Err(err) => debug!(href = %anchor.href, error = %err, "skipping release link"),
            }
        }
        Ok(found)
    }
}

impl Default for ReleaseLinkExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkExtractor for ReleaseLinkExtractor {
    fn extract<'a>(&'a self, req: ExtractRequest<'a>) -> Result<LinkIter<'a>, DevUpdateError> {
        let html = req.transport.get_text(req.url)?;
        let listed = self.listed(&html, &req)?;

        let candidates = if self.probe {
            let seen: HashSet<ReleaseVersion> =
                listed.iter().map(|(version, _)| version.clone()).collect();
            let mut tagged = Vec::new();
            for version in &seen {
                if req.tags.timestamp_for(version, req.transport)?.is_some() {
                    tagged.push(version);
                }
            }
            tagged
                .into_iter()
                .max()
                .map(|newest| older_versions(newest, req.tags.floor(), &seen))
                .unwrap_or_default()
        } else {
            Vec::new()
        };
        let probe_base = self.base_url.clone().unwrap_or_else(|| req.url.clone());

        let listed = listed.into_iter().filter_map(move |(version, locator)| {
            let identity = match req.tags.release(version, req.transport) {
                Ok(identity) => identity,
                Err(err) => return Some(Err(err)),
            };
            if !identity.is_offered(req.tags.floor()) {
                debug!(version = identity.version(), "release not offered");
                return None;
            }
            Some(locator.map(|locator| BuildLink::new(identity, locator)))
        });

        let probed = CandidateProbe::new(candidates, probe_base, req);
        Ok(Box::new(listed.chain(probed)))
    }
}

/// Versions below `newest` worth probing for, newest first.
///
/// Patches of the same minor count down to zero. Each lower minor, down to
/// the floor's, is then walked upwards from patch zero; the walk over one
/// minor ends at its first missing release, which [`CandidateProbe`] decides.
fn older_versions(
    newest: &ReleaseVersion,
    floor: &ReleaseVersion,
    listed: &HashSet<ReleaseVersion>,
) -> Vec<Candidate> {
    let major = newest.major();
    let mut candidates = Vec::new();
    for patch in (0..newest.patch()).rev() {
        candidates.push(Candidate::new(major, newest.minor(), patch, false));
    }
    let lowest_minor = if floor.major() == major { floor.minor() } else { 0 };
    for minor in (lowest_minor..newest.minor()).rev() {
        candidates.push(Candidate::new(major, minor, 0, true));
    }
    candidates
        .into_iter()
        .filter(|candidate| {
            &candidate.version >= floor
                && (candidate.ascending || !listed.contains(&candidate.version))
        })
        .collect()
}

#[derive(Debug, Clone)]
struct Candidate {
    version: ReleaseVersion,
    /// Keep trying higher patches after a hit.
    ascending: bool,
}

impl Candidate {
    fn new(major: u32, minor: u32, patch: u32, ascending: bool) -> Self {
        Self {
            version: ReleaseVersion::from_parts(&[major, minor, patch]),
            ascending,
        }
    }

    fn next_patch(&self) -> Self {
        Self::new(
            self.version.major(),
            self.version.minor(),
            self.version.patch() + 1,
            self.ascending,
        )
    }
}

/// Lazily probes synthesized candidates, one HEAD request per attempt.
struct CandidateProbe<'a> {
    pending: std::vec::IntoIter<Candidate>,
    ascending: Option<Candidate>,
    base: Url,
    req: ExtractRequest<'a>,
}

impl<'a> CandidateProbe<'a> {
    fn new(candidates: Vec<Candidate>, base: Url, req: ExtractRequest<'a>) -> Self {
        Self {
            pending: candidates.into_iter(),
            ascending: None,
            base,
            req,
        }
    }

    fn try_candidate(&self, candidate: &Candidate) -> Result<Option<BuildLink>, DevUpdateError> {
        let identity = self
            .req
            .tags
            .release(candidate.version.clone(), self.req.transport)?;
        if !identity.is_offered(self.req.tags.floor()) {
            debug!(version = %candidate.version, "no tag for candidate, not probing");
            return Ok(None);
        }
        let locator = probe_locator(
            &self.base,
            self.req.platform,
            &candidate.version,
            self.req.transport,
        )?;
        Ok(locator.map(|locator| BuildLink::new(identity, locator)))
    }
}

impl Iterator for CandidateProbe<'_> {
    type Item = Result<BuildLink, DevUpdateError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let candidate = match self.ascending.take() {
                Some(candidate) => candidate,
                None => self.pending.next()?,
            };
            match self.try_candidate(&candidate) {
                Ok(Some(link)) => {
                    if candidate.ascending {
                        self.ascending = Some(candidate.next_patch());
                    }
                    return Some(Ok(link));
                }
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Look for a release archive under `base`, compressed first.
pub fn probe_locator(
    base: &Url,
    platform: &Platform,
    version: &ReleaseVersion,
    transport: &dyn Transport,
) -> Result<Option<Locator>, DevUpdateError> {
    let base = with_trailing_slash(base);
    let stem = platform.expand(&format!("{{Dist}}-{{arch}}-{version}.tar"));
    for name in [format!("{stem}.bz2"), stem] {
        let url = base
            .join(&name)
            .map_err(|err| DevUpdateError::InvalidUrl(format!("{name}: {err}")))?;
        if transport.exists(&url) {
            debug!(%url, "release probe hit");
            return Locator::new(url).map(Some);
        }
        debug!(%url, "release probe miss");
    }
    Ok(None)
}

/// Structured `releases.json` document: one entry per release series, each
/// listing the published files per platform.
#[derive(Debug, Clone)]
pub struct ReleaseJsonExtractor;

impl ReleaseJsonExtractor {
    pub fn new() -> Self {
        Self
    }

    fn links(
        document: &Value,
        platform: &Platform,
        listing: &Url,
    ) -> Result<Vec<(ReleaseVersion, Result<Locator, DevUpdateError>)>, DevUpdateError> {
        let series = document.as_object().ok_or_else(|| {
            DevUpdateError::ListingMalformed(format!("{listing}: expected a JSON object"))
        })?;
        let prefix = platform.expand("{Dist}-{arch}-");

        let mut found = Vec::new();
        for (name, entry) in series {
            let Some(base) = entry.get("url").and_then(Value::as_str) else {
                debug!(series = %name, "release series without url");
                continue;
            };
            let Ok(base) = Url::parse(base) else {
                debug!(series = %name, url = base, "release series with invalid url");
                continue;
            };
            let Some(releases) = entry
                .get("project")
                .and_then(|project| project.get(platform.arch()))
                .and_then(|arch| arch.get("releases"))
                .and_then(Value::as_object)
            else {
                continue;
            };
            for release in releases.values() {
                let Some(file) = release.get("file") else {
                    continue;
                };
                let Some(file_name) = file.get("name").and_then(Value::as_str) else {
                    continue;
                };
                let Some(version) = release_version(file_name, &prefix) else {
                    debug!(file = file_name, "unrecognised release file");
                    continue;
                };
                let size = file.get("size").and_then(|size| match size {
                    Value::Number(number) => number.as_u64(),
                    Value::String(text) => text.parse().ok(),
                    _ => None,
                });
                let locator = Locator::from_href(&base, file_name).map(|loc| loc.with_size(size));
                found.push((version, locator));
            }
        }
        Ok(found)
    }
}

impl Default for ReleaseJsonExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl LinkExtractor for ReleaseJsonExtractor {
    fn extract<'a>(&'a self, req: ExtractRequest<'a>) -> Result<LinkIter<'a>, DevUpdateError> {
        let document = req.transport.get_json(req.url)?;
        let found = Self::links(&document, req.platform, req.url)?;
        info!(count = found.len(), "releases listed");

        let links = found.into_iter().filter_map(move |(version, locator)| {
            let identity = match req.tags.release(version, req.transport) {
                Ok(identity) => identity,
                Err(err) => return Some(Err(err)),
            };
            if !identity.is_offered(req.tags.floor()) {
                return None;
            }
            Some(locator.map(|locator| BuildLink::new(identity, locator)))
        });
        Ok(Box::new(links))
    }
}

fn release_version(file_name: &str, prefix: &str) -> Option<ReleaseVersion> {
    let rest = file_name.strip_prefix(prefix)?;
    let version = rest
        .strip_suffix(".tar")
        .or_else(|| rest.strip_suffix(".tar.bz2"))
        .or_else(|| rest.strip_suffix(".tar.gz"))?;
    version.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(candidates: &[Candidate]) -> Vec<String> {
        candidates
            .iter()
            .map(|candidate| candidate.version.to_string())
            .collect()
    }

    #[test]
    fn synthesizes_patches_then_lower_minors() {
        let newest: ReleaseVersion = "8.2.3".parse().unwrap();
        let floor: ReleaseVersion = "8.0.0".parse().unwrap();
        let listed: HashSet<_> = ["8.2.3", "8.2.1"]
            .iter()
            .map(|v| v.parse::<ReleaseVersion>().unwrap())
            .collect();
        let candidates = older_versions(&newest, &floor, &listed);
        assert_eq!(versions(&candidates), vec!["8.2.2", "8.2.0", "8.1.0", "8.0.0"]);
        assert!(!candidates[0].ascending);
        assert!(candidates[2].ascending);
    }

    #[test]
    fn never_synthesizes_below_floor() {
        let newest: ReleaseVersion = "3.95.2".parse().unwrap();
        let candidates = older_versions(&newest, &ReleaseVersion::floor(), &HashSet::new());
        assert_eq!(versions(&candidates), vec!["3.95.1", "3.95.0"]);
    }

    #[test]
    fn release_version_from_file_name() {
        assert_eq!(
            release_version("LibreELEC-RPi2.arm-8.0.1.tar", "LibreELEC-RPi2.arm-"),
            Some("8.0.1".parse().unwrap())
        );
        assert_eq!(release_version("LibreELEC-RPi2.arm-8.0.1.img.gz", "LibreELEC-RPi2.arm-"), None);
        assert_eq!(release_version("LibreELEC-Generic.x86_64-8.0.1.tar", "LibreELEC-RPi2.arm-"), None);
    }
}
