use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use reqwest::Url;
use tracing::{debug, info, warn};

use crate::config::{CustomSource, SourceKind};
use crate::domain::{BuildLink, Platform, with_trailing_slash};
use crate::enrich::{self, SummaryHandle};
use crate::error::DevUpdateError;
use crate::extract::{
    CommitLogExtractor, ExtractRequest, ForumThreadExtractor, LinkExtractor, PatternLinkExtractor,
    ReleaseJsonExtractor, ReleaseLinkExtractor, SummaryExtractor, forum_threads,
};
use crate::http::Transport;
use crate::tags::ReleaseTags;

/// One named source of builds.
#[derive(Clone)]
pub struct SourceEntry {
    pub name: String,
    pub url: Url,
    pub extractor: Arc<dyn LinkExtractor>,
    pub enrichers: Vec<Arc<dyn SummaryExtractor>>,
}

impl SourceEntry {
    /// `subdir` may use the `{dist}`, `{arch}` and `{board}` placeholders.
    pub fn new(
        name: impl Into<String>,
        base_url: &str,
        subdir: Option<&str>,
        platform: &Platform,
        extractor: Arc<dyn LinkExtractor>,
    ) -> Result<Self, DevUpdateError> {
        let base = Url::parse(&platform.expand(base_url))
            .map_err(|err| DevUpdateError::InvalidUrl(format!("{base_url}: {err}")))?;
        let url = match subdir {
            Some(subdir) => {
                let subdir = platform.expand(subdir);
                let joined = with_trailing_slash(&base)
                    .join(subdir.trim_matches('/'))
                    .map_err(|err| DevUpdateError::InvalidUrl(format!("{subdir}: {err}")))?;
                with_trailing_slash(&joined)
            }
            None => with_trailing_slash(&base),
        };
        Ok(Self {
            name: name.into(),
            url,
            extractor,
            enrichers: Vec::new(),
        })
    }

    pub fn with_enrichers(mut self, enrichers: Vec<Arc<dyn SummaryExtractor>>) -> Self {
        self.enrichers = enrichers;
        self
    }
}

impl fmt::Debug for SourceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceEntry")
            .field("name", &self.name)
            .field("url", &self.url.as_str())
            .field("extractor", &self.extractor)
            .field("enrichers", &self.enrichers.len())
            .finish()
    }
}

/// Ordered, named build sources for one platform.
///
/// The catalog owns the release tag index and hands it to every extractor,
/// so the index is fetched at most once however many sources are listed.
pub struct SourceCatalog {
    platform: Platform,
    transport: Arc<dyn Transport>,
    tags: Arc<ReleaseTags>,
    entries: Vec<SourceEntry>,
}

impl SourceCatalog {
    pub fn new(platform: Platform, transport: Arc<dyn Transport>, tags: Arc<ReleaseTags>) -> Self {
        Self {
            platform,
            transport,
            tags,
            entries: Vec::new(),
        }
    }

    /// The sources relevant to `platform`, in display order.
    pub fn builtin(
        platform: Platform,
        transport: Arc<dyn Transport>,
        debug_builds: bool,
    ) -> Result<Self, DevUpdateError> {
        let tags = Arc::new(ReleaseTags::for_platform(&platform)?);
        let mut catalog = Self::new(platform, transport, tags);
        for entry in builtin_sources(&catalog.platform, debug_builds)? {
            catalog.add(entry);
        }
        Ok(catalog)
    }

    /// Add a source, replacing any existing source of the same name in place.
    pub fn add(&mut self, entry: SourceEntry) {
        match self.entries.iter_mut().find(|existing| existing.name == entry.name) {
            Some(existing) => *existing = entry,
            None => self.entries.push(entry),
        }
    }

    pub fn add_custom(&mut self, custom: &CustomSource) -> Result<(), DevUpdateError> {
        let url = Url::parse(&custom.url)
            .map_err(|err| DevUpdateError::InvalidUrl(format!("{}: {err}", custom.url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(DevUpdateError::InvalidUrl(custom.url.clone()));
        }
        let extractor: Arc<dyn LinkExtractor> = match custom.kind {
            SourceKind::Snapshot if url.host_str() == Some("www.dropbox.com") => {
                Arc::new(PatternLinkExtractor::dropbox())
            }
            SourceKind::Snapshot => Arc::new(PatternLinkExtractor::snapshot()),
            SourceKind::Release => Arc::new(ReleaseLinkExtractor::new()),
            SourceKind::Milhouse => Arc::new(PatternLinkExtractor::milhouse()),
        };
        let mut entry = SourceEntry::new(
            custom.name.clone(),
            &custom.url,
            custom.subdir.as_deref(),
            &self.platform,
            extractor,
        )?;
        if custom.kind == SourceKind::Milhouse {
            entry = entry.with_enrichers(forum_enrichers(&self.platform)?);
        }
        debug!(name = %custom.name, url = %entry.url, "adding custom source");
        self.add(entry);
        Ok(())
    }

    /// Add custom sources, skipping invalid ones with a warning.
    pub fn add_custom_sources(&mut self, sources: &[CustomSource]) {
        for custom in sources {
            if let Err(err) = self.add_custom(custom) {
                warn!(name = %custom.name, error = %err, "skipping custom source");
            }
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    pub fn tags(&self) -> &Arc<ReleaseTags> {
        &self.tags
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn entries(&self) -> &[SourceEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Result<&SourceEntry, DevUpdateError> {
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| DevUpdateError::UnknownSource(name.to_string()))
    }

    /// Builds offered by a source, de-duplicated and newest first. An empty
    /// list means the source has nothing for this platform.
    pub fn builds(&self, name: &str) -> Result<Vec<BuildLink>, DevUpdateError> {
        let entry = self.get(name)?;
        info!(source = name, url = %entry.url, "listing builds");
        let req = ExtractRequest {
            url: &entry.url,
            platform: &self.platform,
            transport: self.transport.as_ref(),
            tags: self.tags.as_ref(),
        };
        let links = entry.extractor.extract(req)?;
        let ranked = rank_builds(links)?;
        debug!(source = name, count = ranked.len(), "builds listed");
        Ok(ranked)
    }

    pub fn latest(&self, name: &str) -> Result<Option<BuildLink>, DevUpdateError> {
        Ok(self.builds(name)?.into_iter().next())
    }

    /// Start fetching summaries for a source's builds in the background.
    pub fn enrich(&self, name: &str) -> Result<SummaryHandle, DevUpdateError> {
        let entry = self.get(name)?;
        Ok(enrich::spawn(entry.enrichers.clone(), Arc::clone(&self.transport)))
    }
}

/// Drop duplicate identities, keeping the first link seen, and sort newest
/// first. Fails if any build has no timestamp to be ordered by.
pub fn rank_builds<I>(links: I) -> Result<Vec<BuildLink>, DevUpdateError>
where
    I: IntoIterator<Item = Result<BuildLink, DevUpdateError>>,
{
    let mut seen = HashSet::new();
    let mut ranked = Vec::new();
    for link in links {
        let link = link?;
        if link.identity.timestamp().is_none() {
            return Err(DevUpdateError::UnresolvedTimestamp(
                link.identity.version().to_string(),
            ));
        }
        if seen.insert(link.identity.clone()) {
            ranked.push(link);
        } else {
            debug!(build = %link.identity, url = %link.locator.url, "duplicate build");
        }
    }
    ranked.sort_by(|a, b| b.identity.partial_cmp(&a.identity).unwrap_or(std::cmp::Ordering::Equal));
    Ok(ranked)
}

fn forum_enrichers(platform: &Platform) -> Result<Vec<Arc<dyn SummaryExtractor>>, DevUpdateError> {
    forum_threads(platform)
        .into_iter()
        .map(|thread| {
            ForumThreadExtractor::from_thread_id(thread)
                .map(|extractor| Arc::new(extractor) as Arc<dyn SummaryExtractor>)
        })
        .collect()
}

fn builtin_sources(platform: &Platform, debug_builds: bool) -> Result<Vec<SourceEntry>, DevUpdateError> {
    let mut sources = Vec::new();
    let dist = platform.dist();

    if dist == "openelec" {
        let commits: Arc<dyn SummaryExtractor> = Arc::new(CommitLogExtractor::github()?);
        sources.push(
            SourceEntry::new(
                "Official Snapshot Builds",
                "http://snapshots.openelec.tv",
                None,
                platform,
                Arc::new(PatternLinkExtractor::snapshot()),
            )?
            .with_enrichers(vec![Arc::clone(&commits)]),
        );
        if platform.is_rpi() {
            sources.push(
                SourceEntry::new(
                    "Chris Swan RPi Builds",
                    "http://resources.pichimney.com/OpenELEC/dev_builds",
                    None,
                    platform,
                    Arc::new(PatternLinkExtractor::snapshot()),
                )?
                .with_enrichers(vec![commits]),
            );
        }
        let releases_base = Url::parse("http://releases.openelec.tv")
            .map_err(|err| DevUpdateError::InvalidUrl(err.to_string()))?;
        sources.push(SourceEntry::new(
            "Official Releases",
            "http://{dist}.mirrors.uk2.net",
            None,
            platform,
            Arc::new(
                ReleaseLinkExtractor::new()
                    .with_base_url(releases_base)
                    .probing_older(),
            ),
        )?);
    }

    if dist == "libreelec" {
        let mut releases = SourceEntry::new(
            "Official Releases",
            "https://releases.libreelec.tv",
            None,
            platform,
            Arc::new(ReleaseJsonExtractor::new()),
        )?;
        releases.url = releases
            .url
            .join("releases.json")
            .map_err(|err| DevUpdateError::InvalidUrl(err.to_string()))?;
        sources.push(releases);
    }

    sources.push(SourceEntry::new(
        "Official Archive",
        "http://archive.{dist}.tv",
        None,
        platform,
        Arc::new(ReleaseLinkExtractor::new()),
    )?);

    sources.push(
        SourceEntry::new(
            "Milhouse Builds",
            "http://milhouse.{dist}.tv/builds/",
            Some("master/{board}"),
            platform,
            Arc::new(PatternLinkExtractor::milhouse()),
        )?
        .with_enrichers(forum_enrichers(platform)?),
    );

    if debug_builds {
        sources.push(SourceEntry::new(
            "Milhouse Builds (debug)",
            "http://milhouse.{dist}.tv/builds/",
            Some("debug/{board}"),
            platform,
            Arc::new(PatternLinkExtractor::milhouse()),
        )?);
    }

    Ok(sources)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_urls_expand_subdirs() {
        let platform = Platform::new("LibreELEC", "RPi2.arm");
        let entry = SourceEntry::new(
            "Milhouse Builds",
            "http://milhouse.{dist}.tv/builds/",
            Some("master/{board}"),
            &platform,
            Arc::new(PatternLinkExtractor::milhouse()),
        )
        .unwrap();
        assert_eq!(entry.url.as_str(), "http://milhouse.libreelec.tv/builds/master/RPi2/");
    }

    #[test]
    fn builtin_sources_follow_distribution() {
        let openelec = builtin_sources(&Platform::new("OpenELEC", "RPi.arm"), false).unwrap();
        let names: Vec<_> = openelec.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Official Snapshot Builds",
                "Chris Swan RPi Builds",
                "Official Releases",
                "Official Archive",
                "Milhouse Builds",
            ]
        );

        let libreelec = builtin_sources(&Platform::new("LibreELEC", "Generic.x86_64"), true).unwrap();
        let names: Vec<_> = libreelec.iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Official Releases",
                "Official Archive",
                "Milhouse Builds",
                "Milhouse Builds (debug)",
            ]
        );
        assert_eq!(libreelec[0].url.as_str(), "https://releases.libreelec.tv/releases.json");
    }
}
