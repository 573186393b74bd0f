//! Release dates looked up from the distribution's published git tags.
//!
//! Release file names carry no date, so every [`BuildIdentity::Release`] needs
//! the tag index. The index is fetched once, the first time any release is
//! constructed, and shared by reference from then on.

use std::collections::HashMap;
use std::sync::{LazyLock, OnceLock};

use chrono::NaiveDateTime;
use regex::Regex;
use reqwest::Url;
use tracing::{debug, info};

use crate::domain::{BuildIdentity, Platform, ReleaseVersion};
use crate::error::DevUpdateError;
use crate::http::Transport;

const TAG_DATETIME_FMT: &str = "%Y-%m-%dT%H:%M:%S";
const MAX_PAGES: usize = 100;

static TAG_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?is)class\s*=\s*["']tag-name["'][^>]*>\s*([^<]+?)\s*<|<relative-time[^>]*\bdatetime\s*=\s*["']([^"']+)["']"#,
    )
    .unwrap()
});

static NEXT_PAGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"']+)["'][^>]*>\s*Next\s*</a>"#).unwrap()
});

pub struct ReleaseTags {
    url: Option<Url>,
    floor: ReleaseVersion,
    index: OnceLock<HashMap<String, NaiveDateTime>>,
}

impl ReleaseTags {
    pub fn new(url: Url, floor: ReleaseVersion) -> Self {
        Self {
            url: Some(url),
            floor,
            index: OnceLock::new(),
        }
    }

    /// Tags page of the distribution's main repository.
    pub fn for_platform(platform: &Platform) -> Result<Self, DevUpdateError> {
        let dist = platform.dist_name();
        let url = Url::parse(&format!("https://github.com/{dist}/{dist}.tv/tags"))
            .map_err(|err| DevUpdateError::InvalidUrl(err.to_string()))?;
        Ok(Self::new(url, ReleaseVersion::floor()))
    }

    /// Index that is already known and never fetched.
    pub fn preloaded(entries: HashMap<String, NaiveDateTime>, floor: ReleaseVersion) -> Self {
        let index = OnceLock::new();
        let _ = index.set(entries);
        Self {
            url: None,
            floor,
            index,
        }
    }

    pub fn floor(&self) -> &ReleaseVersion {
        &self.floor
    }

    pub fn is_loaded(&self) -> bool {
        self.index.get().is_some()
    }

    pub fn index(
        &self,
        transport: &dyn Transport,
    ) -> Result<&HashMap<String, NaiveDateTime>, DevUpdateError> {
        if let Some(index) = self.index.get() {
            return Ok(index);
        }
        let fetched = self.fetch(transport)?;
        // A concurrent fetch may have set it first.
        let _ = self.index.set(fetched);
        self.index
            .get()
            .ok_or_else(|| DevUpdateError::ListingMalformed("release tag index unset".to_string()))
    }

    pub fn timestamp_for(
        &self,
        version: &ReleaseVersion,
        transport: &dyn Transport,
    ) -> Result<Option<NaiveDateTime>, DevUpdateError> {
        Ok(self.index(transport)?.get(version.as_str()).copied())
    }

    pub fn release(
        &self,
        version: ReleaseVersion,
        transport: &dyn Transport,
    ) -> Result<BuildIdentity, DevUpdateError> {
        let timestamp = self.timestamp_for(&version, transport)?;
        if timestamp.is_none() {
            debug!(version = %version, "release has no tag date");
        }
        Ok(BuildIdentity::release(version, timestamp))
    }

    fn fetch(
        &self,
        transport: &dyn Transport,
    ) -> Result<HashMap<String, NaiveDateTime>, DevUpdateError> {
        let mut tags = HashMap::new();
        let Some(mut url) = self.url.clone() else {
            return Ok(tags);
        };
        info!(%url, "fetching release tags");
        for _ in 0..MAX_PAGES {
            let html = transport.get_text(&url)?;
            tags.extend(parse_tags_page(&html));
            match next_page(&url, &html, &self.floor) {
                Some(next) => url = next,
                None => break,
            }
        }
        debug!(count = tags.len(), "loaded release tags");
        Ok(tags)
    }
}

/// Pair every tag name with the `relative-time` element that follows it.
pub fn parse_tags_page(html: &str) -> HashMap<String, NaiveDateTime> {
    let mut tags = HashMap::new();
    let mut pending: Option<String> = None;
    for caps in TAG_ITEM_RE.captures_iter(html) {
        if let Some(name) = caps.get(1) {
            pending = Some(name.as_str().trim().to_string());
        } else if let (Some(datetime), Some(name)) = (caps.get(2), pending.take()) {
            let raw = datetime.as_str();
            let raw = raw.get(..19).unwrap_or(raw);
            match NaiveDateTime::parse_from_str(raw, TAG_DATETIME_FMT) {
                Ok(timestamp) => {
                    tags.insert(name, timestamp);
                }
                Err(_) => debug!(tag = %name, datetime = raw, "unparseable tag date"),
            }
        }
    }
    tags
}

/// The "Next" pagination link, unless it points below the version floor.
fn next_page(current: &Url, html: &str, floor: &ReleaseVersion) -> Option<Url> {
    let href = NEXT_PAGE_RE.captures(html)?.get(1)?.as_str().replace("&amp;", "&");
    let after = href.rsplit('=').next()?;
    if let Ok(version) = after.parse::<ReleaseVersion>() {
        if &version < floor {
            return None;
        }
    }
    current.join(&href).ok()
}
