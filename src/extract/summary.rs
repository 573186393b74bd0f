use std::collections::HashMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use reqwest::Url;
use serde::Deserialize;
use tracing::debug;

use crate::domain::{BuildInfo, Platform};
use crate::error::DevUpdateError;
use crate::http::Transport;

use super::html::{anchors, attribute, block_text, text_content};

const FORUM_THREAD_URL: &str = "http://forum.kodi.tv/showthread.php?tid=";
const COMMITS_URL: &str = "https://api.github.com/repositories/1093060/commits?per_page=100";
const POSTS_PER_THREAD: usize = 3;
const DETAILS_HEADING: &str = "Build Highlights:";

static DIV_OPEN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<div\s([^>]*)>").unwrap());
static LIST_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<li[^>]*>(.*?)</li\s*>").unwrap());
static BUILD_ITEM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#(\d{4}[a-z]?).*?\((.+)\)").unwrap());

/// Supplies short descriptions of builds, keyed by build version.
pub trait SummaryExtractor: Send + Sync + fmt::Debug {
    fn summaries(&self, transport: &dyn Transport) -> Result<HashMap<String, BuildInfo>, DevUpdateError>;
}

/// Release announcements in a forum thread, one list item per build:
/// `#0101a: ... (short summary)` followed by a "Release post" link.
#[derive(Debug, Clone)]
pub struct ForumThreadExtractor {
    url: Url,
}

impl ForumThreadExtractor {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn from_thread_id(thread_id: u32) -> Result<Self, DevUpdateError> {
        let url = Url::parse(&format!("{FORUM_THREAD_URL}{thread_id}"))
            .map_err(|err| DevUpdateError::InvalidUrl(err.to_string()))?;
        Ok(Self::new(url))
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn parse(&self, html: &str) -> HashMap<String, BuildInfo> {
        let mut info = HashMap::new();
        for (_, body) in post_bodies(html).into_iter().take(POSTS_PER_THREAD) {
            for item in LIST_ITEM_RE.captures_iter(body) {
                let item_html = &item[1];
                let text = text_content(item_html);
                let Some(caps) = BUILD_ITEM_RE.captures(&text) else {
                    continue;
                };
                let details_url = anchors(item_html)
                    .into_iter()
                    .find(|anchor| anchor.text == "Release post")
                    .and_then(|anchor| self.url.join(&anchor.href).ok())
                    .map(String::from);
                info.insert(
                    caps[1].to_string(),
                    BuildInfo {
                        summary: caps[2].to_string(),
                        details_url,
                    },
                );
            }
        }
        info
    }
}

impl SummaryExtractor for ForumThreadExtractor {
    fn summaries(&self, transport: &dyn Transport) -> Result<HashMap<String, BuildInfo>, DevUpdateError> {
        let html = transport.get_text(&self.url)?;
        let info = self.parse(&html);
        debug!(url = %self.url, count = info.len(), "forum summaries");
        Ok(info)
    }
}

/// Announcement threads for the platform's Milhouse builds.
pub fn forum_threads(platform: &Platform) -> Vec<u32> {
    match (platform.dist().as_str(), platform.is_rpi()) {
        ("openelec", true) => vec![224025, 231092, 250817],
        ("openelec", false) => vec![238393],
        ("libreelec", true) => vec![269814, 298461],
        ("libreelec", false) => vec![269815, 298462],
        _ => Vec::new(),
    }
}

/// Full release notes of one forum post, fetched on demand.
#[derive(Debug, Clone)]
pub struct ForumPostDetails {
    url: Url,
}

impl ForumPostDetails {
    pub fn new(url: &str) -> Result<Self, DevUpdateError> {
        let url = Url::parse(url).map_err(|err| DevUpdateError::InvalidUrl(format!("{url}: {err}")))?;
        Ok(Self { url })
    }

    pub fn fetch(&self, transport: &dyn Transport) -> Result<String, DevUpdateError> {
        let html = transport.get_text(&self.url)?;
        self.parse(&html)
    }

    pub fn parse(&self, html: &str) -> Result<String, DevUpdateError> {
        let pid = self
            .url
            .query_pairs()
            .find(|(key, _)| key == "pid")
            .map(|(_, value)| value.into_owned())
            .ok_or_else(|| DevUpdateError::InvalidUrl(format!("no post id in {}", self.url)))?;
        let wanted = format!("pid_{pid}");
        let (_, body) = post_bodies(html)
            .into_iter()
            .find(|(id, _)| id.as_deref() == Some(wanted.as_str()))
            .ok_or_else(|| DevUpdateError::ListingMalformed(format!("post {pid} not found")))?;
        let text = block_text(body);
        let start = text.find(DETAILS_HEADING).ok_or_else(|| {
            DevUpdateError::ListingMalformed(format!("post {pid} has no build highlights"))
        })?;
        Ok(text[start..].to_string())
    }
}

/// Commit messages of the distribution repository keyed by short hash.
#[derive(Debug, Clone)]
pub struct CommitLogExtractor {
    url: Url,
}

#[derive(Debug, Deserialize)]
struct CommitEntry {
    sha: String,
    commit: CommitBody,
}

#[derive(Debug, Deserialize)]
struct CommitBody {
    message: String,
}

impl CommitLogExtractor {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    pub fn github() -> Result<Self, DevUpdateError> {
        let url = Url::parse(COMMITS_URL).map_err(|err| DevUpdateError::InvalidUrl(err.to_string()))?;
        Ok(Self::new(url))
    }
}

impl SummaryExtractor for CommitLogExtractor {
    fn summaries(&self, transport: &dyn Transport) -> Result<HashMap<String, BuildInfo>, DevUpdateError> {
        let value = transport.get_json(&self.url)?;
        let commits: Vec<CommitEntry> = serde_json::from_value(value)
            .map_err(|err| DevUpdateError::ListingMalformed(format!("{}: {err}", self.url)))?;
        Ok(commits
            .into_iter()
            .map(|entry| {
                let short: String = entry.sha.chars().take(7).collect();
                let title = entry
                    .commit
                    .message
                    .split("\n\n")
                    .next()
                    .unwrap_or_default()
                    .to_string();
                (short, BuildInfo::new(title))
            })
            .collect())
    }
}

/// Each `post-body` div with its id, running up to the next one.
fn post_bodies(html: &str) -> Vec<(Option<String>, &str)> {
    let opens: Vec<_> = DIV_OPEN_RE
        .captures_iter(html)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let attrs = caps.get(1)?.as_str();
            let class = attribute(attrs, "class")?;
            class
                .split_whitespace()
                .any(|value| value == "post-body")
                .then(|| (attribute(attrs, "id"), whole.start(), whole.end()))
        })
        .collect();

    opens
        .iter()
        .enumerate()
        .map(|(idx, (id, _, body_start))| {
            let body_end = opens.get(idx + 1).map(|(_, start, _)| *start).unwrap_or(html.len());
            (id.clone(), &html[*body_start..body_end])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const THREAD: &str = r#"
        <div class="post-body" id="pid_100">
          <ul>
            <li>#0101a: Kodi update and fixes (kodi 18.0 beta, fixed audio) <a href="showthread.php?tid=1&amp;pid=200#pid200">Release post</a></li>
            <li>not a build</li>
          </ul>
        </div>
        <div class="post-body" id="pid_101"><ul><li>#0102: summary (second build)</li></ul></div>
    "#;

    #[test]
    fn parses_forum_list_items() {
        let extractor = ForumThreadExtractor::from_thread_id(269814).unwrap();
        let info = extractor.parse(THREAD);
        assert_eq!(info.len(), 2);
        assert_eq!(info["0101a"].summary, "kodi 18.0 beta, fixed audio");
        assert_eq!(
            info["0101a"].details_url.as_deref(),
            Some("http://forum.kodi.tv/showthread.php?tid=1&pid=200#pid200")
        );
        assert_eq!(info["0102"].details_url, None);
    }

    #[test]
    fn post_details_start_at_highlights() {
        let page = r#"<div class="post-body" id="pid_7">Intro<br/>Build Highlights:<ul><li>one</li></ul></div>"#;
        let details = ForumPostDetails::new("http://forum.kodi.tv/showthread.php?tid=1&pid=7").unwrap();
        assert_eq!(details.parse(page).unwrap(), "Build Highlights:\n- one");
    }
}
