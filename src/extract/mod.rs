//! Strategies that turn a source's listing document into build links.
//!
//! A [`LinkExtractor`] fetches its listing when [`LinkExtractor::extract`] is
//! called, so listing errors surface immediately, and then yields links
//! lazily. Each call fetches afresh. [`SummaryExtractor`]s never produce
//! links; they describe builds found by other extractors.

pub mod html;
mod pattern;
mod release;
mod summary;

use std::fmt;

use reqwest::Url;

use crate::domain::{BuildLink, Platform};
use crate::error::DevUpdateError;
use crate::http::Transport;
use crate::tags::ReleaseTags;

pub use pattern::{BuildPattern, PatternLinkExtractor};
pub use release::{ReleaseJsonExtractor, ReleaseLinkExtractor, probe_locator};
pub use summary::{
    CommitLogExtractor, ForumPostDetails, ForumThreadExtractor, SummaryExtractor, forum_threads,
};

/// Everything an extractor needs for one pass over a listing.
#[derive(Clone, Copy)]
pub struct ExtractRequest<'a> {
    pub url: &'a Url,
    pub platform: &'a Platform,
    pub transport: &'a dyn Transport,
    pub tags: &'a ReleaseTags,
}

impl fmt::Debug for ExtractRequest<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractRequest")
            .field("url", &self.url.as_str())
            .field("platform", self.platform)
            .finish_non_exhaustive()
    }
}

pub type LinkIter<'a> = Box<dyn Iterator<Item = Result<BuildLink, DevUpdateError>> + 'a>;

pub trait LinkExtractor: Send + Sync + fmt::Debug {
    /// Fetch the listing at `req.url` and yield the builds it offers for
    /// `req.platform`. An empty iterator is a valid result.
    fn extract<'a>(&'a self, req: ExtractRequest<'a>) -> Result<LinkIter<'a>, DevUpdateError>;
}
