use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::catalog::SourceCatalog;
use crate::config::Settings;
use crate::domain::{BuildIdentity, BuildLink, DISPLAY_DATE_FMT, Platform};
use crate::enrich::Summaries;
use crate::error::DevUpdateError;
use crate::extract::ForumPostDetails;
use crate::http::{HttpTransport, Transport};
use crate::notify::NotifyRecord;
use crate::pipeline::{AcquisitionPipeline, PipelineOptions, PipelineOutcome, StagedBuild};
use crate::progress::ProgressSink;
use crate::store::Layout;
use crate::system::OsRelease;
use crate::verify::Verification;

#[derive(Debug, Clone, Serialize)]
pub struct SourcesResult {
    pub platform: String,
    pub sources: Vec<SourceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub source: String,
    pub platform: String,
    pub installed: Option<String>,
    pub builds: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub index: usize,
    pub version: String,
    pub date: Option<String>,
    pub release: bool,
    pub file_name: String,
    pub url: String,
    pub size: Option<u64>,
    pub installed: bool,
    pub summary: Option<String>,
    pub details_url: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub source: String,
    pub build: String,
    pub status: FetchStatus,
    pub files: Vec<String>,
    pub archive_warning: Option<String>,
    pub verified: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FetchStatus {
    Staged,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub source: String,
    pub installed: String,
    pub latest: Option<String>,
    pub newer_available: bool,
    /// An update is already staged and waiting for the next boot.
    pub pending_update: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfirmResult {
    pub source: String,
    pub expected: String,
    pub installed: String,
    pub succeeded: bool,
}

/// Everything needed to list, fetch and confirm builds on this system.
pub struct App {
    catalog: SourceCatalog,
    layout: Layout,
    os_release: OsRelease,
    notify_path: Utf8PathBuf,
    verify_files: bool,
    default_source: Option<String>,
}

impl App {
    pub fn new(
        catalog: SourceCatalog,
        layout: Layout,
        os_release: OsRelease,
        notify_path: Utf8PathBuf,
        settings: &Settings,
    ) -> Self {
        Self {
            catalog,
            layout,
            os_release,
            notify_path,
            verify_files: settings.verify_files,
            default_source: settings.source_name.clone(),
        }
    }

    /// Wire up the real network, paths and built-in sources from settings.
    pub fn from_settings(settings: &Settings, os_release: OsRelease) -> Result<Self, DevUpdateError> {
        let platform = os_release.platform(settings.arch.as_deref());
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(settings.timeout)?);
        let mut catalog = SourceCatalog::builtin(platform, transport, settings.debug_builds)?;
        catalog.add_custom_sources(&settings.custom_sources);

        let defaults = Layout::new()?;
        let layout = Layout::new_with_paths(
            settings
                .work_dir
                .clone()
                .unwrap_or_else(|| defaults.work_dir().to_owned()),
            settings
                .update_dir
                .clone()
                .unwrap_or_else(|| defaults.update_dir().to_owned()),
        )
        .with_archive_root(settings.archive_root.clone());

        Ok(Self::new(
            catalog,
            layout,
            os_release,
            NotifyRecord::default_path()?,
            settings,
        ))
    }

    pub fn platform(&self) -> &Platform {
        self.catalog.platform()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn catalog(&self) -> &SourceCatalog {
        &self.catalog
    }

    /// The requested source, else the configured one, else the first.
    pub fn source_name(&self, requested: Option<&str>) -> Result<String, DevUpdateError> {
        if let Some(name) = requested.or(self.default_source.as_deref()) {
            return self.catalog.get(name).map(|entry| entry.name.clone());
        }
        self.catalog
            .names()
            .next()
            .map(str::to_string)
            .ok_or_else(|| DevUpdateError::UnknownSource("no sources configured".to_string()))
    }

    pub fn sources(&self) -> SourcesResult {
        SourcesResult {
            platform: self.platform().to_string(),
            sources: self
                .catalog
                .entries()
                .iter()
                .map(|entry| SourceSummary {
                    name: entry.name.clone(),
                    url: entry.url.to_string(),
                })
                .collect(),
        }
    }

    pub fn builds(&self, source: &str) -> Result<Vec<BuildLink>, DevUpdateError> {
        self.catalog.builds(source)
    }

    /// List a source's builds. Summaries are fetched alongside and included
    /// if they arrive within `summary_wait`.
    pub fn list(&self, source: &str, summary_wait: Duration) -> Result<ListResult, DevUpdateError> {
        let summaries = self.catalog.enrich(source)?;
        let builds = self.builds(source)?;
        let summaries = summaries.wait(summary_wait);
        let installed = self.installed_build().ok();
        Ok(ListResult {
            source: source.to_string(),
            platform: self.platform().to_string(),
            installed: installed.as_ref().map(ToString::to_string),
            builds: list_entries(&builds, &summaries, installed.as_ref()),
        })
    }

    /// Full release notes for a build summary that links to them.
    pub fn details(&self, details_url: &str) -> Result<String, DevUpdateError> {
        ForumPostDetails::new(details_url)?.fetch(self.catalog.transport().as_ref())
    }

    /// Run the acquisition pipeline for `link`. Stale update files are removed
    /// first; a successful acquisition leaves a notify record for `confirm`.
    pub fn fetch(
        &self,
        source: &str,
        link: BuildLink,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, DevUpdateError> {
        let removed = self.layout.clear_staging()?;
        if !removed.is_empty() {
            info!(count = removed.len(), "removed stale update files");
        }

        let build = link.identity.clone();
        let options = PipelineOptions {
            verify: self.verify_files,
        };
        let pipeline = AcquisitionPipeline::new(
            link,
            source,
            self.catalog.transport().as_ref(),
            &self.layout,
            self.catalog.platform(),
            options,
        );
        match pipeline.run(sink)? {
            PipelineOutcome::Success(staged) => {
                NotifyRecord::new(source, &build).write(&self.notify_path)?;
                Ok(fetch_result(source, &build, staged))
            }
            PipelineOutcome::Cancelled { stage } => {
                debug!(%stage, "fetch cancelled");
                Ok(FetchResult {
                    source: source.to_string(),
                    build: build.to_string(),
                    status: FetchStatus::Cancelled,
                    files: Vec::new(),
                    archive_warning: None,
                    verified: None,
                })
            }
        }
    }

    pub fn installed_build(&self) -> Result<BuildIdentity, DevUpdateError> {
        self.os_release
            .installed_build(self.catalog.tags(), self.catalog.transport().as_ref())
    }

    /// Compare the newest build of `source` with the installed build.
    pub fn check(&self, source: &str) -> Result<CheckResult, DevUpdateError> {
        let installed = self.installed_build()?;
        let latest = self.catalog.latest(source)?;
        let newer_available = match &latest {
            Some(latest) => latest.identity.try_cmp(&installed)? == Ordering::Greater,
            None => false,
        };
        Ok(CheckResult {
            source: source.to_string(),
            installed: installed.to_string(),
            latest: latest.map(|link| link.identity.to_string()),
            newer_available,
            pending_update: self.layout.has_pending_update()?,
        })
    }

    /// Compare the installed build with the notify record left by `fetch`,
    /// then remove the record. `None` when there was nothing to confirm.
    pub fn confirm(&self) -> Result<Option<ConfirmResult>, DevUpdateError> {
        let Some(record) = NotifyRecord::read(&self.notify_path)? else {
            return Ok(None);
        };
        let expected = record.resolve(self.catalog.tags(), self.catalog.transport().as_ref())?;
        let installed = self.installed_build()?;
        NotifyRecord::remove(&self.notify_path)?;
        let succeeded = installed == expected;
        if !succeeded {
            warn!(expected = %expected, installed = %installed, "installed build differs from the selected one");
        }
        Ok(Some(ConfirmResult {
            source: record.source,
            expected: expected.to_string(),
            installed: installed.to_string(),
            succeeded,
        }))
    }
}

fn list_entries(
    builds: &[BuildLink],
    summaries: &Summaries,
    installed: Option<&BuildIdentity>,
) -> Vec<ListEntry> {
    builds
        .iter()
        .enumerate()
        .map(|(index, link)| {
            let info = summaries.get(link.identity.version());
            ListEntry {
                index,
                version: link.identity.version().to_string(),
                date: link.identity.date(DISPLAY_DATE_FMT),
                release: link.identity.is_release(),
                file_name: link.locator.file_name.clone(),
                url: link.locator.url.to_string(),
                size: link.locator.size,
                installed: installed == Some(&link.identity),
                summary: info.map(|info| info.summary.clone()),
                details_url: info.and_then(|info| info.details_url.clone()),
            }
        })
        .collect()
}

fn fetch_result(source: &str, build: &BuildIdentity, staged: StagedBuild) -> FetchResult {
    FetchResult {
        source: source.to_string(),
        build: build.to_string(),
        status: FetchStatus::Staged,
        files: staged.files.iter().map(ToString::to_string).collect(),
        archive_warning: staged.archive_warning,
        verified: staged
            .verification
            .map(|verification| verification == Verification::Verified),
    }
}
