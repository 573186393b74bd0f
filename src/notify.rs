use std::fs;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tracing::debug;

use crate::domain::{BuildIdentity, RecordedIdentity};
use crate::error::DevUpdateError;
use crate::http::Transport;
use crate::store::Layout;
use crate::tags::ReleaseTags;

const NOTIFY_FILE: &str = ".installed_build";

/// The build handed to the installer, written before reboot and read back
/// afterwards to confirm the installation.
///
/// On disk it is two lines: the source name and [`BuildIdentity::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyRecord {
    pub source: String,
    pub build: RecordedIdentity,
}

impl NotifyRecord {
    pub fn new(source: impl Into<String>, build: &BuildIdentity) -> Self {
        Self {
            source: source.into(),
            build: match build {
                BuildIdentity::Release { version, .. } => RecordedIdentity::Release(version.clone()),
                other => RecordedIdentity::Build(other.clone()),
            },
        }
    }

    pub fn default_path() -> Result<Utf8PathBuf, DevUpdateError> {
        BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(NOTIFY_FILE)).ok())
            .ok_or_else(|| DevUpdateError::Filesystem("unable to resolve home directory".to_string()))
    }

    pub fn to_text(&self) -> String {
        let build = match &self.build {
            RecordedIdentity::Build(identity) => identity.record(),
            RecordedIdentity::Release(version) => format!("release {version}"),
        };
        format!("{}\n{}\n", self.source, build)
    }

    pub fn parse(text: &str) -> Result<Self, DevUpdateError> {
        let mut lines = text.lines().map(str::trim).filter(|line| !line.is_empty());
        let (Some(source), Some(build)) = (lines.next(), lines.next()) else {
            return Err(DevUpdateError::InvalidRecord(text.trim().to_string()));
        };
        Ok(Self {
            source: source.to_string(),
            build: build.parse()?,
        })
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), DevUpdateError> {
        debug!(%path, source = %self.source, "writing notify record");
        Layout::write_bytes_atomic(path, self.to_text().as_bytes())
    }

    /// The record at `path`, or `None` if there is none.
    pub fn read(path: &Utf8Path) -> Result<Option<Self>, DevUpdateError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(DevUpdateError::Filesystem(format!("{path}: {err}"))),
        }
    }

    pub fn remove(path: &Utf8Path) -> Result<(), DevUpdateError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(DevUpdateError::write(path, err)),
        }
    }

    /// The exact recorded identity. Releases get their timestamp from the tag
    /// index again.
    pub fn resolve(
        &self,
        tags: &ReleaseTags,
        transport: &dyn Transport,
    ) -> Result<BuildIdentity, DevUpdateError> {
        match &self.build {
            RecordedIdentity::Build(identity) => Ok(identity.clone()),
            RecordedIdentity::Release(version) => tags.release(version.clone(), transport),
        }
    }
}
