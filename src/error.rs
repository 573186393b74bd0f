use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum DevUpdateError {
    #[error("build listing at {url} unavailable: status {status}")]
    #[diagnostic(help("the source may be offline or the URL may have moved"))]
    ListingUnavailable { url: String, status: u16 },

    #[error("malformed build listing: {0}")]
    ListingMalformed(String),

    #[error("connection error for {url}: {message}")]
    #[diagnostic(help("check the network connection and try again"))]
    Connection { url: String, message: String },

    #[error("unable to write {path}: {message}")]
    #[diagnostic(help("check the configured directory exists and is writable"))]
    Write { path: PathBuf, message: String },

    #[error("failed to decompress {path}: {message}")]
    #[diagnostic(help("the downloaded file is corrupt; run the update again to download it afresh"))]
    Decompress { path: PathBuf, message: String },

    #[error("{image} checksum does not match its {image}.md5 file")]
    #[diagnostic(help("the staged update files were removed; download the build again"))]
    IntegrityMismatch { image: String },

    #[error("build {0} has no resolved timestamp and cannot be ordered")]
    UnresolvedTimestamp(String),

    #[error("no builds found for platform {platform}")]
    NoBuildsFound { platform: String },

    #[error("unknown build source: {0}")]
    UnknownSource(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid release version: {0}")]
    InvalidVersion(String),

    #[error("invalid build record: {0}")]
    InvalidRecord(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("archive directory {0} is not accessible")]
    #[diagnostic(help("check the archive root in the settings file"))]
    ArchiveUnavailable(PathBuf),

    #[error("update file {name} is missing from the build archive")]
    MissingMember { name: String },

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl DevUpdateError {
    pub(crate) fn write(path: impl AsRef<Path>, err: impl std::fmt::Display) -> Self {
        DevUpdateError::Write {
            path: path.as_ref().to_path_buf(),
            message: err.to_string(),
        }
    }
}
