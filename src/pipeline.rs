//! Carries one selected build from its remote (or archived) tar to verified
//! update files in the staging directory.
//!
//! Stages run strictly in order and each is skipped when its output already
//! exists, so an interrupted acquisition resumes where it stopped. Every
//! stage writes to a `.part` file or removes its own partial output before
//! reporting cancellation or an error; earlier stages' outputs are left alone.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::Path;

use bzip2::read::BzDecoder;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::read::GzDecoder;
use tracing::{debug, info, warn};

use crate::domain::{BuildLink, Compression, Platform};
use crate::error::DevUpdateError;
use crate::http::Transport;
use crate::progress::{
    CopyError, CountingReader, NullSink, ProgressSink, Transfer, copy_with_progress,
};
use crate::store::{Layout, remove_if_exists};
use crate::verify::{IntegrityVerifier, Verification, read_checksum_file};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    ArchiveLookup,
    Download,
    Decompress,
    ArchiveWrite,
    Staging,
    Verify,
}

impl Stage {
    pub fn label(self) -> &'static str {
        match self {
            Stage::ArchiveLookup => "Copying from archive",
            Stage::Download => "Downloading",
            Stage::Decompress => "Decompressing",
            Stage::ArchiveWrite => "Archiving",
            Stage::Staging => "Staging",
            Stage::Verify => "Verifying",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    /// Extract the image files and check them against their `.md5` files.
    pub verify: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self { verify: true }
    }
}

/// Progress of one acquisition. Never reused for another build.
#[derive(Debug, Clone)]
pub struct PipelineState {
    pub link: BuildLink,
    pub stage: Option<Stage>,
    pub transferred: BTreeMap<Stage, u64>,
    pub download_path: Utf8PathBuf,
    pub tar_path: Utf8PathBuf,
    pub archive_path: Option<Utf8PathBuf>,
    pub staged: Vec<Utf8PathBuf>,
}

#[derive(Debug, Clone)]
pub struct StagedBuild {
    pub link: BuildLink,
    pub files: Vec<Utf8PathBuf>,
    /// Set when the build could not be copied into the archive.
    pub archive_warning: Option<String>,
    /// `None` when verification is disabled.
    pub verification: Option<Verification>,
    pub transferred: BTreeMap<Stage, u64>,
}

#[derive(Debug, Clone)]
pub enum PipelineOutcome {
    Success(StagedBuild),
    Cancelled { stage: Stage },
}

pub struct AcquisitionPipeline<'a> {
    state: PipelineState,
    source: String,
    transport: &'a dyn Transport,
    layout: &'a Layout,
    platform: &'a Platform,
    options: PipelineOptions,
    verifier: IntegrityVerifier,
}

impl<'a> AcquisitionPipeline<'a> {
    pub fn new(
        link: BuildLink,
        source: impl Into<String>,
        transport: &'a dyn Transport,
        layout: &'a Layout,
        platform: &'a Platform,
        options: PipelineOptions,
    ) -> Self {
        let source = source.into();
        let download_path = layout.work_path(&link.locator.file_name);
        let tar_path = layout.work_path(&link.locator.tar_name);
        let archive_path = link
            .locator
            .archive_path
            .clone()
            .or_else(|| layout.archive_path(&source, &link.locator.tar_name));
        Self {
            state: PipelineState {
                link,
                stage: None,
                transferred: BTreeMap::new(),
                download_path,
                tar_path,
                archive_path,
                staged: Vec::new(),
            },
            source,
            transport,
            layout,
            platform,
            options,
            verifier: IntegrityVerifier::new(),
        }
    }

    pub fn run(mut self, sink: &dyn ProgressSink) -> Result<PipelineOutcome, DevUpdateError> {
        self.layout.ensure_work_dir()?;
        self.layout.ensure_update_dir()?;
        info!(build = %self.state.link, source = %self.source, "starting acquisition");

        let compressed = self.state.link.locator.compression;
        let tar_ready = compressed.is_some() && self.state.tar_path.is_file();
        let archived = self
            .state
            .archive_path
            .as_ref()
            .is_some_and(|path| path.is_file());

        if tar_ready {
            info!(path = %self.state.tar_path, "decompressed build already present");
        } else if archived {
            if self.archive_lookup(sink)?.is_cancelled() {
                return Ok(self.cancelled(sink));
            }
        } else {
            if self.download(sink)?.is_cancelled() {
                return Ok(self.cancelled(sink));
            }
            if let Some(compression) = compressed {
                if self.decompress(compression, sink)?.is_cancelled() {
                    return Ok(self.cancelled(sink));
                }
            }
        }

        let archive_warning = if archived { None } else { self.archive_write(sink) };

        self.stage_files(sink)?;

        let verification = if self.options.verify {
            Some(self.verify(sink)?)
        } else {
            None
        };
        sink.finish();

        let state = self.state;
        info!(files = state.staged.len(), "update staged");
        Ok(PipelineOutcome::Success(StagedBuild {
            link: state.link,
            files: state.staged,
            archive_warning,
            verification,
            transferred: state.transferred,
        }))
    }

    fn enter(&mut self, stage: Stage, sink: &dyn ProgressSink, label: &str) {
        debug!(%stage, label, "entering stage");
        self.state.stage = Some(stage);
        sink.begin(stage, label);
    }

    fn record(&mut self, stage: Stage, bytes: u64) {
        *self.state.transferred.entry(stage).or_default() += bytes;
    }

    fn cancelled(&self, sink: &dyn ProgressSink) -> PipelineOutcome {
        let stage = self.state.stage.unwrap_or(Stage::Download);
        info!(%stage, "acquisition cancelled");
        sink.finish();
        PipelineOutcome::Cancelled { stage }
    }

    /// Copy the archived tar into the work directory in place of a download.
    fn archive_lookup(&mut self, sink: &dyn ProgressSink) -> Result<Transfer, DevUpdateError> {
        let Some(archive) = self.state.archive_path.clone() else {
            return Ok(Transfer::Complete(0));
        };
        self.enter(Stage::ArchiveLookup, sink, archive.as_str());
        let part = part_path(&self.state.tar_path);
        let result = copy_file(&archive, &part, sink);
        match result {
            Ok(Transfer::Complete(bytes)) => {
                fs::rename(&part, &self.state.tar_path).map_err(|err| {
                    remove_if_exists(&part);
                    DevUpdateError::write(&self.state.tar_path, err)
                })?;
                self.record(Stage::ArchiveLookup, bytes);
                info!(%archive, "copied build from archive");
                Ok(Transfer::Complete(bytes))
            }
            Ok(cancelled @ Transfer::Cancelled(_)) => {
                remove_if_exists(&part);
                Ok(cancelled)
            }
            Err(err) => {
                remove_if_exists(&part);
                Err(err)
            }
        }
    }

    fn download(&mut self, sink: &dyn ProgressSink) -> Result<Transfer, DevUpdateError> {
        let file_name = self.state.link.locator.file_name.clone();
        self.enter(Stage::Download, sink, &file_name);
        let path = self.state.download_path.clone();
        let local_size = fs::metadata(&path).ok().map(|meta| meta.len());

        if let Some(size) = self.state.link.locator.size {
            if local_size == Some(size) {
                info!(%path, size, "download already complete");
                return Ok(Transfer::Complete(0));
            }
        }

        let url = self.state.link.locator.url.clone();
        let mut remote = self.transport.open(&url)?;
        let size = remote.size.or(self.state.link.locator.size);
        self.state.link.locator.size = size;
        if size.is_some() && local_size == size {
            info!(%path, "download already complete");
            return Ok(Transfer::Complete(0));
        }

        debug!(%url, ?size, "downloading");
        let mut file = File::create(&path).map_err(|err| DevUpdateError::write(&path, err))?;
        let result = copy_with_progress(&mut remote.body, &mut file, size, sink, None);
        drop(file);
        match result {
            Ok(Transfer::Complete(bytes)) => {
                if let Some(expected) = size.filter(|expected| bytes < *expected) {
                    remove_if_exists(&path);
                    return Err(DevUpdateError::Connection {
                        url: url.to_string(),
                        message: format!("transfer ended after {bytes} of {expected} bytes"),
                    });
                }
                self.record(Stage::Download, bytes);
                Ok(Transfer::Complete(bytes))
            }
            Ok(cancelled @ Transfer::Cancelled(_)) => {
                remove_if_exists(&path);
                Ok(cancelled)
            }
            Err(CopyError::Read(err)) => {
                remove_if_exists(&path);
                Err(DevUpdateError::Connection {
                    url: url.to_string(),
                    message: err.to_string(),
                })
            }
            Err(CopyError::Write(err)) => {
                remove_if_exists(&path);
                Err(DevUpdateError::write(&path, err))
            }
        }
    }

    /// The compressed download is removed once decompressed, and also when it
    /// turns out to be corrupt. A cancelled or failed write keeps it so only
    /// decompression is repeated next time.
    fn decompress(
        &mut self,
        compression: Compression,
        sink: &dyn ProgressSink,
    ) -> Result<Transfer, DevUpdateError> {
        let tar_name = self.state.link.locator.tar_name.clone();
        self.enter(Stage::Decompress, sink, &tar_name);
        let source = self.state.download_path.clone();
        let input = File::open(&source)
            .map_err(|err| DevUpdateError::Filesystem(format!("{source}: {err}")))?;
        let total = input
            .metadata()
            .map_err(|err| DevUpdateError::Filesystem(format!("{source}: {err}")))?
            .len();

        let counting = CountingReader::new(BufReader::new(input));
        let consumed = counting.counter();
        let mut decoder: Box<dyn Read> = match compression {
            Compression::Bzip2 => Box::new(BzDecoder::new(counting)),
            Compression::Gzip => Box::new(GzDecoder::new(counting)),
        };

        let part = part_path(&self.state.tar_path);
        let mut output = File::create(&part).map_err(|err| DevUpdateError::write(&part, err))?;
        let result = copy_with_progress(
            &mut decoder,
            &mut output,
            Some(total),
            sink,
            Some(consumed.as_ref()),
        );
        drop(output);
        match result {
            Ok(Transfer::Complete(bytes)) => {
                fs::rename(&part, &self.state.tar_path).map_err(|err| {
                    remove_if_exists(&part);
                    DevUpdateError::write(&self.state.tar_path, err)
                })?;
                remove_if_exists(&source);
                self.record(Stage::Decompress, bytes);
                Ok(Transfer::Complete(bytes))
            }
            Ok(cancelled @ Transfer::Cancelled(_)) => {
                remove_if_exists(&part);
                Ok(cancelled)
            }
            Err(CopyError::Read(err)) => {
                remove_if_exists(&part);
                remove_if_exists(&source);
                Err(DevUpdateError::Decompress {
                    path: source.into(),
                    message: err.to_string(),
                })
            }
            Err(CopyError::Write(err)) => {
                remove_if_exists(&part);
                Err(DevUpdateError::write(&part, err))
            }
        }
    }

    /// Copy the tar into the archive. Never fatal: a failure is returned as a
    /// warning for the host and cancellation just drops the partial copy.
    fn archive_write(&mut self, sink: &dyn ProgressSink) -> Option<String> {
        let archive = self.state.archive_path.clone()?;
        if archive.exists() {
            return None;
        }
        self.enter(Stage::ArchiveWrite, sink, archive.as_str());
        if let Err(err) = self.layout.ensure_archive_dir(&self.source) {
            warn!(error = %err, "archive unavailable");
            return Some(err.to_string());
        }
        let part = part_path(&archive);
        match copy_file(&self.state.tar_path, &part, sink) {
            Ok(Transfer::Complete(bytes)) => match fs::rename(&part, &archive) {
                Ok(()) => {
                    self.record(Stage::ArchiveWrite, bytes);
                    info!(%archive, "build archived");
                    None
                }
                Err(err) => {
                    remove_if_exists(&part);
                    let err = DevUpdateError::write(&archive, err);
                    warn!(error = %err, "archive copy failed");
                    Some(err.to_string())
                }
            },
            Ok(Transfer::Cancelled(_)) => {
                remove_if_exists(&part);
                info!(%archive, "archive copy cancelled");
                None
            }
            Err(err) => {
                remove_if_exists(&part);
                warn!(error = %err, "archive copy failed");
                Some(err.to_string())
            }
        }
    }

    fn stage_files(&mut self, sink: &dyn ProgressSink) -> Result<(), DevUpdateError> {
        let tar_name = self.state.link.locator.tar_name.clone();
        self.enter(Stage::Staging, sink, &tar_name);
        if self.options.verify {
            self.state.staged = self.extract_images()?;
            remove_if_exists(&self.state.tar_path);
        } else {
            let staged = self.layout.staged_path(&tar_name);
            Layout::move_file(&self.state.tar_path, &staged)?;
            self.state.staged = vec![staged];
        }
        sink.report_progress(100, "");
        Ok(())
    }

    /// Unpack `target/<IMAGE>` and `target/<IMAGE>.md5` for every update image.
    fn extract_images(&self) -> Result<Vec<Utf8PathBuf>, DevUpdateError> {
        let wanted: Vec<String> = self
            .platform
            .update_images()
            .iter()
            .flat_map(|image| [image.to_string(), format!("{image}.md5")])
            .collect();
        let mut extracted: Vec<Utf8PathBuf> = Vec::new();

        let result = self.unpack_members(&wanted, &mut extracted);
        if let Err(err) = result {
            extracted.iter().for_each(|path| remove_if_exists(path));
            return Err(err);
        }
        if let Some(missing) = wanted.iter().find(|name| {
            !extracted
                .iter()
                .any(|path| path.file_name() == Some(name.as_str()))
        }) {
            extracted.iter().for_each(|path| remove_if_exists(path));
            return Err(DevUpdateError::MissingMember {
                name: missing.clone(),
            });
        }
        Ok(extracted)
    }

    fn unpack_members(
        &self,
        wanted: &[String],
        extracted: &mut Vec<Utf8PathBuf>,
    ) -> Result<(), DevUpdateError> {
        let tar_path = &self.state.tar_path;
        let corrupt = |err: io::Error| DevUpdateError::Decompress {
            path: tar_path.clone().into(),
            message: err.to_string(),
        };
        let file = File::open(tar_path)
            .map_err(|err| DevUpdateError::Filesystem(format!("{tar_path}: {err}")))?;
        let mut archive = tar::Archive::new(BufReader::new(file));
        for entry in archive.entries().map_err(corrupt)? {
            let mut entry = entry.map_err(corrupt)?;
            let member = entry.path().map_err(corrupt)?.into_owned();
            let Some(name) = wanted
                .iter()
                .find(|name| member.ends_with(Path::new("target").join(name.as_str())))
            else {
                continue;
            };
            let destination = self.layout.staged_path(name);
            debug!(member = %member.display(), %destination, "extracting");
            if !extracted.contains(&destination) {
                extracted.push(destination.clone());
            }
            let size = entry.size();
            let mut output = File::create(&destination)
                .map_err(|err| DevUpdateError::write(&destination, err))?;
            let copied = copy_with_progress(&mut entry, &mut output, Some(size), &NullSink, None)
                .map_err(|err| match err {
                    CopyError::Read(err) => corrupt(err),
                    CopyError::Write(err) => DevUpdateError::write(&destination, err),
                })?;
            let (Transfer::Complete(copied) | Transfer::Cancelled(copied)) = copied;
            if copied != size {
                return Err(corrupt(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} ends after {copied} of {size} bytes", member.display()),
                )));
            }
        }
        Ok(())
    }

    fn verify(&mut self, sink: &dyn ProgressSink) -> Result<Verification, DevUpdateError> {
        for &image in self.platform.update_images() {
            self.enter(Stage::Verify, sink, image);
            let image_path = self.layout.staged_path(image);
            let checksum_path = self.layout.staged_path(&format!("{image}.md5"));
            let expected = read_checksum_file(checksum_path.as_std_path())?;
            let check = self.verifier.verify(&expected, image_path.as_std_path(), sink)?;
            self.record(Stage::Verify, check.hashed);
            match check.verification {
                Verification::Verified => {}
                Verification::Mismatch { actual } => {
                    warn!(image, %expected, %actual, "checksum mismatch, removing staged files");
                    self.layout.clear_staging()?;
                    self.state.staged.clear();
                    return Err(DevUpdateError::IntegrityMismatch {
                        image: image.to_string(),
                    });
                }
                Verification::Cancelled => {
                    info!(image, "verification skipped");
                    return Ok(Verification::Cancelled);
                }
            }
        }
        Ok(Verification::Verified)
    }
}

fn part_path(path: &Utf8Path) -> Utf8PathBuf {
    Utf8PathBuf::from(format!("{path}.part"))
}

/// Copy with progress. Read failures are filesystem errors, write failures
/// are write errors against `to`.
fn copy_file(from: &Utf8Path, to: &Utf8Path, sink: &dyn ProgressSink) -> Result<Transfer, DevUpdateError> {
    let mut input =
        File::open(from).map_err(|err| DevUpdateError::Filesystem(format!("{from}: {err}")))?;
    let total = input
        .metadata()
        .map_err(|err| DevUpdateError::Filesystem(format!("{from}: {err}")))?
        .len();
    let mut output = File::create(to).map_err(|err| DevUpdateError::write(to, err))?;
    copy_with_progress(&mut input, &mut output, Some(total), sink, None).map_err(|err| match err {
        CopyError::Read(err) => DevUpdateError::Filesystem(format!("{from}: {err}")),
        CopyError::Write(err) => DevUpdateError::write(to, err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stages_are_ordered() {
        assert!(Stage::ArchiveLookup < Stage::Download);
        assert!(Stage::Download < Stage::Decompress);
        assert!(Stage::ArchiveWrite < Stage::Staging);
        assert!(Stage::Staging < Stage::Verify);
    }

    #[test]
    fn part_files_sit_next_to_their_target() {
        assert_eq!(
            part_path(Utf8Path::new("/work/a.tar")),
            Utf8PathBuf::from("/work/a.tar.part")
        );
    }
}
