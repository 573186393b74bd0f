use std::fs;
use std::io::{self, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use tracing::{debug, warn};

use crate::domain::UPDATE_IMAGES;
use crate::error::DevUpdateError;

/// On-disk locations used by an acquisition.
///
/// * `work_dir` holds downloads and decompressed tars while they are built.
/// * `update_dir` is the staging directory the installer reads on boot.
/// * `archive_root` is the optional archive cache,
///   `<archive_root>/<source>/<tar_name>`.
#[derive(Debug, Clone)]
pub struct Layout {
    work_dir: Utf8PathBuf,
    update_dir: Utf8PathBuf,
    archive_root: Option<Utf8PathBuf>,
}

impl Layout {
    pub fn new() -> Result<Self, DevUpdateError> {
        let home = BaseDirs::new()
            .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().to_path_buf()).ok())
            .ok_or_else(|| DevUpdateError::Filesystem("unable to resolve home directory".to_string()))?;
        Ok(Self {
            work_dir: home.join(".cache").join("devupdate"),
            update_dir: home.join(".update"),
            archive_root: None,
        })
    }

    pub fn new_with_paths(work_dir: Utf8PathBuf, update_dir: Utf8PathBuf) -> Self {
        Self {
            work_dir,
            update_dir,
            archive_root: None,
        }
    }

    pub fn with_archive_root(mut self, archive_root: Option<Utf8PathBuf>) -> Self {
        self.archive_root = archive_root;
        self
    }

    pub fn work_dir(&self) -> &Utf8Path {
        &self.work_dir
    }

    pub fn update_dir(&self) -> &Utf8Path {
        &self.update_dir
    }

    pub fn archive_root(&self) -> Option<&Utf8Path> {
        self.archive_root.as_deref()
    }

    pub fn work_path(&self, file_name: &str) -> Utf8PathBuf {
        self.work_dir.join(file_name)
    }

    pub fn staged_path(&self, file_name: &str) -> Utf8PathBuf {
        self.update_dir.join(file_name)
    }

    pub fn archive_dir(&self, source: &str) -> Option<Utf8PathBuf> {
        self.archive_root.as_ref().map(|root| root.join(source))
    }

    pub fn archive_path(&self, source: &str, tar_name: &str) -> Option<Utf8PathBuf> {
        self.archive_dir(source).map(|dir| dir.join(tar_name))
    }

    pub fn ensure_work_dir(&self) -> Result<(), DevUpdateError> {
        fs::create_dir_all(&self.work_dir).map_err(|err| DevUpdateError::write(&self.work_dir, err))
    }

    pub fn ensure_update_dir(&self) -> Result<(), DevUpdateError> {
        fs::create_dir_all(&self.update_dir)
            .map_err(|err| DevUpdateError::write(&self.update_dir, err))
    }

    /// Create the per-source archive directory. The archive root itself must
    /// already exist, since it is usually removable or network storage.
    pub fn ensure_archive_dir(&self, source: &str) -> Result<Option<Utf8PathBuf>, DevUpdateError> {
        let Some(root) = &self.archive_root else {
            return Ok(None);
        };
        if !root.is_dir() {
            return Err(DevUpdateError::ArchiveUnavailable(root.clone().into()));
        }
        let dir = root.join(source);
        fs::create_dir_all(&dir).map_err(|err| DevUpdateError::write(&dir, err))?;
        Ok(Some(dir))
    }

    /// Update files waiting in the staging directory: `*.tar` archives and
    /// image files with their checksums.
    pub fn pending_updates(&self) -> Result<Vec<Utf8PathBuf>, DevUpdateError> {
        let entries = match fs::read_dir(&self.update_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(DevUpdateError::Filesystem(format!("{}: {err}", self.update_dir))),
        };
        let mut pending = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| DevUpdateError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.is_file() && is_update_file(path.file_name().unwrap_or_default()) {
                pending.push(path);
            }
        }
        pending.sort();
        Ok(pending)
    }

    pub fn has_pending_update(&self) -> Result<bool, DevUpdateError> {
        Ok(self
            .pending_updates()?
            .iter()
            .any(|path| path.extension() == Some("tar")))
    }

    /// Remove every update file from the staging directory.
    pub fn clear_staging(&self) -> Result<Vec<Utf8PathBuf>, DevUpdateError> {
        let pending = self.pending_updates()?;
        for path in &pending {
            debug!(%path, "removing staged file");
            fs::remove_file(path).map_err(|err| DevUpdateError::write(path, err))?;
        }
        Ok(pending)
    }

    /// Rename, falling back to copy and remove across file systems.
    pub fn move_file(from: &Utf8Path, to: &Utf8Path) -> Result<(), DevUpdateError> {
        if fs::rename(from, to).is_ok() {
            return Ok(());
        }
        fs::copy(from, to).map_err(|err| {
            remove_if_exists(to);
            DevUpdateError::write(to, err)
        })?;
        fs::remove_file(from).map_err(|err| DevUpdateError::write(from, err))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), DevUpdateError> {
        let parent = path
            .parent()
            .filter(|parent| !parent.as_str().is_empty())
            .unwrap_or(Utf8Path::new("."));
        fs::create_dir_all(parent).map_err(|err| DevUpdateError::write(parent, err))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".devupdate")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| DevUpdateError::write(path, err))?;
        temp.write_all(content)
            .map_err(|err| DevUpdateError::write(path, err))?;
        temp.persist(path.as_std_path())
            .map_err(|err| DevUpdateError::write(path, err.error))?;
        Ok(())
    }
}

fn is_update_file(name: &str) -> bool {
    if name.ends_with(".tar") {
        return true;
    }
    let image = name.strip_suffix(".md5").unwrap_or(name);
    UPDATE_IMAGES.contains(&image)
}

/// Best-effort removal of a partial output.
pub(crate) fn remove_if_exists(path: &Utf8Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(%path, "removed partial file"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(%path, error = %err, "unable to remove partial file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_paths_are_per_source() {
        let layout = Layout::new_with_paths("/tmp/work".into(), "/tmp/update".into())
            .with_archive_root(Some("/mnt/archive".into()));
        assert_eq!(
            layout.archive_path("Milhouse Builds", "LibreELEC-RPi2.arm-8.0.1.tar"),
            Some(Utf8PathBuf::from("/mnt/archive/Milhouse Builds/LibreELEC-RPi2.arm-8.0.1.tar"))
        );
        let bare = Layout::new_with_paths("/tmp/work".into(), "/tmp/update".into());
        assert_eq!(bare.archive_path("x", "y.tar"), None);
    }

    #[test]
    fn recognises_update_files() {
        assert!(is_update_file("LibreELEC-RPi2.arm-8.0.1.tar"));
        assert!(is_update_file("SYSTEM"));
        assert!(is_update_file("KERNEL.md5"));
        assert!(!is_update_file("notes.txt"));
    }
}
