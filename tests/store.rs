use std::fs;

use camino::Utf8PathBuf;
use tempfile::TempDir;

use elec_devupdate::error::DevUpdateError;
use elec_devupdate::store::Layout;

fn layout(dir: &TempDir) -> Layout {
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    Layout::new_with_paths(root.join("work"), root.join("update"))
}

#[test]
fn clear_staging_only_removes_update_files() {
    let dir = TempDir::new().unwrap();
    let layout = layout(&dir);
    layout.ensure_update_dir().unwrap();
    for name in ["SYSTEM", "SYSTEM.md5", "KERNEL", "old.tar", "README"] {
        fs::write(layout.staged_path(name), name).unwrap();
    }

    assert!(layout.has_pending_update().unwrap());
    let removed = layout.clear_staging().unwrap();
    assert_eq!(removed.len(), 4);
    assert!(layout.staged_path("README").exists());
    assert!(!layout.has_pending_update().unwrap());
}

#[test]
fn missing_staging_dir_has_nothing_pending() {
    let dir = TempDir::new().unwrap();
    let layout = layout(&dir);
    assert!(layout.pending_updates().unwrap().is_empty());
}

#[test]
fn archive_root_must_exist() {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let layout = layout(&dir).with_archive_root(Some(root.join("unmounted")));
    assert!(matches!(
        layout.ensure_archive_dir("Milhouse Builds"),
        Err(DevUpdateError::ArchiveUnavailable(_))
    ));

    let layout = layout.with_archive_root(Some(root.clone()));
    let created = layout.ensure_archive_dir("Milhouse Builds").unwrap().unwrap();
    assert!(created.is_dir());
    assert_eq!(created, root.join("Milhouse Builds"));
}

#[test]
fn atomic_write_creates_parents() {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let path = root.join("nested").join(".installed_build");
    Layout::write_bytes_atomic(&path, b"Milhouse Builds\nrelease 8.0.1\n").unwrap();
    assert_eq!(fs::read_to_string(&path).unwrap(), "Milhouse Builds\nrelease 8.0.1\n");
}
