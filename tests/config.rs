use std::fs;
use std::time::Duration;

use assert_matches::assert_matches;
use tempfile::TempDir;

use elec_devupdate::config::{ConfigLoader, SourceKind};
use elec_devupdate::error::DevUpdateError;

#[test]
fn loads_settings_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("devupdate.json");
    fs::write(
        &path,
        r#"{
            "arch": "RPi2.arm",
            "timeout_secs": 30,
            "archive_root": "/media/usb/builds",
            "verify_files": false,
            "source_name": "Milhouse Builds",
            "custom_sources": [
                { "name": "Mine", "url": "http://example.test/builds", "kind": "milhouse", "subdir": "{board}" }
            ]
        }"#,
    )
    .unwrap();

    let settings = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(settings.arch.as_deref(), Some("RPi2.arm"));
    assert_eq!(settings.timeout, Some(Duration::from_secs(30)));
    assert_eq!(
        settings.archive_root.as_ref().map(|root| root.as_str()),
        Some("/media/usb/builds")
    );
    assert!(!settings.verify_files);
    assert!(!settings.debug_builds);
    assert_eq!(settings.source_name.as_deref(), Some("Milhouse Builds"));
    assert_eq!(settings.custom_sources.len(), 1);
    assert_eq!(settings.custom_sources[0].kind, SourceKind::Milhouse);
    assert_eq!(settings.custom_sources[0].subdir.as_deref(), Some("{board}"));
}

#[test]
fn missing_explicit_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("absent.json");
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(DevUpdateError::ConfigRead(_))
    );
}

#[test]
fn malformed_file_is_a_parse_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("devupdate.json");
    fs::write(&path, "{ \"verify_files\": \"yes\" }").unwrap();
    assert_matches!(
        ConfigLoader::resolve(path.to_str()),
        Err(DevUpdateError::ConfigParse(_))
    );
}
