use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DevUpdateError;

const CONFIG_FILE: &str = "devupdate.json";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub arch: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub archive_root: Option<String>,
    #[serde(default)]
    pub verify_files: Option<bool>,
    #[serde(default)]
    pub update_dir: Option<String>,
    #[serde(default)]
    pub work_dir: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub debug_builds: Option<bool>,
    #[serde(default)]
    pub custom_sources: Vec<CustomSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Snapshot,
    Release,
    Milhouse,
}

/// A build source added by the user.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CustomSource {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: SourceKind,
    #[serde(default)]
    pub subdir: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub arch: Option<String>,
    pub timeout: Option<Duration>,
    pub archive_root: Option<Utf8PathBuf>,
    pub verify_files: bool,
    pub update_dir: Option<Utf8PathBuf>,
    pub work_dir: Option<Utf8PathBuf>,
    pub source_name: Option<String>,
    pub debug_builds: bool,
    pub custom_sources: Vec<CustomSource>,
}

impl Default for Settings {
    fn default() -> Self {
        ConfigLoader::resolve_config(Config::default())
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Read settings from `path`, or from the default location. A missing
    /// default file means default settings; a missing explicit file is an
    /// error.
    pub fn resolve(path: Option<&str>) -> Result<Settings, DevUpdateError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => match Self::default_path() {
                Some(path) => path,
                None => return Ok(Settings::default()),
            },
        };

        if path.is_none() && !config_path.exists() {
            debug!(path = %config_path.display(), "no settings file, using defaults");
            return Ok(Settings::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| DevUpdateError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| DevUpdateError::ConfigParse(err.to_string()))?;

        Ok(Self::resolve_config(config))
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("tv", "devupdate", "devupdate")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    pub fn resolve_config(config: Config) -> Settings {
        Settings {
            arch: config.arch.filter(|arch| !arch.trim().is_empty()),
            timeout: config
                .timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            archive_root: non_empty_path(config.archive_root),
            verify_files: config.verify_files.unwrap_or(true),
            update_dir: non_empty_path(config.update_dir),
            work_dir: non_empty_path(config.work_dir),
            source_name: config.source_name,
            debug_builds: config.debug_builds.unwrap_or(false),
            custom_sources: config.custom_sources,
        }
    }
}

fn non_empty_path(value: Option<String>) -> Option<Utf8PathBuf> {
    value
        .filter(|value| !value.trim().is_empty())
        .map(Utf8PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_verify_and_skip_archive() {
        let settings = ConfigLoader::resolve_config(Config::default());
        assert!(settings.verify_files);
        assert!(settings.archive_root.is_none());
        assert!(settings.timeout.is_none());
        assert!(settings.custom_sources.is_empty());
    }

    #[test]
    fn blank_paths_are_unset() {
        let config = Config {
            archive_root: Some("  ".to_string()),
            timeout_secs: Some(0),
            ..Config::default()
        };
        let settings = ConfigLoader::resolve_config(config);
        assert!(settings.archive_root.is_none());
        assert!(settings.timeout.is_none());
    }
}
