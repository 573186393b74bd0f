use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;
use reqwest::Url;
use tempfile::TempDir;

use elec_devupdate::app::{App, FetchStatus};
use elec_devupdate::catalog::{SourceCatalog, SourceEntry};
use elec_devupdate::config::Settings;
use elec_devupdate::domain::{BuildInfo, Platform, ReleaseVersion};
use elec_devupdate::error::DevUpdateError;
use elec_devupdate::extract::{PatternLinkExtractor, SummaryExtractor};
use elec_devupdate::http::{RemoteFile, Transport};
use elec_devupdate::notify::NotifyRecord;
use elec_devupdate::progress::NullSink;
use elec_devupdate::store::Layout;
use elec_devupdate::system::OsRelease;
use elec_devupdate::tags::ReleaseTags;

const SOURCE: &str = "Milhouse Builds";
const LISTING_URL: &str = "http://mock.test/builds/master/RPi2/";
const NEWER: &str = "LibreELEC-RPi2.arm-8.0-Milhouse-20170301000000-%230301-gaaa111.tar";
const OLDER: &str = "LibreELEC-RPi2.arm-8.0-Milhouse-20170201000000-%230201-gbbb222.tar";

struct MockTransport {
    pages: HashMap<String, String>,
    files: HashMap<String, Vec<u8>>,
}

impl Transport for MockTransport {
    fn get_text(&self, url: &Url) -> Result<String, DevUpdateError> {
        self.pages
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| DevUpdateError::ListingUnavailable {
                url: url.to_string(),
                status: 404,
            })
    }

    fn open(&self, url: &Url) -> Result<RemoteFile, DevUpdateError> {
        let data = self
            .files
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| DevUpdateError::Connection {
                url: url.to_string(),
                message: "not found".to_string(),
            })?;
        Ok(RemoteFile {
            url: url.clone(),
            size: Some(data.len() as u64),
            body: Box::new(Cursor::new(data)),
        })
    }

    fn exists(&self, url: &Url) -> bool {
        self.files.contains_key(url.as_str())
    }
}

#[derive(Debug)]
struct FixedSummaries;

impl SummaryExtractor for FixedSummaries {
    fn summaries(
        &self,
        _transport: &dyn Transport,
    ) -> Result<HashMap<String, BuildInfo>, DevUpdateError> {
        Ok(HashMap::from([(
            "0301".to_string(),
            BuildInfo::new("Kodi bump"),
        )]))
    }
}

struct Fixture {
    _dir: TempDir,
    notify_path: Utf8PathBuf,
    app: App,
}

fn app_fixture(os_release: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let platform = Platform::new("LibreELEC", "RPi2.arm");

    let listing = format!(r#"<a href="{OLDER}">older</a> <a href="{NEWER}">newer</a>"#);
    let transport = MockTransport {
        pages: HashMap::from([(LISTING_URL.to_string(), listing)]),
        files: HashMap::from([(format!("{LISTING_URL}{NEWER}"), b"tar bytes".to_vec())]),
    };
    let tags = Arc::new(ReleaseTags::preloaded(HashMap::new(), ReleaseVersion::floor()));
    let mut catalog = SourceCatalog::new(platform.clone(), Arc::new(transport), tags);
    catalog.add(
        SourceEntry::new(
            SOURCE,
            "http://mock.test/builds",
            Some("master/{board}"),
            &platform,
            Arc::new(PatternLinkExtractor::milhouse()),
        )
        .unwrap()
        .with_enrichers(vec![Arc::new(FixedSummaries) as Arc<dyn SummaryExtractor>]),
    );

    let layout = Layout::new_with_paths(root.join("work"), root.join("update"));
    let settings = Settings {
        verify_files: false,
        ..Settings::default()
    };
    let notify_path = root.join(".installed_build");
    let app = App::new(
        catalog,
        layout,
        OsRelease::parse(os_release),
        notify_path.clone(),
        &settings,
    );
    Fixture {
        _dir: dir,
        notify_path,
        app,
    }
}

const RUNNING_OLDER: &str =
    "NAME=LibreELEC\nVERSION=devel-20170201000000-#0201\nMILHOUSE_BUILD=1\n";
const RUNNING_NEWER: &str =
    "NAME=LibreELEC\nVERSION=devel-20170301000000-#0301\nMILHOUSE_BUILD=1\n";

#[test]
fn list_marks_installed_and_attaches_summaries() {
    let fixture = app_fixture(RUNNING_OLDER);
    let source = fixture.app.source_name(None).unwrap();
    assert_eq!(source, SOURCE);

    let result = fixture.app.list(&source, Duration::from_secs(5)).unwrap();
    let versions: Vec<_> = result.builds.iter().map(|entry| entry.version.as_str()).collect();
    assert_eq!(versions, vec!["0301", "0201"]);
    assert_eq!(result.builds[0].summary.as_deref(), Some("Kodi bump"));
    assert!(result.builds[1].installed);
    assert!(!result.builds[0].installed);
}

#[test]
fn check_finds_newer_build() {
    let fixture = app_fixture(RUNNING_OLDER);
    let result = fixture.app.check(SOURCE).unwrap();
    assert!(result.newer_available);
    assert!(!result.pending_update);

    let fixture = app_fixture(RUNNING_NEWER);
    assert!(!fixture.app.check(SOURCE).unwrap().newer_available);
}

#[test]
fn fetch_stages_build_and_records_it() {
    let fixture = app_fixture(RUNNING_OLDER);
    let stale = fixture.app.layout().staged_path("stale.tar");
    fs::create_dir_all(fixture.app.layout().update_dir()).unwrap();
    fs::write(&stale, b"old").unwrap();

    let link = fixture.app.builds(SOURCE).unwrap().remove(0);
    let result = fixture.app.fetch(SOURCE, link, &NullSink).unwrap();

    assert_eq!(result.status, FetchStatus::Staged);
    assert!(!stale.exists());
    let staged = fixture
        .app
        .layout()
        .staged_path("LibreELEC-RPi2.arm-8.0-Milhouse-20170301000000-#0301-gaaa111.tar");
    assert_eq!(fs::read(staged).unwrap(), b"tar bytes");

    let record = NotifyRecord::read(&fixture.notify_path).unwrap().unwrap();
    assert_eq!(record.source, SOURCE);
    assert!(fixture.app.check(SOURCE).unwrap().pending_update);
}

#[test]
fn confirm_compares_with_running_build() {
    let fixture = app_fixture(RUNNING_OLDER);
    let link = fixture.app.builds(SOURCE).unwrap().remove(0);
    fixture.app.fetch(SOURCE, link, &NullSink).unwrap();

    let confirmed = fixture.app.confirm().unwrap().unwrap();
    assert!(!confirmed.succeeded);
    assert!(!fixture.notify_path.exists());
    assert!(fixture.app.confirm().unwrap().is_none());
}

#[test]
fn unknown_source_is_reported() {
    let fixture = app_fixture(RUNNING_OLDER);
    assert!(matches!(
        fixture.app.source_name(Some("Nightlies")),
        Err(DevUpdateError::UnknownSource(_))
    ));
}
