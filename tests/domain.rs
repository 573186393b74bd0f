use chrono::NaiveDate;

use elec_devupdate::domain::{BuildIdentity, DISPLAY_DATE_FMT, ReleaseVersion};

#[test]
fn releases_below_floor_or_untagged_are_not_offered() {
    let tagged = NaiveDate::from_ymd_opt(2017, 2, 21)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let floor = ReleaseVersion::floor();

    let current = BuildIdentity::release("8.0.1".parse().unwrap(), Some(tagged));
    let ancient = BuildIdentity::release("3.2.4".parse().unwrap(), Some(tagged));
    let untagged = BuildIdentity::release("8.0.2".parse().unwrap(), None);

    assert!(current.is_offered(&floor));
    assert!(!ancient.is_offered(&floor));
    assert!(!untagged.is_offered(&floor));
    assert!(BuildIdentity::build("20170101000000", "abc1234").unwrap().is_offered(&floor));
}

#[test]
fn identities_display_with_short_date() {
    let build = BuildIdentity::build("20170221103005", "abc1234").unwrap();
    assert_eq!(build.date(DISPLAY_DATE_FMT).as_deref(), Some("21 Feb 17"));
    assert_eq!(build.to_string(), "abc1234 (21 Feb 17)");
    assert_eq!(
        BuildIdentity::release("8.0.2".parse().unwrap(), None).to_string(),
        "8.0.2"
    );
}

#[test]
fn builds_order_by_timestamp() {
    let mut builds = vec![
        BuildIdentity::build("20170201000000", "bbb").unwrap(),
        BuildIdentity::build("20170301000000", "aaa").unwrap(),
        BuildIdentity::build("20170101000000", "ccc").unwrap(),
    ];
    builds.sort_by(|a, b| b.try_cmp(a).unwrap());
    let versions: Vec<_> = builds.iter().map(BuildIdentity::version).collect();
    assert_eq!(versions, vec!["aaa", "bbb", "ccc"]);
}

#[test]
fn release_version_serializes_as_string() {
    let version: ReleaseVersion = "8.2.3".parse().unwrap();
    assert_eq!(serde_json::to_string(&version).unwrap(), "\"8.2.3\"");
    let parsed: ReleaseVersion = serde_json::from_str("\"8.2.3\"").unwrap();
    assert_eq!(parsed, version);
    assert!(serde_json::from_str::<ReleaseVersion>("\"eight\"").is_err());
}
