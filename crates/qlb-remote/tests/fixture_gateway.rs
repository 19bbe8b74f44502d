use chrono::{TimeZone, Utc};
use qlb_remote::{
    load_fixture_bundle, Endpoint, FixtureBundle, FixtureGateway, RemoteApiGateway, RemoteIssue,
    RemoteProject, RemoteUser,
};

fn issue(key: &str, day: u32) -> RemoteIssue {
    RemoteIssue {
        key: key.to_string(),
        rule: Some("java:S2259".into()),
        severity: Some("MAJOR".into()),
        component: Some("core:src/Main.java".into()),
        project: Some("core".into()),
        line: Some(12),
        status: Some("OPEN".into()),
        message: Some("possible null dereference".into()),
        effort: Some("10min".into()),
        author: Some("john.doe".into()),
        issue_type: Some("BUG".into()),
        creation_date: Some(Utc.with_ymd_and_hms(2024, 3, day, 9, 0, 0).unwrap()),
        update_date: None,
        close_date: None,
    }
}

fn bundle() -> FixtureBundle {
    let mut bundle = FixtureBundle {
        projects: (0..7)
            .map(|i| RemoteProject {
                key: format!("p{i}"),
                name: format!("Project {i}"),
                qualifier: Some("TRK".into()),
            })
            .collect(),
        users: vec![RemoteUser {
            login: "John.Doe".into(),
            name: Some("Johnny Doe".into()),
            email: Some("john@example.com".into()),
        }],
        ..Default::default()
    };
    bundle
        .issues
        .insert("core".into(), (1..=9).map(|d| issue(&format!("I-{d}"), d)).collect());
    bundle
}

#[tokio::test]
async fn projects_page_with_has_more_hint() {
    let gateway = FixtureGateway::new(bundle());
    let first = gateway.list_projects(1, 3).await.unwrap();
    let third = gateway.list_projects(3, 3).await.unwrap();
    let fourth = gateway.list_projects(4, 3).await.unwrap();

    assert_eq!(first.items.len(), 3);
    assert!(first.has_more);
    assert_eq!(third.items.len(), 1);
    assert!(!third.has_more);
    assert!(fourth.items.is_empty());
    assert_eq!(gateway.request_count(Endpoint::Projects).await, 3);
}

#[tokio::test]
async fn issue_window_is_inclusive_after_and_exclusive_before() {
    let gateway = FixtureGateway::new(bundle());
    let after = Utc.with_ymd_and_hms(2024, 3, 3, 9, 0, 0).unwrap();
    let before = Utc.with_ymd_and_hms(2024, 3, 6, 9, 0, 0).unwrap();
    let page = gateway
        .list_issues("core", Some(after), Some(before), 1, 100)
        .await
        .unwrap();
    let keys: Vec<_> = page.items.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys, ["I-3", "I-4", "I-5"]);

    let unknown = gateway.list_issues("nope", None, None, 1, 100).await.unwrap();
    assert!(unknown.items.is_empty());
}

#[tokio::test]
async fn raw_records_are_decoded_one_at_a_time() {
    let mut bundle = bundle();
    bundle.raw_issues.insert(
        "core".into(),
        vec![
            serde_json::json!({ "key": "R-1", "type": "BUG" }),
            serde_json::json!({ "key": "R-2", "line": [1, 2] }),
        ],
    );
    let gateway = FixtureGateway::new(bundle);

    let last = gateway.list_issues("core", None, None, 3, 4).await.unwrap();
    let keys: Vec<_> = last.items.iter().map(|i| i.key.as_str()).collect();
    assert_eq!(keys, ["I-9", "R-1"]);
    assert_eq!(last.rejected.len(), 1);
    assert!(last.rejected[0].starts_with("issue R-2:"));
    assert_eq!(last.served(), 3);

    // Typed issues survive the same decode path with their dates intact.
    let first = gateway.list_issues("core", None, None, 1, 4).await.unwrap();
    assert_eq!(first.items[0], issue("I-1", 1));
    assert!(first.rejected.is_empty());
}

#[tokio::test]
async fn user_lookup_requires_exact_login() {
    let gateway = FixtureGateway::new(bundle());
    let exact = gateway.resolve_user("john.doe").await.unwrap();
    assert_eq!(exact.and_then(|u| u.name).as_deref(), Some("Johnny Doe"));
    assert!(gateway.resolve_user("john").await.unwrap().is_none());
}

#[tokio::test]
async fn injected_failures_hit_only_the_requested_page() {
    let gateway = FixtureGateway::new(bundle());
    gateway.fail_on(Endpoint::Issues, Some(2), "boom").await;

    assert!(gateway.list_issues("core", None, None, 1, 4).await.is_ok());
    let err = gateway.list_issues("core", None, None, 2, 4).await.unwrap_err();
    assert_eq!(err.to_string(), "boom");

    gateway.clear_failures().await;
    assert!(gateway.list_issues("core", None, None, 2, 4).await.is_ok());
}

#[test]
fn bundles_load_from_json_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("remote.json");
    std::fs::write(
        &path,
        r#"{
            "projects": [{"key": "core", "name": "Core"}],
            "issues": {"core": [{"key": "I-1", "type": "BUG", "creationDate": "2024-03-01T10:00:00+0000"}]},
            "measures": {"core": {"ncloc": "12345"}}
        }"#,
    )
    .unwrap();

    let bundle = load_fixture_bundle(&path).unwrap();
    assert_eq!(bundle.projects[0].key, "core");
    assert_eq!(bundle.issues["core"][0].issue_type.as_deref(), Some("BUG"));
    assert_eq!(bundle.measures["core"]["ncloc"], "12345");
    assert!(bundle.users.is_empty());
}
