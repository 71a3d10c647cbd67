mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use common::*;
use gitpusher::client::IssueState;
use gitpusher::pacing::{PushSettings, RetryPolicy};
use gitpusher::upsert::PLACEHOLDER_TITLE;
use gitpusher::{build_map, link_all, push_all, upsert, PushError};
use mstorage::models::{RecordCategory, RecordState};
use mstorage::timestamps::load_category;
use mstorage::{config::StorageConfig, MStorage};
use tempfile::tempdir;
use tigrisfetcher::models::{IssueStatus, RelationKind};

async fn storage() -> (MStorage, tempfile::TempDir) {
    let dir = tempdir().unwrap();
    let storage = MStorage::new(StorageConfig::new(dir.path())).await.unwrap();
    (storage, dir)
}

#[tokio::test]
async fn upsert_twice_converges_without_duplicates() {
    let harness = Harness::new(&[]);
    let ctx = harness.context(quiet_settings());
    let mut rec = record(1, "first");
    rec.status = IssueStatus::Closed;
    rec.target_milestone = Some("1.0".into());
    rec.keywords = vec!["windows".into()];

    let first = upsert(&ctx, &rec, 1).await.unwrap();
    let second = upsert(&ctx, &rec, 1).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(harness.tracker.state.lock().unwrap().creates, 1);
    let issue = harness.tracker.issue(1).unwrap();
    assert_eq!(issue.state, IssueState::Closed);
    assert_eq!(issue.labels, vec!["bug", "windows"]);
    assert_eq!(issue.milestone, Some(1));
    assert!(issue
        .body
        .unwrap()
        .starts_with("This issue was originally created at: 2001-01-01 10:00:00.\r\n"));
}

#[tokio::test]
async fn transient_failures_are_retried_with_linear_backoff() {
    let harness = Harness::new(&[]);
    harness.tracker.state.lock().unwrap().failing_updates = 2;
    let ctx = harness.context(quiet_settings());
    let map = build_map(1, &BTreeSet::new());
    let (storage, _dir) = storage().await;
    let mut writer = storage.timestamp_writer().unwrap();

    let report = push_all(&ctx, &[record(1, "flaky")], &map, &mut writer)
        .await
        .unwrap();

    assert_eq!(report.pushed, vec![(1, 1)]);
    assert_eq!(
        harness.sleeper.sleeps(),
        vec![Duration::from_secs(10), Duration::from_secs(20)]
    );
    // The retried upsert reused the issue created by the first attempt.
    assert_eq!(harness.tracker.state.lock().unwrap().creates, 1);
}

#[tokio::test]
async fn retried_record_matches_a_clean_push() {
    let mut rec = with_attachment(record(1, "flaky"), "9", "aGk=");
    rec.status = IssueStatus::Resolved;
    rec.target_milestone = Some("2.0".into());
    rec.keywords = vec!["linux".into()];
    let map = build_map(1, &BTreeSet::new());

    let flaky = Harness::new(&[]);
    flaky.tracker.state.lock().unwrap().failing_updates = 2;
    let clean = Harness::new(&[]);
    for harness in [&flaky, &clean] {
        let (storage, _dir) = storage().await;
        let mut writer = storage.timestamp_writer().unwrap();
        let report = push_all(
            &harness.context(quiet_settings()),
            std::slice::from_ref(&rec),
            &map,
            &mut writer,
        )
        .await
        .unwrap();
        assert_eq!(report.pushed, vec![(1, 1)]);
    }

    let retried = flaky.tracker.issue(1).unwrap();
    let expected = clean.tracker.issue(1).unwrap();
    assert_eq!(retried.body, expected.body);
    assert_eq!(retried.labels, expected.labels);
    assert_eq!(retried.state, expected.state);
    assert_eq!(retried, expected);
}

#[tokio::test]
async fn exhausted_record_is_reported_and_run_continues() {
    let harness = Harness::new(&[]);
    harness.tracker.state.lock().unwrap().failing_updates = 3;
    let settings = PushSettings {
        retry: RetryPolicy::linear(3, Duration::from_secs(1)),
        ..quiet_settings()
    };
    let ctx = harness.context(settings);
    let map = build_map(2, &BTreeSet::new());
    let (storage, _dir) = storage().await;
    let mut writer = storage.timestamp_writer().unwrap();

    let report = push_all(&ctx, &[record(2, "b"), record(1, "a")], &map, &mut writer)
        .await
        .unwrap();

    assert_eq!(report.pushed, vec![(2, 2)]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.placeholders, vec![1]);
    match &report.failed[0] {
        (1, PushError::Exhausted { source_id, destination_id, operation, attempts, .. }) => {
            assert_eq!((*source_id, *destination_id, *attempts), (1, 1, 3));
            assert_eq!(operation, "update issue #1");
        }
        other => panic!("unexpected failure: {other:?}"),
    }
}

#[tokio::test]
async fn collisions_with_pull_requests_fill_placeholders() {
    let harness = Harness::new(&[3, 4]);
    let ctx = harness.context(quiet_settings());
    let reserved = harness.tracker.state.lock().unwrap().pulls.clone();
    let map = build_map(5, &reserved);
    let records: Vec<_> = (1..=5).map(|id| record(id, &format!("source {id}"))).collect();
    let (storage, _dir) = storage().await;
    let mut writer = storage.timestamp_writer().unwrap();

    let report = push_all(&ctx, &records, &map, &mut writer).await.unwrap();

    assert_eq!(report.pushed, vec![(1, 1), (2, 2), (3, 6), (4, 7), (5, 5)]);
    // #5 was first created as a placeholder while aiming for #6, then
    // overwritten by source 5.
    assert_eq!(harness.tracker.issue(5).unwrap().title, "source 5");
    assert_eq!(harness.tracker.issue(6).unwrap().title, "source 3");
    assert_eq!(harness.tracker.issue(7).unwrap().title, "source 4");
    assert!(report.placeholders.is_empty());
}

#[tokio::test]
async fn unfilled_placeholder_is_reported() {
    let harness = Harness::new(&[2]);
    let ctx = harness.context(quiet_settings());
    let map = build_map(3, &[2].into_iter().collect());
    // Source 3 is absent, so nothing claims the #3 created on the way to #4.
    let records = vec![record(1, "a"), record(2, "b")];
    let (storage, _dir) = storage().await;
    let mut writer = storage.timestamp_writer().unwrap();

    let report = push_all(&ctx, &records, &map, &mut writer).await.unwrap();

    assert_eq!(report.pushed, vec![(1, 1), (2, 4)]);
    assert_eq!(report.placeholders, vec![3]);
    assert_eq!(harness.tracker.issue(3).unwrap().title, PLACEHOLDER_TITLE);
}

#[tokio::test]
async fn race_on_slot_takes_over_the_occupant() {
    let harness = Harness::new(&[]);
    harness.tracker.state.lock().unwrap().steal_next_create = true;
    let ctx = harness.context(quiet_settings());

    let issue = upsert(&ctx, &record(1, "mine"), 1).await.unwrap();

    assert_eq!(issue.number, 1);
    assert_eq!(harness.tracker.issue(1).unwrap().title, "mine");
    // The stray issue created by our call stays behind at #2.
    assert_eq!(harness.tracker.issue(2).unwrap().title, PLACEHOLDER_TITLE);
}

#[tokio::test]
async fn pull_request_at_destination_aborts_the_run() {
    let harness = Harness::new(&[2]);
    let ctx = harness.context(quiet_settings());
    // A map built without knowing about the pull request.
    let map = build_map(3, &BTreeSet::new());
    let records: Vec<_> = (1..=3).map(|id| record(id, "x")).collect();
    let (storage, _dir) = storage().await;
    let mut writer = storage.timestamp_writer().unwrap();

    let err = push_all(&ctx, &records, &map, &mut writer).await.unwrap_err();
    assert!(matches!(err, PushError::Structural(_)));
    assert!(harness.tracker.issue(3).is_none());
}

#[tokio::test]
async fn low_quota_sleeps_until_reset_plus_margin() {
    let harness = Harness::new(&[]);
    harness
        .tracker
        .state
        .lock()
        .unwrap()
        .quotas
        .extend([10u64, 5000]);
    let ctx = harness.context(quiet_settings());

    upsert(&ctx, &record(1, "a"), 1).await.unwrap();

    // reset is 60s away, margin 5s
    assert_eq!(harness.sleeper.sleeps(), vec![Duration::from_secs(65)]);
}

#[tokio::test]
async fn mutating_calls_are_spaced() {
    let harness = Harness::new(&[]);
    let settings = PushSettings {
        min_interval: Duration::from_secs(1),
        ..quiet_settings()
    };
    let ctx = harness.context(settings);

    upsert(&ctx, &record(1, "a"), 1).await.unwrap();

    // create then update: one pause between them
    assert_eq!(harness.sleeper.sleeps(), vec![Duration::from_secs(1)]);
}

#[tokio::test]
async fn attachments_are_uploaded_once_after_retries() {
    let harness = Harness::new(&[]);
    *harness.source.transient_failures.lock().unwrap() = 3;
    let ctx = harness.context(quiet_settings());
    let rec = with_attachment(record(1, "with file"), "42", "aGVsbG8=");

    upsert(&ctx, &rec, 1).await.unwrap();
    upsert(&ctx, &rec, 1).await.unwrap();

    assert_eq!(*harness.content.puts.lock().unwrap(), 1);
    assert_eq!(
        harness.content.files.lock().unwrap().get("42/notes.txt"),
        Some(&b"hello".to_vec())
    );
    assert_eq!(harness.sleeper.sleeps(), vec![Duration::from_secs(2); 3]);
    let body = harness.tracker.issue(1).unwrap().body.unwrap();
    assert!(body.contains(
        "uploader attached [notes.txt](https://files.example/42/notes.txt) at 2001-01-02 00:00:00."
    ));
}

#[tokio::test]
async fn push_records_timestamps_and_catalog_state() {
    let harness = Harness::new(&[1]);
    let (storage, _dir) = storage().await;
    let ctx = harness
        .context(quiet_settings())
        .with_catalog(storage.catalog.clone())
        .with_resume(true);
    let map = build_map(2, &[1].into_iter().collect());
    let records = vec![
        with_attachment(record(1, "moved"), "7", "aGk="),
        record(2, "kept"),
    ];

    {
        let mut writer = storage.timestamp_writer().unwrap();
        let report = push_all(&ctx, &records, &map, &mut writer).await.unwrap();
        assert_eq!(report.pushed, vec![(1, 3), (2, 2)]);
    }

    let issues = load_category(&storage.config, RecordCategory::Issue).unwrap();
    let pair = issues.get("3").unwrap();
    assert_eq!(pair.created, "(2001, 1, 1, 10, 0, 0, 0, 0, 0)");
    assert_eq!(pair.touched, "(2001, 6, 1, 10, 0, 0, 0, 0, 0)");
    assert!(issues.get("2").is_some());
    // Comments and attachments get no numbers of their own on GitHub.
    let messages = load_category(&storage.config, RecordCategory::Message).unwrap();
    assert!(messages.is_empty());
    let files = load_category(&storage.config, RecordCategory::File).unwrap();
    assert!(files.is_empty());

    let progress = storage.catalog.get_record(1).unwrap().unwrap();
    assert_eq!((progress.destination_id, progress.state), (3, RecordState::Populated));
    assert!(storage.catalog.get_api_budget("github.core").unwrap().is_some());

    // A resumed run skips everything already populated.
    let mut writer = storage.timestamp_writer().unwrap();
    let report = push_all(&ctx, &records, &map, &mut writer).await.unwrap();
    assert_eq!(report.skipped, vec![1, 2]);
    assert!(report.pushed.is_empty());
}

#[tokio::test]
async fn linker_appends_notes_idempotently() {
    let harness = Harness::new(&[2]);
    let (storage, _dir) = storage().await;
    let ctx = harness
        .context(quiet_settings())
        .with_catalog(storage.catalog.clone());
    let map = build_map(3, &[2].into_iter().collect());
    let records = vec![
        with_edge(
            with_edge(record(1, "a"), RelationKind::Blocks, "3", "2001-03-01 00:00:00"),
            RelationKind::DependsOn,
            "2",
            "2001-02-01 00:00:00",
        ),
        record(2, "b"),
        record(3, "c"),
    ];
    let mut writer = storage.timestamp_writer().unwrap();
    push_all(&ctx, &records, &map, &mut writer).await.unwrap();

    let report = link_all(&ctx, &records, &map).await.unwrap();
    assert_eq!(report.linked, vec![1]);
    let once = harness.tracker.issue(1).unwrap().body.unwrap();
    assert!(once.ends_with(
        "\r\nlinker said this issue depends on #4 at 2001-02-01 00:00:00.\r\n\
         \r\nlinker said this issue blocks #3 at 2001-03-01 00:00:00.\r\n"
    ));

    link_all(&ctx, &records, &map).await.unwrap();
    let twice = harness.tracker.issue(1).unwrap().body.unwrap();
    assert_eq!(once, twice);

    let progress = storage.catalog.get_record(1).unwrap().unwrap();
    assert_eq!(progress.state, RecordState::Linked);
    // Linking touches only the body.
    assert_eq!(harness.tracker.issue(1).unwrap().labels, vec!["bug"]);
}

#[tokio::test]
async fn failed_push_is_not_linked_until_resumed() {
    let harness = Harness::new(&[]);
    harness.tracker.state.lock().unwrap().failing_updates = 2;
    let (storage, _dir) = storage().await;
    let settings = PushSettings {
        retry: RetryPolicy::linear(2, Duration::from_secs(1)),
        ..quiet_settings()
    };
    let ctx = harness
        .context(settings)
        .with_catalog(storage.catalog.clone())
        .with_resume(true);
    let map = build_map(2, &BTreeSet::new());
    let records = vec![
        with_edge(record(1, "a"), RelationKind::DependsOn, "2", "2001-02-01 00:00:00"),
        record(2, "b"),
    ];
    let mut writer = storage.timestamp_writer().unwrap();

    let report = push_all(&ctx, &records, &map, &mut writer).await.unwrap();
    assert_eq!(report.pushed, vec![(2, 2)]);
    assert_eq!(report.failed.len(), 1);

    let links = link_all(&ctx, &records, &map).await.unwrap();
    assert!(links.linked.is_empty());
    assert_eq!(links.unpopulated, vec![1]);
    // The linker left the half-created issue alone.
    assert_eq!(harness.tracker.issue(1).unwrap().title, PLACEHOLDER_TITLE);
    let progress = storage.catalog.get_record(1).unwrap().unwrap();
    assert_eq!(progress.state, RecordState::Created);

    let report = push_all(&ctx, &records, &map, &mut writer).await.unwrap();
    assert_eq!(report.pushed, vec![(1, 1)]);
    assert_eq!(report.skipped, vec![2]);
    let issue = harness.tracker.issue(1).unwrap();
    assert_eq!(issue.title, "a");
    assert_eq!(issue.labels, vec!["bug"]);

    let links = link_all(&ctx, &records, &map).await.unwrap();
    assert_eq!(links.linked, vec![1]);
    assert!(links.unpopulated.is_empty());
    assert!(harness
        .tracker
        .issue(1)
        .unwrap()
        .body
        .unwrap()
        .ends_with("\r\nlinker said this issue depends on #2 at 2001-02-01 00:00:00.\r\n"));
}

#[tokio::test]
async fn linker_refuses_a_pull_request_at_the_slot() {
    let harness = Harness::new(&[2]);
    let ctx = harness.context(quiet_settings());
    // A map built without knowing about the pull request.
    let map = build_map(2, &BTreeSet::new());
    let records = vec![with_edge(
        record(2, "b"),
        RelationKind::Blocks,
        "1",
        "2001-02-01 00:00:00",
    )];

    let err = link_all(&ctx, &records, &map).await.unwrap_err();
    assert!(matches!(err, PushError::Structural(_)));
    assert_eq!(harness.tracker.state.lock().unwrap().updates, 0);
}
