mod common;

use chrono::Duration;
use common::{record, t0, Harness};
use serde_json::json;
use vocabmirror_core::{Clock, FailureKind, KnownFailure};

async fn record_failure(h: &Harness, primary_key: &str, kind: FailureKind) -> i64 {
    let failure = KnownFailure {
        table: "code_sets".into(),
        primary_key: primary_key.into(),
        kind,
        comment: String::new(),
    };
    assert!(h.coordinator.audit().record(&failure, h.clock.now()).await.unwrap());
    h.coordinator
        .audit()
        .open_failures(None)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.primary_key == primary_key && r.status_initially == kind)
        .unwrap()
        .id
}

#[tokio::test]
async fn fresh_export_is_reused_and_missing_keys_stay_open() {
    let h = Harness::new(t0()).await;
    h.client.set_export(
        "concept_set_members",
        vec![record(json!({"codeset_id": 7, "concept_id": 70}))],
    );
    let seven = record_failure(&h, "7", FailureKind::ExcessiveMembers).await;

    let report = h.coordinator.resolve(None).await.unwrap();
    assert_eq!(report.resolved, vec![seven]);
    assert_eq!(h.client.export_calls().len(), 1);

    // Code set 8 is not in the cached export yet.
    let eight = record_failure(&h, "8", FailureKind::ZeroMembers).await;
    h.clock.advance(Duration::hours(1));
    let report = h.coordinator.resolve(None).await.unwrap();
    assert!(report.resolved.is_empty());
    assert_eq!(report.still_open.len(), 1);
    assert_eq!(report.still_open[0].id, eight);
    assert_eq!(h.client.export_calls().len(), 1);

    h.client.set_export(
        "concept_set_members",
        vec![
            record(json!({"codeset_id": 7, "concept_id": 70})),
            record(json!({"codeset_id": 8, "concept_id": 80})),
        ],
    );
    h.clock.advance(Duration::hours(24));
    let report = h.coordinator.resolve(None).await.unwrap();
    assert_eq!(report.resolved, vec![eight]);
    assert_eq!(h.client.export_calls().len(), 2);
    assert_eq!(h.coordinator.audit().count_open().await.unwrap(), 0);

    // Resolving again is a no-op and keeps the original resolution time.
    let closed = h.coordinator.audit().get(seven).await.unwrap().unwrap();
    let again = h.coordinator.resolve(None).await.unwrap();
    assert!(again.resolved.is_empty());
    assert_eq!(h.coordinator.audit().get(seven).await.unwrap().unwrap(), closed);
}

#[tokio::test]
async fn unavailable_export_leaves_records_open_and_reports_errors() {
    let h = Harness::new(t0()).await;
    h.client.fail_export("concept_set_members", "export service down");
    let members = record_failure(&h, "3", FailureKind::ExcessiveMembers).await;
    // No base table is fed by the version item export in this mirror.
    let items = record_failure(&h, "3", FailureKind::ExcessiveItems).await;

    let report = h.coordinator.resolve(None).await.unwrap();
    assert!(report.resolved.is_empty());
    let mut open: Vec<i64> = report.still_open.iter().map(|r| r.id).collect();
    open.sort();
    assert_eq!(open, vec![members, items]);
    assert_eq!(report.errors.len(), 2);
    assert!(report.errors.iter().any(|e| e.contains("export service down")));
    assert!(report
        .errors
        .iter()
        .any(|e| e.contains("concept_set_version_item")));
    assert!(h.coordinator.resolver().cache().is_empty());

    let only_items = h
        .coordinator
        .resolve(Some(&[FailureKind::ExcessiveItems]))
        .await
        .unwrap();
    assert_eq!(only_items.still_open.len(), 1);
    assert_eq!(only_items.still_open[0].id, items);
    assert_eq!(h.client.export_calls().len(), 1);
}
