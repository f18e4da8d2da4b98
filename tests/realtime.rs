//! Real-time mirroring of relational changes into the content store.

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use store_sync::testing::{content_record, relational_row, test_config, Harness};
use store_sync::{ChangeOutcome, ConflictResolution, SyncConfig, SyncDirection, SyncError};
use sync_core::{RecordChange, RecordId};

fn realtime_config(collections: &[&str]) -> SyncConfig {
    let mut config = test_config(collections);
    config.realtime_enabled = true;
    config
}

fn day_one() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test]
async fn test_delete_of_unknown_record_succeeds() {
    let h = Harness::new(realtime_config(&["services"]));
    let outcome = h
        .orchestrator
        .listener()
        .apply_change(
            "services",
            RecordChange::Delete {
                id: RecordId::from("never-seen"),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ChangeOutcome::AlreadyAbsent);
}

#[tokio::test]
async fn test_delete_removes_mirrored_record() {
    let h = Harness::new(realtime_config(&["services"]));
    h.content
        .insert("services", content_record("svc-1", "Cut", day_one()))
        .unwrap();

    let outcome = h
        .orchestrator
        .listener()
        .apply_change(
            "services",
            RecordChange::Delete {
                id: RecordId::from("svc-1"),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ChangeOutcome::Deleted);
    assert!(h.content.records("services").is_empty());
}

#[tokio::test]
async fn test_redelivered_insert_is_harmless() {
    let h = Harness::new(realtime_config(&["stylists"]));
    let listener = h.orchestrator.listener();
    let row = relational_row("sty-1", "Sam", day_one());

    let first = listener
        .apply_change("stylists", RecordChange::Insert { record: row.clone() })
        .await
        .unwrap();
    let second = listener
        .apply_change("stylists", RecordChange::Insert { record: row })
        .await
        .unwrap();

    assert_eq!(first, ChangeOutcome::Created);
    assert_eq!(second, ChangeOutcome::Updated);
    let records = h.content.records("stylists");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get("name"), Some(&json!("Sam")));
    assert!(records[0].contains("updatedAt"));
    assert!(!records[0].contains("updated_at"));
}

#[tokio::test]
async fn test_update_of_missing_record_creates_it() {
    let h = Harness::new(realtime_config(&["pages"]));
    let outcome = h
        .orchestrator
        .listener()
        .apply_change(
            "pages",
            RecordChange::Update {
                record: relational_row("page-9", "About", day_one()),
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome, ChangeOutcome::Created);
    assert!(h.content.get("pages", &RecordId::from("page-9")).is_some());
}

#[tokio::test]
async fn test_content_wins_keeps_existing_content_record() {
    let mut config = realtime_config(&["pages"]);
    config.conflict_resolution = ConflictResolution::ContentWins;
    let h = Harness::new(config);
    h.content
        .insert("pages", content_record("page-1", "content copy", day_one()))
        .unwrap();

    let outcome = h
        .orchestrator
        .listener()
        .apply_change(
            "pages",
            RecordChange::Update {
                record: relational_row("page-1", "relational copy", day_one() + Duration::days(1)),
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome, ChangeOutcome::Skipped);
    let page = h.content.get("pages", &RecordId::from("page-1")).unwrap();
    assert_eq!(page.get("name"), Some(&json!("content copy")));
}

#[tokio::test]
async fn test_change_for_disabled_collection_is_rejected() {
    let h = Harness::new(realtime_config(&["pages"]));
    let err = h
        .orchestrator
        .listener()
        .apply_change(
            "payroll",
            RecordChange::Delete {
                id: RecordId::from("1"),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownCollection(_)));
}

#[tokio::test]
async fn test_subscribed_changes_reach_content_store() {
    let h = Harness::new(realtime_config(&["services"]));
    let writes_before = h.watermarks.writes();
    assert_eq!(h.orchestrator.listener().setup().await, 1);

    h.relational
        .apply_external_change(
            "services",
            RecordChange::Insert {
                record: relational_row("svc-7", "Balayage", day_one()),
            },
        )
        .await
        .unwrap();
    let content = h.content.clone();
    assert!(wait_for(|| content.get("services", &RecordId::from("svc-7")).is_some()).await);

    h.relational
        .apply_external_change(
            "services",
            RecordChange::Delete {
                id: RecordId::from("svc-7"),
            },
        )
        .await
        .unwrap();
    assert!(wait_for(|| content.records("services").is_empty()).await);

    // the live path never touches watermarks
    assert_eq!(h.watermarks.writes(), writes_before);

    assert_eq!(h.orchestrator.listener().cleanup().await, 1);
    assert_eq!(h.orchestrator.listener().cleanup().await, 0);
}

#[tokio::test]
async fn test_failed_event_does_not_end_subscription() {
    let h = Harness::new(realtime_config(&["services"]));
    h.orchestrator.listener().setup().await;
    h.content.fail_collection("services");

    h.relational
        .apply_external_change(
            "services",
            RecordChange::Insert {
                record: relational_row("svc-1", "Lost", day_one()),
            },
        )
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(h.orchestrator.listener().subscription_count(), 1);

    h.content.heal("services");
    h.relational
        .apply_external_change(
            "services",
            RecordChange::Insert {
                record: relational_row("svc-2", "Kept", day_one()),
            },
        )
        .await
        .unwrap();
    let content = h.content.clone();
    assert!(wait_for(|| content.get("services", &RecordId::from("svc-2")).is_some()).await);
    assert!(content.get("services", &RecordId::from("svc-1")).is_none());

    h.orchestrator.cleanup().await;
}

#[tokio::test]
async fn test_no_subscriptions_when_direction_excludes_content() {
    let mut config = realtime_config(&["services", "pages"]);
    config.sync_direction = SyncDirection::ContentToRelational;
    let h = Harness::new(config);

    assert_eq!(h.orchestrator.listener().setup().await, 0);
    assert_eq!(h.relational.subscriber_count("services"), 0);
    assert!(!h.orchestrator.get_sync_status().realtime_enabled);
}

#[tokio::test]
async fn test_failed_subscription_skips_only_that_collection() {
    let h = Harness::new(realtime_config(&["services", "pages"]));
    h.relational.fail_collection("pages");

    assert_eq!(h.orchestrator.listener().setup().await, 1);
    assert_eq!(
        h.orchestrator.listener().subscribed_collections(),
        vec!["services"]
    );

    // a later setup picks up the collection once it is reachable
    h.relational.heal("pages");
    assert_eq!(h.orchestrator.listener().setup().await, 2);
    h.orchestrator.cleanup().await;
}
