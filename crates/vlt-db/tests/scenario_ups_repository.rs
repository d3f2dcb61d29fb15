//! UPS repository scenarios against a live Postgres.
//!
//! These run only when `VOLTEEC_TEST_DATABASE_URL` is set; otherwise each
//! test logs a skip and passes. Every test owns a distinct ups_id so the
//! suite can run against a shared database.

use vlt_db::ups::OFFLINE_FAILURE_THRESHOLD;
use vlt_schemas::{UpsSnapshot, UpsStatus};

async fn pool_or_skip() -> Option<sqlx::PgPool> {
    match vlt_db::testkit_pool().await.expect("test pool setup failed") {
        Some(pool) => Some(pool),
        None => {
            eprintln!("skipping: VOLTEEC_TEST_DATABASE_URL not set");
            None
        }
    }
}

async fn reset(pool: &sqlx::PgPool, ups_id: &str) {
    sqlx::query("delete from ups where ups_id = $1")
        .bind(ups_id)
        .execute(pool)
        .await
        .expect("cleanup failed");
}

fn online_snapshot(ups_id: &str) -> UpsSnapshot {
    UpsSnapshot {
        ups_id: ups_id.to_string(),
        status: UpsStatus::Online,
        ups_status_raw: Some("OL CHRG".to_string()),
        battery_percent: Some(87),
        runtime_minutes: Some(2),
        runtime_seconds: Some(125),
        load_percent: Some(13),
        input_voltage: Some(230.1),
        ups_model: Some("Back-UPS 700".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn first_upsert_inserts_with_no_previous_status() {
    let Some(pool) = pool_or_skip().await else {
        return;
    };
    let id = "t-upsert-insert";
    reset(&pool, id).await;

    let (row, previous) = vlt_db::upsert_snapshot(&pool, &online_snapshot(id))
        .await
        .unwrap();
    assert_eq!(previous, None);
    assert_eq!(row.snapshot.status, UpsStatus::Online);
    assert_eq!(row.snapshot.battery_percent, Some(87));
    assert_eq!(row.consecutive_failures, 0);
    assert_eq!(row.data_source.as_str(), "nut");
}

#[tokio::test]
async fn upsert_overwrites_and_reports_previous_status() {
    let Some(pool) = pool_or_skip().await else {
        return;
    };
    let id = "t-upsert-overwrite";
    reset(&pool, id).await;

    vlt_db::upsert_snapshot(&pool, &online_snapshot(id))
        .await
        .unwrap();

    let mut on_battery = online_snapshot(id);
    on_battery.status = UpsStatus::OnBattery;
    on_battery.ups_status_raw = Some("OB LB".to_string());
    on_battery.battery_percent = Some(42);

    let (row, previous) = vlt_db::upsert_snapshot(&pool, &on_battery).await.unwrap();
    assert_eq!(previous, Some(UpsStatus::Online));
    assert_eq!(row.snapshot.status, UpsStatus::OnBattery);
    assert_eq!(row.snapshot.battery_percent, Some(42));
    assert!(row.updated_at.is_some());
}

#[tokio::test]
async fn upsert_resets_failure_counter() {
    let Some(pool) = pool_or_skip().await else {
        return;
    };
    let id = "t-upsert-reset";
    reset(&pool, id).await;

    vlt_db::upsert_snapshot(&pool, &online_snapshot(id))
        .await
        .unwrap();
    vlt_db::register_failure(&pool, id).await.unwrap().unwrap();

    let (row, _) = vlt_db::upsert_snapshot(&pool, &online_snapshot(id))
        .await
        .unwrap();
    assert_eq!(row.consecutive_failures, 0);
}

#[tokio::test]
async fn failure_for_unknown_ups_is_none() {
    let Some(pool) = pool_or_skip().await else {
        return;
    };
    let outcome = vlt_db::register_failure(&pool, "t-never-polled")
        .await
        .unwrap();
    assert!(outcome.is_none());
}

#[tokio::test]
async fn third_failure_promotes_to_offline_and_nulls_metrics() {
    let Some(pool) = pool_or_skip().await else {
        return;
    };
    let id = "t-failure-promotion";
    reset(&pool, id).await;

    vlt_db::upsert_snapshot(&pool, &online_snapshot(id))
        .await
        .unwrap();

    for n in 1..OFFLINE_FAILURE_THRESHOLD {
        let outcome = vlt_db::register_failure(&pool, id).await.unwrap().unwrap();
        assert_eq!(outcome.row.consecutive_failures, n);
        assert!(!outcome.status_changed, "failure {n} must not promote");
        assert_eq!(outcome.row.snapshot.status, UpsStatus::Online);
    }

    let outcome = vlt_db::register_failure(&pool, id).await.unwrap().unwrap();
    assert!(outcome.status_changed);
    assert_eq!(outcome.previous_status, UpsStatus::Online);
    assert_eq!(outcome.row.snapshot.status, UpsStatus::UpsOffline);
    assert_eq!(outcome.row.consecutive_failures, OFFLINE_FAILURE_THRESHOLD);

    let snap = &outcome.row.snapshot;
    assert!(snap.ups_status_raw.is_none());
    assert!(snap.battery_percent.is_none());
    assert!(snap.runtime_minutes.is_none());
    assert!(snap.runtime_seconds.is_none());
    assert!(snap.load_percent.is_none());
    assert!(snap.input_voltage.is_none());
    assert!(snap.ups_model.is_none());
}

#[tokio::test]
async fn failures_past_threshold_do_not_re_promote() {
    let Some(pool) = pool_or_skip().await else {
        return;
    };
    let id = "t-failure-sticky";
    reset(&pool, id).await;

    vlt_db::upsert_snapshot(&pool, &online_snapshot(id))
        .await
        .unwrap();
    for _ in 0..OFFLINE_FAILURE_THRESHOLD {
        vlt_db::register_failure(&pool, id).await.unwrap().unwrap();
    }

    let outcome = vlt_db::register_failure(&pool, id).await.unwrap().unwrap();
    assert!(!outcome.status_changed, "already offline: no new transition");
    assert_eq!(outcome.previous_status, UpsStatus::UpsOffline);
    assert_eq!(
        outcome.row.consecutive_failures,
        OFFLINE_FAILURE_THRESHOLD + 1
    );
}

#[tokio::test]
async fn lowercase_check_constraint_rejects_mixed_case_ids() {
    let Some(pool) = pool_or_skip().await else {
        return;
    };
    let err = sqlx::query("insert into ups (ups_id, status) values ('UPS1', 'online')")
        .execute(&pool)
        .await;
    assert!(err.is_err(), "check constraint must reject uppercase ids");
}

#[tokio::test]
async fn fetch_by_id_roundtrip() {
    let Some(pool) = pool_or_skip().await else {
        return;
    };
    let id = "t-fetch-by-id";
    reset(&pool, id).await;

    vlt_db::upsert_snapshot(&pool, &online_snapshot(id))
        .await
        .unwrap();

    let row = vlt_db::fetch_by_id(&pool, id).await.unwrap().unwrap();
    assert_eq!(row.snapshot.ups_id, id);
    assert_eq!(row.snapshot.ups_model.as_deref(), Some("Back-UPS 700"));

    assert!(vlt_db::fetch_by_id(&pool, "t-absent").await.unwrap().is_none());
}
