//! Contract tests run through the storage traits.

use std::sync::Arc;

use calendar_core::config::{StorageBackend, StorageConfig};
use calendar_core::traits::{EventStorage, NotificationSource};
use calendar_core::{CalendarError, Event, RetryPolicy};
use calendar_storage::{Store, create_storage};
use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

fn at(h: u32, m: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2030, 3, 4, h, m, 0).unwrap()
}

fn event(start: DateTime<Utc>, end: DateTime<Utc>) -> Event {
    Event::new(Uuid::new_v4(), Uuid::new_v4(), "event", start, end)
}

async fn memory_store() -> Arc<dyn Store> {
    create_storage(&StorageConfig::default(), RetryPolicy::default(), &CancellationToken::new())
        .await
        .unwrap()
}

/// A = [10:00, 11:00), B = [11:00, 12:00) touch and coexist; C = [10:30, 11:30)
/// overlaps both and is rejected.
async fn touching_boundaries(store: &dyn Store) {
    let a = event(at(10, 0), at(11, 0));
    let b = event(at(11, 0), at(12, 0));
    let c = event(at(10, 30), at(11, 30));

    store.create_event(a.clone()).await.unwrap();
    store.create_event(b.clone()).await.unwrap();
    assert!(matches!(store.create_event(c.clone()).await, Err(CalendarError::IntervalConflict)));

    // window starting exactly at A's end still sees A
    let found = store.query_by_window(at(11, 0), TimeDelta::minutes(30)).await.unwrap();
    let ids: Vec<Uuid> = found.iter().map(|e| e.id).collect();
    assert_eq!(ids, vec![a.id, b.id]);

    store.delete_event(a.id).await.unwrap();
    assert!(matches!(store.delete_event(a.id).await, Err(CalendarError::IdNotFound(_))));
    // C still clashes with B
    assert!(matches!(store.create_event(c).await, Err(CalendarError::IntervalConflict)));
}

#[tokio::test]
async fn test_memory_touching_boundaries() {
    let store = memory_store().await;
    assert_eq!(store.name(), "memory");
    touching_boundaries(store.as_ref()).await;
}

#[tokio::test]
async fn test_day_week_month_windows() {
    let store = memory_store().await;
    let base = at(0, 0);
    let today = event(base + TimeDelta::hours(9), base + TimeDelta::hours(10));
    let in_week = event(base + TimeDelta::days(3), base + TimeDelta::days(3) + TimeDelta::hours(1));
    let in_month = event(base + TimeDelta::days(20), base + TimeDelta::days(20) + TimeDelta::hours(1));
    for e in [&today, &in_week, &in_month] {
        store.create_event(e.clone()).await.unwrap();
    }

    assert_eq!(store.events_for_day(base).await.unwrap().len(), 1);
    assert_eq!(store.events_for_week(base).await.unwrap().len(), 2);
    assert_eq!(store.events_for_month(base).await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_concurrent_creates_keep_exclusivity() {
    let store = memory_store().await;
    let mut handles = Vec::new();
    // 32 writers race for 8 overlapping slots: [i*30m, i*30m + 45m)
    for i in 0..32i64 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let slot = i % 8;
            let start = at(8, 0) + TimeDelta::minutes(slot * 30);
            store.create_event(event(start, start + TimeDelta::minutes(45))).await.is_ok()
        }));
    }
    let mut created = 0;
    for h in handles {
        if h.await.unwrap() {
            created += 1;
        }
    }

    let all = store.query_by_window(at(0, 0), TimeDelta::days(1)).await.unwrap();
    assert_eq!(all.len(), created);
    for pair in all.windows(2) {
        let (x, y) = (pair[0].interval(), pair[1].interval());
        assert!(!x.overlaps(&y), "{x:?} overlaps {y:?}");
    }
}

#[tokio::test]
async fn test_due_and_expiry_through_trait() {
    let store = memory_store().await;
    let now = at(9, 0);
    let soon = event(at(9, 20), at(9, 40)).with_lead_time(TimeDelta::minutes(10));
    let later = event(at(12, 0), at(13, 0));
    let ended = event(at(1, 0), at(2, 0));
    for e in [&soon, &later, &ended] {
        store.create_event(e.clone()).await.unwrap();
    }

    let due = store.due_notifications(now, TimeDelta::minutes(15)).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, soon.id);
    assert_eq!(due[0].start, soon.start);

    assert_eq!(store.delete_expired(at(3, 0)).await.unwrap(), 1);
    assert!(store.events_for_day(at(0, 0)).await.unwrap().iter().all(|e| e.id != ended.id));
}

#[tokio::test]
async fn test_sql_backend_requires_dsn() {
    let config = StorageConfig { backend: StorageBackend::Sql, dsn: String::new() };
    let result = create_storage(&config, RetryPolicy::default(), &CancellationToken::new()).await;
    assert!(matches!(result, Err(CalendarError::Config(_))));
}

/// Needs a disposable PostgreSQL database: `CALENDAR_TEST_DSN=postgres://… cargo test -- --ignored`.
#[tokio::test]
#[ignore]
async fn test_sql_touching_boundaries() {
    let Ok(dsn) = std::env::var("CALENDAR_TEST_DSN") else {
        return;
    };
    let config = StorageConfig { backend: StorageBackend::Sql, dsn };
    let store = create_storage(&config, RetryPolicy::default(), &CancellationToken::new())
        .await
        .unwrap();
    store.delete_expired(Utc.with_ymd_and_hms(3000, 1, 1, 0, 0, 0).unwrap()).await.unwrap();
    assert_eq!(store.name(), "sql");
    touching_boundaries(store.as_ref()).await;
    store.close().await.unwrap();
}
