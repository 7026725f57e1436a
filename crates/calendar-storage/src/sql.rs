//! PostgreSQL event store.
//!
//! Identity and overlap checks run inside one transaction that holds a
//! `SHARE ROW EXCLUSIVE` lock on `events`, so two writers in different
//! processes cannot both pass the check for intersecting intervals.

use std::time::Duration;

use async_trait::async_trait;
use calendar_core::error::{CalendarError, Result};
use calendar_core::retry::RetryPolicy;
use calendar_core::traits::{EventStorage, NotificationSource};
use calendar_core::types::{Event, Interval, Notification, span_end};
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const LOCK_EVENTS: &str = "LOCK TABLE events IN SHARE ROW EXCLUSIVE MODE";

const SELECT_EVENT: &str =
    "SELECT id, title, description, user_id, start_time, end_time, time_before_secs FROM events";

fn db_err(e: sqlx::Error) -> CalendarError {
    CalendarError::storage(e.to_string())
}

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    title: String,
    description: String,
    user_id: Uuid,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
    time_before_secs: i64,
}

impl TryFrom<EventRow> for Event {
    type Error = CalendarError;

    fn try_from(row: EventRow) -> Result<Self> {
        let lead = TimeDelta::try_seconds(row.time_before_secs).ok_or_else(|| {
            CalendarError::Inconsistent(format!("event {} has lead time out of range", row.id))
        })?;
        Ok(Event::new(row.id, row.user_id, row.title, row.start_time, row.end_time)
            .with_description(row.description)
            .with_lead_time(lead))
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    title: String,
    start_time: DateTime<Utc>,
    user_id: Uuid,
}

impl From<NotificationRow> for Notification {
    fn from(row: NotificationRow) -> Self {
        Self { id: row.id, title: row.title, start: row.start_time, user_id: row.user_id }
    }
}

pub struct SqlStorage {
    pool: PgPool,
}

impl SqlStorage {
    /// Open a pool against `dsn`, retrying per `policy`.
    pub async fn connect(dsn: &str, policy: RetryPolicy, cancel: &CancellationToken) -> Result<Self> {
        let pool = policy
            .run("connect to PostgreSQL", cancel, |_| async move {
                PgPoolOptions::new()
                    .max_connections(5)
                    .acquire_timeout(Duration::from_secs(5))
                    .connect(dsn)
                    .await
                    .map_err(db_err)
            })
            .await?;

        tracing::info!("connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| CalendarError::storage(format!("migration failed: {e}")))?;
        tracing::info!("database migrations applied");
        Ok(())
    }

    async fn locked(&self) -> Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query(LOCK_EVENTS).execute(&mut *tx).await.map_err(db_err)?;
        Ok(tx)
    }

    async fn exists(tx: &mut Transaction<'static, Postgres>, id: Uuid) -> Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM events WHERE id = $1)")
            .bind(id)
            .fetch_one(&mut **tx)
            .await
            .map_err(db_err)
    }

    /// Half-open overlap against every row except `skip`.
    async fn overlaps(
        tx: &mut Transaction<'static, Postgres>,
        event: &Event,
        skip: Option<Uuid>,
    ) -> Result<bool> {
        sqlx::query_scalar(
            "SELECT EXISTS (
                SELECT 1 FROM events
                WHERE start_time < $2 AND $1 < end_time
                  AND ($3::uuid IS NULL OR id <> $3)
            )",
        )
        .bind(event.start)
        .bind(event.end)
        .bind(skip)
        .fetch_one(&mut **tx)
        .await
        .map_err(db_err)
    }
}

/// Validated lead times are whole seconds, so nothing is truncated here.
fn lead_secs(event: &Event) -> i64 {
    event.lead_time.num_seconds()
}

#[async_trait]
impl EventStorage for SqlStorage {
    fn name(&self) -> &str { "sql" }

    async fn create_event(&self, event: Event) -> Result<()> {
        tracing::debug!(id = %event.id, "attempting to create event");
        event.validate()?;

        let mut tx = self.locked().await?;
        if Self::exists(&mut tx, event.id).await? {
            return Err(CalendarError::IdAlreadyExists(event.id));
        }
        if Self::overlaps(&mut tx, &event, None).await? {
            return Err(CalendarError::IntervalConflict);
        }

        sqlx::query(
            "INSERT INTO events (id, title, description, user_id, start_time, end_time, time_before_secs)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(event.id)
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.user_id)
        .bind(event.start)
        .bind(event.end)
        .bind(lead_secs(&event))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(id = %event.id, "event created");
        Ok(())
    }

    async fn update_event(&self, id: Uuid, mut event: Event) -> Result<()> {
        tracing::debug!(%id, "attempting to update event");
        if event.id.is_nil() {
            event.id = id;
        } else if event.id != id {
            return Err(CalendarError::validation("id", "event id does not match the record"));
        }
        event.validate()?;

        let mut tx = self.locked().await?;
        if !Self::exists(&mut tx, id).await? {
            return Err(CalendarError::IdNotFound(id));
        }
        if Self::overlaps(&mut tx, &event, Some(id)).await? {
            return Err(CalendarError::IntervalConflict);
        }

        sqlx::query(
            "UPDATE events
             SET title = $1, description = $2, user_id = $3, start_time = $4,
                 end_time = $5, time_before_secs = $6
             WHERE id = $7",
        )
        .bind(&event.title)
        .bind(&event.description)
        .bind(event.user_id)
        .bind(event.start)
        .bind(event.end)
        .bind(lead_secs(&event))
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        tracing::info!(%id, "event updated");
        Ok(())
    }

    async fn delete_event(&self, id: Uuid) -> Result<()> {
        tracing::debug!(%id, "attempting to delete event");
        let result = sqlx::query("DELETE FROM events WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(CalendarError::IdNotFound(id));
        }
        tracing::info!(%id, "event deleted");
        Ok(())
    }

    async fn query_by_window(&self, start: DateTime<Utc>, duration: TimeDelta) -> Result<Vec<Event>> {
        let window = Interval::spanning(start, duration)?;
        let rows: Vec<EventRow> = sqlx::query_as(&format!(
            "{SELECT_EVENT} WHERE start_time <= $2 AND end_time >= $1 ORDER BY start_time, end_time, id"
        ))
        .bind(window.start)
        .bind(window.end)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        let events = rows.into_iter().map(Event::try_from).collect::<Result<Vec<_>>>()?;
        tracing::debug!(%start, count = events.len(), "events retrieved");
        Ok(events)
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        tracing::info!("PostgreSQL pool closed");
        Ok(())
    }
}

#[async_trait]
impl NotificationSource for SqlStorage {
    async fn due_notifications(
        &self,
        now: DateTime<Utc>,
        lookahead: TimeDelta,
    ) -> Result<Vec<Notification>> {
        let until = span_end(now, lookahead, "lookahead")?;
        let rows: Vec<NotificationRow> = sqlx::query_as(
            "SELECT id, title, start_time, user_id FROM events
             WHERE start_time - time_before_secs * INTERVAL '1 second' >= $1
               AND start_time - time_before_secs * INTERVAL '1 second' < $2
             ORDER BY start_time, end_time, id",
        )
        .bind(now)
        .bind(until)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        tracing::debug!(%now, count = rows.len(), "due notifications collected");
        Ok(rows.into_iter().map(Notification::from).collect())
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM events WHERE end_time < $1")
            .bind(before)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        let count = result.rows_affected();
        if count > 0 {
            tracing::info!(count, %before, "expired events deleted");
        }
        Ok(count)
    }
}
