//! Storage traits: event CRUD for the API layer and the scheduler's view.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::types::{Event, Notification};

/// Event persistence consumed by the API layer.
#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Backend name, used in logs.
    fn name(&self) -> &str;

    async fn create_event(&self, event: Event) -> Result<()>;

    /// Replace the whole record stored under `id`.
    async fn update_event(&self, id: Uuid, event: Event) -> Result<()>;

    async fn delete_event(&self, id: Uuid) -> Result<()>;

    /// Events overlapping `[start, start + duration]`, touching bounds included.
    /// The end saturates at the last representable instant; a negative
    /// `duration` is a `Validation` error.
    async fn query_by_window(&self, start: DateTime<Utc>, duration: TimeDelta)
        -> Result<Vec<Event>>;

    async fn events_for_day(&self, start: DateTime<Utc>) -> Result<Vec<Event>> {
        self.query_by_window(start, TimeDelta::days(1)).await
    }

    async fn events_for_week(&self, start: DateTime<Utc>) -> Result<Vec<Event>> {
        self.query_by_window(start, TimeDelta::days(7)).await
    }

    async fn events_for_month(&self, start: DateTime<Utc>) -> Result<Vec<Event>> {
        self.query_by_window(start, TimeDelta::days(30)).await
    }

    /// Release backend resources.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// What the notification scheduler needs from a store.
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// Notifications whose `start - lead_time` lies in `[now, now + lookahead)`.
    async fn due_notifications(
        &self,
        now: DateTime<Utc>,
        lookahead: TimeDelta,
    ) -> Result<Vec<Notification>>;

    /// Remove every event whose end is strictly before `before`.
    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64>;
}
