//! In-memory event store.
//!
//! The identity map and the interval index sit behind one `RwLock`, so every
//! write sees and updates both together and no reader observes them apart.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use calendar_core::error::{CalendarError, Result};
use calendar_core::traits::{EventStorage, NotificationSource};
use calendar_core::types::{Event, Interval, Notification, span_end};
use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::interval::IntervalIndex;

#[derive(Default)]
struct Inner {
    events: HashMap<Uuid, Event>,
    intervals: IntervalIndex,
}

#[derive(Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner.read().map_err(|e| CalendarError::storage(e.to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner.write().map_err(|e| CalendarError::storage(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.read().map(|inner| inner.events.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Event>> {
        Ok(self.read()?.events.get(&id).cloned())
    }

    pub fn create(&self, event: Event) -> Result<()> {
        tracing::debug!(id = %event.id, "attempting to create event");
        event.validate()?;

        let mut inner = self.write()?;
        if inner.events.contains_key(&event.id) {
            return Err(CalendarError::IdAlreadyExists(event.id));
        }
        if !inner.intervals.add_if_free(event.interval()) {
            return Err(CalendarError::IntervalConflict);
        }
        let id = event.id;
        inner.events.insert(id, event);

        tracing::info!(%id, "event created");
        Ok(())
    }

    pub fn update(&self, id: Uuid, mut event: Event) -> Result<()> {
        tracing::debug!(%id, "attempting to update event");
        if event.id.is_nil() {
            event.id = id;
        } else if event.id != id {
            return Err(CalendarError::validation("id", "event id does not match the record"));
        }
        event.validate()?;

        let mut inner = self.write()?;
        let old = inner
            .events
            .get(&id)
            .map(Event::interval)
            .ok_or(CalendarError::IdNotFound(id))?;
        if !inner.intervals.replace(event.interval(), &old) {
            return Err(CalendarError::IntervalConflict);
        }
        inner.events.insert(id, event);

        tracing::info!(%id, "event updated");
        Ok(())
    }

    pub fn delete(&self, id: Uuid) -> Result<()> {
        tracing::debug!(%id, "attempting to delete event");

        let mut inner = self.write()?;
        let interval = inner
            .events
            .get(&id)
            .map(Event::interval)
            .ok_or(CalendarError::IdNotFound(id))?;
        if !inner.intervals.remove(&interval) {
            return Err(CalendarError::Inconsistent(format!("event {id} had no interval")));
        }
        inner.events.remove(&id);

        tracing::info!(%id, "event deleted");
        Ok(())
    }

    pub fn query_window(&self, start: DateTime<Utc>, duration: TimeDelta) -> Result<Vec<Event>> {
        let window = Interval::spanning(start, duration)?;
        let inner = self.read()?;

        let events = inner
            .intervals
            .query_overlapping(&window)
            .into_iter()
            .map(|iv| {
                inner.events.get(&iv.id).cloned().ok_or_else(|| {
                    CalendarError::Inconsistent(format!("interval without event: {}", iv.id))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(%start, count = events.len(), "events retrieved");
        Ok(events)
    }

    /// Due notifications in ascending event start order.
    pub fn due(&self, now: DateTime<Utc>, lookahead: TimeDelta) -> Result<Vec<Notification>> {
        let until = span_end(now, lookahead, "lookahead")?;
        let inner = self.read()?;

        let mut due = Vec::new();
        for iv in inner.intervals.iter() {
            let event = inner.events.get(&iv.id).ok_or_else(|| {
                CalendarError::Inconsistent(format!("interval without event: {}", iv.id))
            })?;
            let Some(notify_at) = event.notify_at() else {
                tracing::warn!(id = %event.id, "notification instant out of range, skipping");
                continue;
            };
            if notify_at >= now && notify_at < until {
                due.push(Notification::from(event));
            }
        }

        tracing::debug!(%now, count = due.len(), "due notifications collected");
        Ok(due)
    }

    pub fn delete_ended_before(&self, before: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.write()?;
        let expired: Vec<Interval> = inner
            .intervals
            .iter()
            .take_while(|iv| iv.end < before)
            .copied()
            .collect();

        for iv in &expired {
            inner.intervals.remove(iv);
            inner.events.remove(&iv.id);
        }

        let count = expired.len() as u64;
        if count > 0 {
            tracing::info!(count, %before, "expired events deleted");
        } else {
            tracing::debug!(%before, "no expired events");
        }
        Ok(count)
    }
}

#[async_trait]
impl EventStorage for MemoryStorage {
    fn name(&self) -> &str { "memory" }

    async fn create_event(&self, event: Event) -> Result<()> {
        self.create(event)
    }

    async fn update_event(&self, id: Uuid, event: Event) -> Result<()> {
        self.update(id, event)
    }

    async fn delete_event(&self, id: Uuid) -> Result<()> {
        self.delete(id)
    }

    async fn query_by_window(&self, start: DateTime<Utc>, duration: TimeDelta) -> Result<Vec<Event>> {
        self.query_window(start, duration)
    }
}

#[async_trait]
impl NotificationSource for MemoryStorage {
    async fn due_notifications(
        &self,
        now: DateTime<Utc>,
        lookahead: TimeDelta,
    ) -> Result<Vec<Notification>> {
        self.due(now, lookahead)
    }

    async fn delete_expired(&self, before: DateTime<Utc>) -> Result<u64> {
        self.delete_ended_before(before)
    }
}
