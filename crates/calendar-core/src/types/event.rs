//! Calendar events and the intervals they occupy.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CalendarError, Result};

/// Longest accepted lead time. Keeps `start - lead_time` inside the range
/// every backend can store.
pub const MAX_LEAD_TIME: TimeDelta = TimeDelta::days(36_600);

/// A calendar event.
///
/// Records are replaced whole on update; the id is supplied by the caller and
/// never regenerated by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "EventDto", into = "EventDto")]
pub struct Event {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub user_id: Uuid,
    /// How long before `start` the notification fires.
    pub lead_time: TimeDelta,
}

impl Event {
    pub fn new(
        id: Uuid,
        user_id: Uuid,
        title: impl Into<String>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            title: title.into(),
            description: String::new(),
            start,
            end,
            user_id,
            lead_time: TimeDelta::zero(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_lead_time(mut self, lead_time: TimeDelta) -> Self {
        self.lead_time = lead_time;
        self
    }

    /// Check the caller-correctable field rules.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_nil() {
            return Err(CalendarError::validation("id", "event id is required"));
        }
        if self.user_id.is_nil() {
            return Err(CalendarError::validation("userId", "user id is required"));
        }
        if self.end < self.start {
            return Err(CalendarError::validation("end", "end must not be before start"));
        }
        if self.lead_time < TimeDelta::zero() {
            return Err(CalendarError::validation("timeBefore", "lead time must not be negative"));
        }
        if self.lead_time.subsec_nanos() != 0 {
            return Err(CalendarError::validation("timeBefore", "lead time must be whole seconds"));
        }
        if self.lead_time > MAX_LEAD_TIME || self.notify_at().is_none() {
            return Err(CalendarError::validation("timeBefore", "lead time reaches too far before start"));
        }
        Ok(())
    }

    pub fn interval(&self) -> Interval {
        Interval { start: self.start, end: self.end, id: self.id }
    }

    /// Instant at which the notification for this event is due, or `None`
    /// if it falls before the start of representable time.
    pub fn notify_at(&self) -> Option<DateTime<Utc>> {
        self.start.checked_sub_signed(self.lead_time)
    }
}

/// Wire shape of an [`Event`]; `timeBefore` is whole seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDto {
    pub id: Uuid,
    pub title: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default)]
    pub description: String,
    pub user_id: Uuid,
    #[serde(default)]
    pub time_before: i64,
}

impl From<Event> for EventDto {
    fn from(e: Event) -> Self {
        Self {
            id: e.id,
            title: e.title,
            start: e.start,
            end: e.end,
            description: e.description,
            user_id: e.user_id,
            time_before: e.lead_time.num_seconds(),
        }
    }
}

impl TryFrom<EventDto> for Event {
    type Error = String;

    fn try_from(dto: EventDto) -> std::result::Result<Self, Self::Error> {
        let lead_time = TimeDelta::try_seconds(dto.time_before)
            .ok_or_else(|| format!("timeBefore out of range: {}", dto.time_before))?;
        Ok(Self {
            id: dto.id,
            title: dto.title,
            description: dto.description,
            start: dto.start,
            end: dto.end,
            user_id: dto.user_id,
            lead_time,
        })
    }
}

/// `start + span`, saturating at the last representable instant. A negative
/// span is rejected as a validation error on `field`.
pub fn span_end(start: DateTime<Utc>, span: TimeDelta, field: &'static str) -> Result<DateTime<Utc>> {
    if span < TimeDelta::zero() {
        return Err(CalendarError::validation(field, "duration must not be negative"));
    }
    Ok(start.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC))
}

/// The `[start, end)` range an event occupies.
///
/// Ordering is by start, then end, then id, so an ordered set of
/// non-overlapping intervals is also ordered by end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub id: Uuid,
}

impl Interval {
    pub fn new(id: Uuid, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end, id }
    }

    /// A query window not tied to any event.
    pub fn window(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end, id: Uuid::nil() }
    }

    /// The window `[start, start + duration]`, see [`span_end`].
    pub fn spanning(start: DateTime<Utc>, duration: TimeDelta) -> Result<Self> {
        Ok(Self::window(start, span_end(start, duration, "duration")?))
    }

    /// Half-open overlap: touching ranges do not overlap.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Inclusive overlap used for window queries: touching ranges match.
    pub fn touches(&self, window: &Interval) -> bool {
        self.start <= window.end && window.start <= self.end
    }

    pub fn same_bounds(&self, other: &Interval) -> bool {
        self.start == other.start && self.end == other.end
    }
}
