//! Notification payloads exchanged between the scheduler and the sender.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Event;
use crate::error::{CalendarError, Result};

/// Notice about an upcoming event. Derived on demand, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub start: DateTime<Utc>,
    pub user_id: Uuid,
}

impl Notification {
    /// Serialize to the JSON body published on the broker.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a broker message body.
    pub fn from_payload(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| CalendarError::Decode(e.to_string()))
    }
}

impl From<&Event> for Notification {
    fn from(e: &Event) -> Self {
        Self {
            id: e.id,
            title: e.title.clone(),
            start: e.start,
            user_id: e.user_id,
        }
    }
}
