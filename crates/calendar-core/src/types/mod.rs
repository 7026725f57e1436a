//! Domain types shared by every calendar crate.

pub mod event;
pub mod notification;

pub use event::{Event, EventDto, Interval, MAX_LEAD_TIME, span_end};
pub use notification::Notification;
