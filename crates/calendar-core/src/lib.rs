//! # Calendar Core
//!
//! Shared vocabulary for the calendar services: the event model, the
//! notification wire type, the error taxonomy, configuration, and the traits
//! that connect storage, scheduling and the broker.
//!
//! ```text
//! API layer ──► EventStorage ◄── NotificationSource ◄── Scheduler ──► Publisher ──► broker
//! ```

pub mod config;
pub mod error;
pub mod retry;
pub mod traits;
pub mod types;

pub use config::CalendarConfig;
pub use error::{CalendarError, ErrorKind, Result};
pub use retry::RetryPolicy;
pub use traits::{EventStorage, NotificationSource, Publisher};
pub use types::{Event, EventDto, Interval, Notification};
