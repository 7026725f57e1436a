//! Seams between the store, the scheduler, and the broker.

pub mod publisher;
pub mod storage;

pub use publisher::Publisher;
pub use storage::{EventStorage, NotificationSource};
