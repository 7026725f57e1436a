//! # Calendar Storage
//! Conflict-free event stores: an in-memory backend built on an ordered
//! interval set, and a PostgreSQL backend with the same contract.

pub mod interval;
pub mod memory;
pub mod sql;

use std::sync::Arc;

use calendar_core::config::{StorageBackend, StorageConfig};
use calendar_core::error::{CalendarError, Result};
use calendar_core::retry::RetryPolicy;
use calendar_core::traits::{EventStorage, NotificationSource};
use tokio_util::sync::CancellationToken;

pub use interval::IntervalIndex;
pub use memory::MemoryStorage;
pub use sql::SqlStorage;

/// A backend usable by both the API layer and the scheduler.
pub trait Store: EventStorage + NotificationSource {}

impl<T: EventStorage + NotificationSource> Store for T {}

/// Create a storage backend from configuration.
pub async fn create_storage(
    config: &StorageConfig,
    policy: RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Arc<dyn Store>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
        StorageBackend::Sql => {
            if config.dsn.is_empty() {
                return Err(CalendarError::config("storage.dsn is required for the sql backend"));
            }
            let storage = SqlStorage::connect(&config.dsn, policy, cancel).await?;
            storage.migrate().await?;
            Ok(Arc::new(storage))
        }
    }
}
