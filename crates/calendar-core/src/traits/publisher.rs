//! Publisher trait: where the scheduler hands serialized notifications.

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Send one message body. Not retried on failure.
    async fn publish(&self, payload: &[u8]) -> Result<()>;

    /// Stop accepting work and release the connection.
    async fn shutdown(&self) -> Result<()>;
}
