//! Broker transport seam.
//!
//! The link, producer and consumer only talk to a broker through these
//! traits. `amqp` implements them on lapin; `memory` implements them in
//! process so reconnects, nacks and slow confirms can be driven from tests.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use calendar_core::config::ExchangeType;
use calendar_core::error::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// Outcome of a publisher confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
    /// Confirms are not enabled on the session.
    NotRequested,
}

/// Resolves once the broker confirms (or rejects) a published message.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation>>;

/// Deliveries for one consumer tag. Ends when the session goes away or the
/// consumer is cancelled.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nack(&self, requeue: bool) -> Result<()>;
}

pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        redelivered: bool,
        acker: impl Acknowledger + 'static,
    ) -> Self {
        Self { delivery_tag, body, redelivered, acker: Box::new(acker) }
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("size", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// One connection plus one channel.
///
/// Operations on a session the broker has dropped fail with
/// `CalendarError::ConnectionLost`.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn enable_confirms(&self) -> Result<()>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()>;

    async fn declare_queue(&self, name: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;

    /// Hand a message to the broker. The returned future tracks its confirm.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8])
        -> Result<PendingConfirm>;

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()>;

    /// Resolves with the reason once the session is closed from either side.
    async fn closed(&self) -> String;

    /// Close the channel and then the connection. Failures of both steps
    /// come back together as `CalendarError::Shutdown`.
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerSession>>;
}
