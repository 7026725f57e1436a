//! Notification consumer.
//!
//! Deliveries are acknowledged only after they decode and the handler
//! accepts them. Anything left unacknowledged is redelivered by the broker
//! once this consumer's session goes away.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use calendar_core::config::BrokerConfig;
use calendar_core::error::{CalendarError, Result};
use calendar_core::types::Notification;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::link::{Link, LinkState, Topology};
use crate::transport::BrokerConnector;

/// Receives every decoded notification before it is acknowledged.
#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: Notification) -> Result<()>;
}

/// Logs each notification; what the `sender` role does with them.
pub struct LogHandler;

#[async_trait]
impl NotificationHandler for LogHandler {
    async fn handle(&self, notification: Notification) -> Result<()> {
        tracing::info!(
            id = %notification.id,
            user_id = %notification.user_id,
            start = %notification.start,
            title = %notification.title,
            "notification event"
        );
        Ok(())
    }
}

pub struct Consumer {
    link: Link,
    queue: String,
    tag: String,
    stopped: AtomicBool,
}

impl Consumer {
    /// Connect and declare the exchange, the queue and their binding.
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        config: &BrokerConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        if config.queue.is_empty() {
            return Err(CalendarError::config("rabbitmq.queue must not be empty for a consumer"));
        }
        let link = Link::open(
            "consumer",
            connector,
            config.uri.clone(),
            Topology::consumer(config),
            config.retry_policy(),
            cancel,
        )
        .await?;

        Ok(Self {
            link,
            queue: config.queue.clone(),
            tag: config.consumer_tag.clone(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }

    /// Consume until `cancel` fires or the link closes.
    ///
    /// A broker disconnect does not end the loop: it waits for the link to
    /// reconnect and consumes again from the re-declared queue. Returns
    /// `Decode` on a malformed payload, a handler error as is, and
    /// `ConnectionExhausted` once the link gives up.
    pub async fn handle(&self, handler: &dyn NotificationHandler, cancel: &CancellationToken) -> Result<()> {
        let mut generation = 0;
        loop {
            let ready = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("consumer cancelled");
                    return Ok(());
                }
                ready = self.link.ready_after(generation) => match ready {
                    Ok(ready) => ready,
                    Err(CalendarError::Closed) => {
                        tracing::info!("consumer link closed");
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                },
            };
            generation = ready.generation;

            tracing::debug!(consumer_tag = %self.tag, queue = %self.queue, "starting to consume");
            let mut deliveries = match ready.session.consume(&self.queue, &self.tag).await {
                Ok(deliveries) => deliveries,
                Err(CalendarError::ConnectionLost(reason)) => {
                    tracing::warn!(%reason, "connection lost before consuming, waiting for reconnect");
                    continue;
                }
                Err(e) => return Err(e),
            };
            tracing::info!(queue = %self.queue, generation, "messages are being consumed");

            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::info!("consumer cancelled");
                        return Ok(());
                    }
                    next = deliveries.next() => next,
                };
                let delivery = match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "delivery stream failed, waiting for reconnect");
                        break;
                    }
                    None => {
                        tracing::info!("deliveries channel closed, waiting for reconnect");
                        break;
                    }
                };

                tracing::debug!(
                    delivery_tag = delivery.delivery_tag,
                    size = delivery.body.len(),
                    redelivered = delivery.redelivered,
                    "received delivery"
                );
                let notification = Notification::from_payload(&delivery.body)?;
                handler.handle(notification).await?;

                match delivery.ack().await {
                    Ok(()) => tracing::debug!(delivery_tag = delivery.delivery_tag, "delivery acknowledged"),
                    Err(CalendarError::ConnectionLost(reason)) => {
                        tracing::warn!(delivery_tag = delivery.delivery_tag, %reason, "ack lost with the connection");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Cancel the consumer tag and close the link. Safe to call twice.
    pub async fn shutdown(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!(consumer_tag = %self.tag, "shutting down consumer");

        let mut errors = Vec::new();
        if let LinkState::Ready(ready) = self.link.state() {
            match ready.session.cancel_consumer(&self.tag).await {
                Ok(()) | Err(CalendarError::ConnectionLost(_)) => {}
                Err(e) => errors.push(format!("consumer cancel failed: {e}")),
            }
        }
        match self.link.shutdown().await {
            Ok(()) => {}
            Err(CalendarError::Shutdown(list)) => errors.extend(list),
            Err(e) => errors.push(e.to_string()),
        }

        if errors.is_empty() { Ok(()) } else { Err(CalendarError::Shutdown(errors)) }
    }
}
