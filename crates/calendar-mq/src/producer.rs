//! Notification producer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use calendar_core::config::BrokerConfig;
use calendar_core::error::{CalendarError, Result};
use calendar_core::traits::Publisher;
use tokio_util::sync::CancellationToken;

use crate::link::{Link, LinkState, Topology};
use crate::transport::{BrokerConnector, Confirmation};

pub struct Producer {
    link: Link,
    exchange: String,
    routing_key: String,
    reliable: bool,
    confirm_timeout: Duration,
    accepting: AtomicBool,
}

impl Producer {
    /// Connect with the configured retry policy and declare the exchange.
    pub async fn connect(
        connector: Arc<dyn BrokerConnector>,
        config: &BrokerConfig,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let link = Link::open(
            "producer",
            connector,
            config.uri.clone(),
            Topology::producer(config),
            config.retry_policy(),
            cancel,
        )
        .await?;

        Ok(Self {
            link,
            exchange: config.exchange.clone(),
            routing_key: config.routing_key.clone(),
            reliable: config.reliable,
            confirm_timeout: config.confirm_timeout(),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn link_state(&self) -> LinkState {
        self.link.state()
    }
}

#[async_trait]
impl Publisher for Producer {
    async fn publish(&self, payload: &[u8]) -> Result<()> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(CalendarError::Closed);
        }

        // a send that races a broker restart waits for the next session
        let mut seen = 0;
        let pending = loop {
            let ready = self.link.ready_after(seen).await?;
            match ready.session.publish(&self.exchange, &self.routing_key, payload).await {
                Ok(pending) => break pending,
                Err(CalendarError::ConnectionLost(reason)) => {
                    tracing::warn!(generation = ready.generation, %reason, "connection lost while publishing");
                    seen = ready.generation;
                }
                Err(e) => return Err(e),
            }
        };
        tracing::debug!(size = payload.len(), exchange = %self.exchange, "message published");

        if !self.reliable {
            return Ok(());
        }
        match tokio::time::timeout(self.confirm_timeout, pending).await {
            Ok(Ok(Confirmation::Ack | Confirmation::NotRequested)) => {
                tracing::debug!("message delivery confirmed");
                Ok(())
            }
            Ok(Ok(Confirmation::Nack)) => {
                tracing::error!("message delivery not confirmed by broker");
                Err(CalendarError::NotAcknowledged)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(CalendarError::ConfirmTimeout(self.confirm_timeout)),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::info!("shutting down producer");
        self.link.shutdown().await
    }
}
