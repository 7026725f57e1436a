//! RabbitMQ transport on lapin.

use std::sync::Arc;

use async_trait::async_trait;
use calendar_core::config::ExchangeType;
use calendar_core::error::{CalendarError, Result};
use futures::StreamExt;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
    BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation as LapinConfirmation;
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::watch;

use crate::transport::{
    Acknowledger, BrokerConnector, BrokerSession, Confirmation, Delivery, DeliveryStream,
    PendingConfirm,
};

const REPLY_SUCCESS: u16 = 200;

fn amqp_err(e: lapin::Error) -> CalendarError {
    match e {
        lapin::Error::InvalidChannelState(_)
        | lapin::Error::InvalidConnectionState(_)
        | lapin::Error::IOError(_) => CalendarError::ConnectionLost(e.to_string()),
        other => CalendarError::broker(other.to_string()),
    }
}

fn exchange_kind(kind: ExchangeType) -> ExchangeKind {
    match kind {
        ExchangeType::Direct => ExchangeKind::Direct,
        ExchangeType::Fanout => ExchangeKind::Fanout,
        ExchangeType::Topic => ExchangeKind::Topic,
        ExchangeType::Headers => ExchangeKind::Headers,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl BrokerConnector for AmqpConnector {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerSession>> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(amqp_err)?;
        let channel = connection.create_channel().await.map_err(amqp_err)?;

        let (closed_tx, closed_rx) = watch::channel(None);
        let closed_tx = Arc::new(closed_tx);
        let tx = closed_tx.clone();
        connection.on_error(move |err| {
            tx.send_replace(Some(format!("connection error: {err}")));
        });
        let tx = closed_tx.clone();
        channel.on_error(move |err| {
            tx.send_replace(Some(format!("channel error: {err}")));
        });

        tracing::info!(channel = channel.id(), "AMQP connection established");
        Ok(Arc::new(AmqpSession { connection, channel, closed_tx, closed_rx }))
    }
}

pub struct AmqpSession {
    connection: Connection,
    channel: Channel,
    closed_tx: Arc<watch::Sender<Option<String>>>,
    closed_rx: watch::Receiver<Option<String>>,
}

#[async_trait]
impl BrokerSession for AmqpSession {
    async fn enable_confirms(&self) -> Result<()> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(amqp_err)?;
        tracing::info!("publisher confirms enabled");
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeType) -> Result<()> {
        let options = ExchangeDeclareOptions { durable: true, ..Default::default() };
        self.channel
            .exchange_declare(name, exchange_kind(kind), options, FieldTable::default())
            .await
            .map_err(amqp_err)
    }

    async fn declare_queue(&self, name: &str) -> Result<()> {
        let options = QueueDeclareOptions { durable: true, ..Default::default() };
        self.channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(amqp_err)?;
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        self.channel
            .queue_bind(queue, exchange, binding_key, QueueBindOptions::default(), FieldTable::default())
            .await
            .map_err(amqp_err)
    }

    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<PendingConfirm> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2);
        let confirm = self
            .channel
            .basic_publish(exchange, routing_key, BasicPublishOptions::default(), payload, properties)
            .await
            .map_err(amqp_err)?;

        Ok(Box::pin(async move {
            Ok(match confirm.await.map_err(amqp_err)? {
                LapinConfirmation::Ack(_) => Confirmation::Ack,
                LapinConfirmation::Nack(_) => Confirmation::Nack,
                LapinConfirmation::NotRequested => Confirmation::NotRequested,
            })
        }))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(amqp_err)?;

        let stream = consumer.map(|item| {
            item.map(|d| Delivery::new(d.delivery_tag, d.data, d.redelivered, AmqpAcker(d.acker)))
                .map_err(amqp_err)
        });
        Ok(stream.boxed())
    }

    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<()> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(amqp_err)
    }

    async fn closed(&self) -> String {
        let mut closed = self.closed_rx.clone();
        match closed.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone().unwrap_or_default(),
            Err(_) => "connection dropped".to_string(),
        }
    }

    async fn close(&self) -> Result<()> {
        let mut errors = Vec::new();
        if let Err(e) = self.channel.close(REPLY_SUCCESS, "Bye").await {
            errors.push(format!("channel close failed: {e}"));
        }
        if let Err(e) = self.connection.close(REPLY_SUCCESS, "Bye").await {
            errors.push(format!("AMQP connection close failed: {e}"));
        }
        self.closed_tx.send_replace(Some("closed by client".to_string()));

        if errors.is_empty() { Ok(()) } else { Err(CalendarError::Shutdown(errors)) }
    }
}

struct AmqpAcker(Acker);

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.0.ack(BasicAckOptions::default()).await.map_err(amqp_err)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let options = BasicNackOptions { requeue, ..Default::default() };
        self.0.nack(options).await.map_err(amqp_err)
    }
}
