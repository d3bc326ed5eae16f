//! services/api/src/broker/amqp.rs
//!
//! AMQP 0-9-1 transport backed by `lapin`: durable queues, publisher confirms
//! and manual acknowledgement.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use interview_core::ports::{Acknowledger, Delivery, PortError, PortResult};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::{Confirmation as AmqpConfirmation, PublisherConfirm},
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

use super::error::{BrokerError, BrokerResult};
use super::transport::{
    CloseNotification, Confirmation, PendingConfirm, RawDeliveries, Transport, TransportChannel,
    TransportConnection,
};

const REPLY_SUCCESS: u16 = 200;
const PERSISTENT: u8 = 2;

#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpTransport;

pub struct AmqpConnection {
    inner: Connection,
}

#[derive(Clone)]
pub struct AmqpChannel {
    inner: Channel,
}

/// Registers a one-shot listener on a lapin error callback.
fn close_listener() -> (CloseNotification, impl FnMut(lapin::Error) + Send + 'static) {
    let (tx, rx) = oneshot::channel();
    let slot = Arc::new(Mutex::new(Some(tx)));
    let handler = move |err: lapin::Error| {
        let sender = match slot.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(sender) = sender {
            let _ = sender.send(BrokerError::from(err));
        }
    };
    (rx, handler)
}

#[async_trait]
impl Transport for AmqpTransport {
    type Connection = AmqpConnection;

    async fn dial(&self, addr: &str) -> BrokerResult<AmqpConnection> {
        let inner = Connection::connect(addr, ConnectionProperties::default()).await?;
        Ok(AmqpConnection { inner })
    }
}

#[async_trait]
impl TransportConnection for AmqpConnection {
    type Channel = AmqpChannel;

    async fn open_channel(&self) -> BrokerResult<AmqpChannel> {
        let inner = self.inner.create_channel().await?;
        Ok(AmqpChannel { inner })
    }

    fn notify_close(&self) -> CloseNotification {
        let (rx, handler) = close_listener();
        self.inner.on_error(handler);
        rx
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

#[async_trait]
impl TransportChannel for AmqpChannel {
    async fn confirm_select(&self) -> BrokerResult<()> {
        self.inner.confirm_select(ConfirmSelectOptions::default()).await?;
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        let options = QueueDeclareOptions { durable: true, ..QueueDeclareOptions::default() };
        self.inner.queue_declare(queue, options, FieldTable::default()).await?;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        self.inner.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> BrokerResult<PendingConfirm> {
        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(PERSISTENT);
        let confirm = self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions { mandatory: true, ..BasicPublishOptions::default() },
                body,
                properties,
            )
            .await?;

        Ok(Box::pin(await_confirm(confirm)))
    }

    async fn consume(&self, queue: &str) -> BrokerResult<RawDeliveries> {
        let consumer = self
            .inner
            .basic_consume(queue, "", BasicConsumeOptions::default(), FieldTable::default())
            .await?;

        Ok(consumer
            .map(|delivery| -> BrokerResult<Delivery> {
                let delivery = delivery?;
                Ok(Delivery::new(
                    Bytes::from(delivery.data),
                    Box::new(AmqpAcknowledger { acker: delivery.acker }),
                ))
            })
            .boxed())
    }

    fn notify_close(&self) -> CloseNotification {
        let (rx, handler) = close_listener();
        self.inner.on_error(handler);
        rx
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.close(REPLY_SUCCESS, "closing").await?;
        Ok(())
    }
}

async fn await_confirm(confirm: PublisherConfirm) -> BrokerResult<Confirmation> {
    match confirm.await? {
        AmqpConfirmation::Ack(None) => Ok(Confirmation::Ack),
        // A returned message was acked by the broker but never routed.
        AmqpConfirmation::Ack(Some(returned)) => {
            debug!(reply_code = returned.reply_code, "published message was returned");
            Ok(Confirmation::Nack)
        }
        AmqpConfirmation::Nack(_) | AmqpConfirmation::NotRequested => Ok(Confirmation::Nack),
    }
}

struct AmqpAcknowledger {
    acker: Acker,
}

fn ack_error(err: lapin::Error) -> PortError {
    PortError::Unavailable(format!("failed to settle delivery: {}", err))
}

#[async_trait]
impl Acknowledger for AmqpAcknowledger {
    async fn ack(&self) -> PortResult<()> {
        self.acker.ack(BasicAckOptions::default()).await.map_err(ack_error)
    }

    async fn nack(&self, requeue: bool) -> PortResult<()> {
        self.acker
            .nack(BasicNackOptions { requeue, multiple: false })
            .await
            .map_err(ack_error)
    }

    async fn reject(&self, requeue: bool) -> PortResult<()> {
        self.acker.reject(BasicRejectOptions { requeue }).await.map_err(ack_error)
    }
}
