//! services/api/src/queue.rs
//!
//! The `JobQueue` port over two broker clients, one for publishing and one for
//! consuming, so a slow consumer never holds up publishers.

use async_trait::async_trait;
use futures::StreamExt;
use interview_core::ports::{DeliveryStream, JobQueue, PortError, PortResult};
use std::sync::Arc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::broker::{BrokerClient, BrokerError, BrokerResult, BrokerState, Transport};
use crate::config::BrokerSettings;

/// Review jobs: "score this completed interview".
pub const REVIEW_QUEUE: &str = "review";

/// Read-only view of the queue's connection health.
pub trait QueueHealth: Send + Sync {
    fn state(&self) -> BrokerState;
}

pub struct BrokerJobQueue<T: Transport> {
    producer: BrokerClient<T>,
    consumer: Arc<BrokerClient<T>>,
}

impl<T: Transport + Clone> BrokerJobQueue<T> {
    pub fn connect(transport: T, settings: BrokerSettings) -> Self {
        Self {
            producer: BrokerClient::connect("producer", transport.clone(), settings.clone()),
            consumer: Arc::new(BrokerClient::connect("consumer", transport, settings)),
        }
    }
}

impl<T: Transport> BrokerJobQueue<T> {
    pub fn producer(&self) -> &BrokerClient<T> {
        &self.producer
    }

    pub fn consumer(&self) -> &BrokerClient<T> {
        &self.consumer
    }

    /// Closes both clients, reporting the first failure.
    pub async fn close(&self) -> BrokerResult<()> {
        let producer = self.producer.close().await;
        let consumer = self.consumer.close().await;
        producer.and(consumer)
    }
}

impl<T: Transport> QueueHealth for BrokerJobQueue<T> {
    fn state(&self) -> BrokerState {
        match self.producer.state() {
            BrokerState::Ready => self.consumer.state(),
            other => other,
        }
    }
}

#[async_trait]
impl<T: Transport> JobQueue for BrokerJobQueue<T> {
    async fn push(&self, data: &[u8], queue: &str) -> PortResult<()> {
        self.producer.publish(data, queue).await.map_err(|err| {
            error!(queue, error = %err, "failed to push job");
            PortError::from(err)
        })
    }

    async fn start_consuming(
        &self,
        cancel: CancellationToken,
        queue: &str,
    ) -> PortResult<DeliveryStream> {
        let consumer = self.consumer.clone();
        let settings = consumer.settings().clone();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PortError::Shutdown),
            ready = consumer.wait_until_ready(Some(settings.connection_timeout)) => ready?,
        }
        let first = consumer.consume(queue).await?;
        let queue = queue.to_string();

        let deliveries = async_stream::stream! {
            let mut deliveries = first;
            'consuming: loop {
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'consuming,
                        next = deliveries.next() => next,
                    };
                    match next {
                        Some(Ok(delivery)) => yield delivery,
                        Some(Err(err)) => {
                            warn!(queue = %queue, error = %err, "consumer interrupted");
                            break;
                        }
                        None => {
                            warn!(queue = %queue, "consumer stream ended");
                            break;
                        }
                    }
                }

                // Resubscribe once the client has reconnected.
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'consuming,
                        _ = sleep(settings.reinitialization_delay) => {}
                    }
                    let ready = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break 'consuming,
                        ready = consumer.wait_until_ready(None) => ready,
                    };
                    let resubscribed = match ready {
                        Ok(()) => consumer.consume(&queue).await,
                        Err(err) => Err(err),
                    };
                    match resubscribed {
                        Ok(stream) => {
                            info!(queue = %queue, "consumer resubscribed");
                            deliveries = stream;
                            continue 'consuming;
                        }
                        Err(err) if err.is_fatal() => {
                            stop_consuming(&queue, &err);
                            break 'consuming;
                        }
                        Err(err) => warn!(queue = %queue, error = %err, "failed to resubscribe, retrying"),
                    }
                }
            }
            info!(queue = %queue, "stopped consuming");
        };

        Ok(Box::pin(deliveries))
    }
}

fn stop_consuming(queue: &str, err: &BrokerError) {
    match err {
        BrokerError::Shutdown | BrokerError::AlreadyClosed => {
            info!(queue, "consumer client shut down")
        }
        _ => error!(queue, error = %err, "cannot resume consuming"),
    }
}
