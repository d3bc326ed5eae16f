//! services/api/src/broker/transport.rs
//!
//! The seam between `BrokerClient` and the wire. The client only ever talks to
//! these traits, so the reconnect and confirm logic is shared by the AMQP
//! transport and the in-memory broker used in tests.

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use interview_core::ports::Delivery;
use tokio::sync::oneshot;

use super::error::{BrokerError, BrokerResult};

/// The broker's answer to a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

/// A publish that has been written to the channel but not yet confirmed.
pub type PendingConfirm = BoxFuture<'static, BrokerResult<Confirmation>>;

pub type RawDeliveries = BoxStream<'static, BrokerResult<Delivery>>;

/// Resolves once, when the connection or channel it was taken from closes.
/// A dropped sender counts as a close.
pub type CloseNotification = oneshot::Receiver<BrokerError>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: TransportConnection;

    async fn dial(&self, addr: &str) -> BrokerResult<Self::Connection>;
}

#[async_trait]
pub trait TransportConnection: Send + Sync + 'static {
    type Channel: TransportChannel;

    async fn open_channel(&self) -> BrokerResult<Self::Channel>;

    fn notify_close(&self) -> CloseNotification;

    async fn close(&self) -> BrokerResult<()>;
}

#[async_trait]
pub trait TransportChannel: Clone + Send + Sync + 'static {
    /// Puts the channel into publisher-confirm mode.
    async fn confirm_select(&self) -> BrokerResult<()>;

    /// Declares a durable queue. Must be idempotent.
    async fn declare_queue(&self, queue: &str) -> BrokerResult<()>;

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()>;

    async fn publish(&self, queue: &str, body: &[u8]) -> BrokerResult<PendingConfirm>;

    /// Starts a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str) -> BrokerResult<RawDeliveries>;

    fn notify_close(&self) -> CloseNotification;

    async fn close(&self) -> BrokerResult<()>;
}
