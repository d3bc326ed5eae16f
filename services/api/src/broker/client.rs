//! services/api/src/broker/client.rs
//!
//! A broker client that keeps one connection and one confirm-mode channel
//! alive for its whole life. A supervisor task redials after connection loss
//! and reopens the channel after channel loss; callers only ever see a channel
//! while the client is `Ready`.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{BrokerError, BrokerResult};
use super::transport::{
    CloseNotification, Confirmation, RawDeliveries, Transport, TransportChannel,
    TransportConnection,
};
use crate::config::BrokerSettings;

/// Where the client is in its connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    Disconnected,
    Connecting,
    ChannelInit,
    Ready,
    ShuttingDown,
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BrokerState::Disconnected => "disconnected",
            BrokerState::Connecting => "connecting",
            BrokerState::ChannelInit => "channel_init",
            BrokerState::Ready => "ready",
            BrokerState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

type ChannelOf<T> = <<T as Transport>::Connection as TransportConnection>::Channel;

/// The state flag and the handles it guards. Only ever locked briefly, never
/// across an await.
struct Handles<T: Transport> {
    state: BrokerState,
    connection: Option<Arc<T::Connection>>,
    channel: Option<ChannelOf<T>>,
}

struct Shared<T: Transport> {
    name: &'static str,
    settings: BrokerSettings,
    transport: T,
    handles: Mutex<Handles<T>>,
    ready: Notify,
    shutdown: CancellationToken,
}

enum AfterSession {
    Reconnect,
    Shutdown,
}

pub struct BrokerClient<T: Transport> {
    shared: Arc<Shared<T>>,
    closed: AtomicBool,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> BrokerClient<T> {
    /// Creates the client and starts connecting in the background.
    /// Must be called from within a tokio runtime.
    pub fn connect(name: &'static str, transport: T, settings: BrokerSettings) -> Self {
        let shared = Arc::new(Shared {
            name,
            settings,
            transport,
            handles: Mutex::new(Handles {
                state: BrokerState::Disconnected,
                connection: None,
                channel: None,
            }),
            ready: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        let supervisor = tokio::spawn(shared.clone().handle_reconnect());

        Self { shared, closed: AtomicBool::new(false), supervisor: Mutex::new(Some(supervisor)) }
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.shared.settings
    }

    pub fn state(&self) -> BrokerState {
        self.shared.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == BrokerState::Ready
    }

    /// Waits until the client is ready, it shuts down, or `limit` elapses.
    pub async fn wait_until_ready(&self, limit: Option<Duration>) -> BrokerResult<()> {
        let deadline = limit.map(|limit| Instant::now() + limit);
        loop {
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.state() {
                BrokerState::Ready => return Ok(()),
                BrokerState::ShuttingDown => return Err(BrokerError::Shutdown),
                _ => {}
            }

            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => return Err(BrokerError::Shutdown),
                _ = &mut notified => {}
                _ = expired => {
                    return Err(BrokerError::ConnectionTimeout(limit.unwrap_or_default()));
                }
            }
        }
    }

    /// Publishes `data` and returns once the broker positively confirmed it.
    ///
    /// Waits up to the connection timeout for the first attempt. Failed
    /// attempts are retried every `resend_delay` until one is confirmed, the
    /// client shuts down, or `max_publish_attempts` is reached.
    pub async fn publish(&self, data: &[u8], queue: &str) -> BrokerResult<()> {
        self.ensure_declared(queue)?;
        let settings = &self.shared.settings;
        self.wait_until_ready(Some(settings.connection_timeout)).await?;

        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.publish_once(data, queue).await {
                Ok(()) => {
                    debug!(client = self.shared.name, queue, attempts, "publish confirmed");
                    return Ok(());
                }
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    warn!(client = self.shared.name, queue, attempts, error = %err, "publish failed, retrying");
                }
            }

            if settings.max_publish_attempts.is_some_and(|max| attempts >= max) {
                return Err(BrokerError::RetriesExhausted { queue: queue.to_string(), attempts });
            }
            tokio::select! {
                biased;
                _ = self.shared.shutdown.cancelled() => return Err(BrokerError::Shutdown),
                _ = sleep(settings.resend_delay) => {}
            }
        }
    }

    /// One send and confirm, bounded by the publish timeout.
    async fn publish_once(&self, data: &[u8], queue: &str) -> BrokerResult<()> {
        let channel = self.shared.ready_channel()?;
        let limit = self.shared.settings.publish_timeout;
        let attempt = async {
            let confirm = channel.publish(queue, data).await?;
            confirm.await
        };
        match timeout(limit, attempt).await {
            Ok(Ok(Confirmation::Ack)) => Ok(()),
            Ok(Ok(Confirmation::Nack)) => {
                Err(BrokerError::Transport("broker did not confirm the message".to_string()))
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(BrokerError::PublishTimeout(limit)),
        }
    }

    /// Starts a manual-ack consumer with prefetch 1 on the current channel.
    /// The returned stream ends when that channel goes away.
    pub async fn consume(&self, queue: &str) -> BrokerResult<RawDeliveries> {
        self.ensure_declared(queue)?;
        let channel = self.shared.ready_channel()?;
        channel.set_prefetch(1).await?;
        let deliveries = channel.consume(queue).await?;
        info!(client = self.shared.name, queue, "consumer started");
        Ok(deliveries)
    }

    /// Stops the supervisor and closes the channel, then the connection.
    /// Only the first call does anything; later calls fail with `AlreadyClosed`.
    pub async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::AlreadyClosed);
        }

        let (channel, connection) = {
            let mut handles = self.shared.lock();
            handles.state = BrokerState::ShuttingDown;
            (handles.channel.take(), handles.connection.take())
        };
        self.shared.shutdown.cancel();
        info!(client = self.shared.name, "closing broker client");

        let mut result = Ok(());
        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                warn!(client = self.shared.name, error = %err, "failed to close channel");
                result = Err(err);
            }
        }
        if let Some(connection) = connection {
            if let Err(err) = connection.close().await {
                warn!(client = self.shared.name, error = %err, "failed to close connection");
                result = Err(err);
            }
        }

        let supervisor = self.supervisor.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(supervisor) = supervisor {
            if let Err(err) = supervisor.await {
                error!(client = self.shared.name, error = %err, "broker supervisor task failed");
            }
        }
        result
    }

    fn ensure_declared(&self, queue: &str) -> BrokerResult<()> {
        if self.shared.settings.queues.iter().any(|declared| declared == queue) {
            Ok(())
        } else {
            Err(BrokerError::QueueNotDeclared(queue.to_string()))
        }
    }
}

impl<T: Transport> Drop for BrokerClient<T> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl<T: Transport> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, Handles<T>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `next` unless the client is shutting down.
    fn transition(&self, next: BrokerState) -> bool {
        let mut handles = self.lock();
        if handles.state == BrokerState::ShuttingDown {
            return false;
        }
        if handles.state != next {
            info!(client = self.name, from = %handles.state, to = %next, "broker state changed");
            handles.state = next;
        }
        if next != BrokerState::Ready {
            handles.channel = None;
        }
        true
    }

    fn ready_channel(&self) -> BrokerResult<ChannelOf<T>> {
        let handles = self.lock();
        match (handles.state, handles.channel.as_ref()) {
            (BrokerState::Ready, Some(channel)) => Ok(channel.clone()),
            (BrokerState::ShuttingDown, _) => Err(BrokerError::Shutdown),
            _ => Err(BrokerError::NotConnected),
        }
    }

    /// Sleeps for `delay`. Returns false if shutdown fired first.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    /// The connect loop. Runs until shutdown.
    async fn handle_reconnect(self: Arc<Self>) {
        loop {
            if !self.transition(BrokerState::Connecting) {
                return;
            }
            let dialed = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                dialed = self.transport.dial(&self.settings.host) => dialed,
            };

            let connection = match dialed {
                Ok(connection) => Arc::new(connection),
                Err(err) => {
                    warn!(client = self.name, error = %err, "failed to connect, retrying");
                    self.transition(BrokerState::Disconnected);
                    if !self.pause(self.settings.reconnection_delay).await {
                        return;
                    }
                    continue;
                }
            };
            info!(client = self.name, "connected to broker");
            let connection_closed = connection.notify_close();
            let stored = {
                let mut handles = self.lock();
                let open = handles.state != BrokerState::ShuttingDown;
                if open {
                    handles.connection = Some(connection.clone());
                }
                open
            };
            if !stored {
                if let Err(err) = connection.close().await {
                    debug!(client = self.name, error = %err, "failed to close connection");
                }
                return;
            }

            match self.handle_reinit(&connection, connection_closed).await {
                AfterSession::Shutdown => return,
                AfterSession::Reconnect => {
                    self.transition(BrokerState::Disconnected);
                    self.lock().connection = None;
                }
            }
        }
    }

    /// The channel loop for one connection.
    async fn handle_reinit(
        &self,
        connection: &T::Connection,
        mut connection_closed: CloseNotification,
    ) -> AfterSession {
        loop {
            if !self.transition(BrokerState::ChannelInit) {
                return AfterSession::Shutdown;
            }

            let channel_closed = match self.init(connection).await {
                Ok(channel_closed) => channel_closed,
                Err(err) => {
                    warn!(client = self.name, error = %err, "failed to initialise channel, retrying");
                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return AfterSession::Shutdown,
                        _ = &mut connection_closed => return AfterSession::Reconnect,
                        _ = sleep(self.settings.reinitialization_delay) => continue,
                    }
                }
            };

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return AfterSession::Shutdown,
                reason = &mut connection_closed => {
                    warn!(client = self.name, reason = ?reason.ok(), "connection closed, reconnecting");
                    return AfterSession::Reconnect;
                }
                reason = channel_closed => {
                    warn!(client = self.name, reason = ?reason.ok(), "channel closed, reinitialising");
                }
            }
        }
    }

    /// Opens a confirm-mode channel and declares every configured queue.
    async fn init(&self, connection: &T::Connection) -> BrokerResult<CloseNotification> {
        let channel = connection.open_channel().await?;
        channel.confirm_select().await?;
        for queue in &self.settings.queues {
            channel.declare_queue(queue).await?;
        }
        let channel_closed = channel.notify_close();

        let stored = {
            let mut handles = self.lock();
            if handles.state == BrokerState::ShuttingDown {
                None
            } else {
                info!(client = self.name, from = %handles.state, to = %BrokerState::Ready, "broker state changed");
                handles.state = BrokerState::Ready;
                handles.channel = Some(channel.clone());
                Some(channel_closed)
            }
        };
        match stored {
            Some(channel_closed) => {
                self.ready.notify_waiters();
                Ok(channel_closed)
            }
            None => {
                // Close already ran and could not see these handles.
                if let Err(err) = channel.close().await {
                    debug!(client = self.name, error = %err, "failed to close channel");
                }
                if let Err(err) = connection.close().await {
                    debug!(client = self.name, error = %err, "failed to close connection");
                }
                Err(BrokerError::Shutdown)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;

    fn settings() -> BrokerSettings {
        BrokerSettings {
            host: "memory".to_string(),
            queues: vec!["review".to_string()],
            reconnection_delay: Duration::from_secs(5),
            reinitialization_delay: Duration::from_secs(2),
            resend_delay: Duration::from_secs(5),
            connection_timeout: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(5),
            max_publish_attempts: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn becomes_ready_and_publishes_with_confirm() {
        let broker = MemoryBroker::new();
        let client = BrokerClient::connect("producer", broker.clone(), settings());

        client.publish(br#"{"interview_id":1}"#, "review").await.unwrap();
        assert!(client.is_ready());
        assert_eq!(broker.stats().published, 1);
        assert_eq!(broker.queue_len("review"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn undeclared_queue_is_fatal() {
        let client = BrokerClient::connect("producer", MemoryBroker::new(), settings());
        let err = client.publish(b"{}", "scores").await.unwrap_err();
        assert!(matches!(err, BrokerError::QueueNotDeclared(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_confirms_are_resent() {
        let broker = MemoryBroker::new();
        broker.nack_next_publishes(2);
        let client = BrokerClient::connect("producer", broker.clone(), settings());

        let started = Instant::now();
        client.publish(b"{}", "review").await.unwrap();
        assert_eq!(broker.stats().published, 1);
        // Two failed attempts, each followed by the resend delay.
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_confirms_time_out_per_attempt() {
        let broker = MemoryBroker::new();
        broker.stall_confirms(true);
        let client = BrokerClient::connect(
            "producer",
            broker,
            BrokerSettings { max_publish_attempts: Some(2), ..settings() },
        );

        let err = client.publish(b"{}", "review").await.unwrap_err();
        assert!(matches!(err, BrokerError::RetriesExhausted { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_failures_are_retried_after_the_reinit_delay() {
        let broker = MemoryBroker::new();
        broker.fail_next_channel_opens(3);
        let client = BrokerClient::connect("consumer", broker.clone(), settings());

        let started = Instant::now();
        client.wait_until_ready(None).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(6));
        assert_eq!(broker.stats().dials, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_channel_finished_during_close_is_closed_too() {
        let broker = MemoryBroker::new();
        broker.hold_declarations(true);
        let client = Arc::new(BrokerClient::connect("producer", broker.clone(), settings()));
        sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(), BrokerState::ChannelInit);

        let closing = {
            let client = client.clone();
            tokio::spawn(async move { client.close().await })
        };
        sleep(Duration::from_millis(10)).await;
        assert_eq!(client.state(), BrokerState::ShuttingDown);
        broker.hold_declarations(false);

        closing.await.unwrap().unwrap();
        let stats = broker.stats();
        assert_eq!(stats.channels_opened, 1);
        assert_eq!(stats.channels_closed, 1);
        assert!(!client.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn close_is_single_shot() {
        let client = BrokerClient::connect("producer", MemoryBroker::new(), settings());
        client.wait_until_ready(None).await.unwrap();

        client.close().await.unwrap();
        assert_eq!(client.state(), BrokerState::ShuttingDown);
        assert!(matches!(client.close().await, Err(BrokerError::AlreadyClosed)));
        assert!(matches!(client.publish(b"{}", "review").await, Err(BrokerError::Shutdown)));
    }
}
