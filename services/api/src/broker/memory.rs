//! services/api/src/broker/memory.rs
//!
//! An in-process broker implementing the transport traits. It honours the
//! parts of the AMQP contract the client relies on (publisher confirms,
//! durable queues, prefetch, manual acknowledgement, redelivery of unacked
//! messages after a connection loss) and exposes fault-injection controls.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future;
use interview_core::ports::{Acknowledger, Delivery, PortError, PortResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{oneshot, Notify};

use super::error::{BrokerError, BrokerResult};
use super::transport::{
    CloseNotification, Confirmation, PendingConfirm, RawDeliveries, Transport, TransportChannel,
    TransportConnection,
};

/// Counters observed by tests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub dials: u32,
    pub published: u32,
    pub acks: u32,
    pub nacks: u32,
    pub rejects: u32,
    /// Highest number of unacknowledged deliveries held at once.
    pub max_in_flight: usize,
    pub prefetch: Option<u16>,
    pub channels_opened: u32,
    pub channels_closed: u32,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    changed: Notify,
}

#[derive(Default)]
struct State {
    unreachable: bool,
    generation: u64,
    queues: HashMap<String, VecDeque<Bytes>>,
    unacked: HashMap<u64, Unacked>,
    next_tag: u64,
    nack_publishes: u32,
    stall_confirms: bool,
    failing_channel_opens: u32,
    hold_declarations: bool,
    closers: Vec<oneshot::Sender<BrokerError>>,
    stats: MemoryStats,
}

struct Unacked {
    queue: String,
    body: Bytes,
    channel: Arc<ChannelShared>,
}

enum Settle {
    Ack,
    Nack(bool),
    Reject(bool),
}

enum Take {
    Delivery(Delivery),
    Closed,
    Empty,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.inner.changed.notify_waiters();
    }

    /// While unreachable every dial fails.
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().unreachable = !reachable;
    }

    /// Severs every open connection. Unacknowledged deliveries go back to the
    /// head of their queue and every close listener fires.
    pub fn drop_connections(&self) {
        let mut state = self.lock();
        state.generation += 1;
        let unacked: Vec<Unacked> = state.unacked.drain().map(|(_, entry)| entry).collect();
        for entry in unacked {
            entry.channel.release();
            state.queues.entry(entry.queue).or_default().push_front(entry.body);
        }
        for closer in state.closers.drain(..) {
            let _ = closer.send(BrokerError::Transport("connection reset by broker".to_string()));
        }
        drop(state);
        self.touch();
    }

    /// Negatively confirms the next `count` publishes.
    pub fn nack_next_publishes(&self, count: u32) {
        self.lock().nack_publishes = count;
    }

    /// While stalled, publishes are accepted by the channel but never confirmed.
    pub fn stall_confirms(&self, stalled: bool) {
        self.lock().stall_confirms = stalled;
    }

    pub fn fail_next_channel_opens(&self, count: u32) {
        self.lock().failing_channel_opens = count;
    }

    /// While held, queue declarations succeed but do not return.
    pub fn hold_declarations(&self, held: bool) {
        self.lock().hold_declarations = held;
        self.touch();
    }

    async fn declarations_released(&self) {
        loop {
            let changed = self.inner.changed.notified();
            let mut changed = std::pin::pin!(changed);
            changed.as_mut().enable();
            let held = self.lock().hold_declarations;
            if !held {
                return;
            }
            changed.await;
        }
    }

    /// Puts a message straight onto a queue, declaring it if needed.
    pub fn enqueue(&self, queue: &str, body: impl Into<Bytes>) {
        self.lock().queues.entry(queue.to_string()).or_default().push_back(body.into());
        self.touch();
    }

    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    pub fn in_flight(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn stats(&self) -> MemoryStats {
        self.lock().stats
    }

    fn register_closer(&self, generation: u64) -> CloseNotification {
        let (tx, rx) = oneshot::channel();
        let mut state = self.lock();
        if state.generation == generation {
            state.closers.push(tx);
        } else {
            let _ = tx.send(BrokerError::Transport("connection already closed".to_string()));
        }
        rx
    }

    fn take_delivery(&self, channel: &MemoryChannel, queue: &str) -> Take {
        let mut state = self.lock();
        if !channel.is_open(&state) {
            return Take::Closed;
        }
        if !channel.shared.has_capacity() {
            return Take::Empty;
        }
        let Some(body) = state.queues.get_mut(queue).and_then(VecDeque::pop_front) else {
            return Take::Empty;
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        channel.shared.acquire();
        state.unacked.insert(
            tag,
            Unacked { queue: queue.to_string(), body: body.clone(), channel: channel.shared.clone() },
        );
        state.stats.max_in_flight = state.stats.max_in_flight.max(state.unacked.len());

        let acker = MemoryAcknowledger { broker: self.clone(), tag };
        Take::Delivery(Delivery::new(body, Box::new(acker)))
    }

    fn settle(&self, tag: u64, outcome: Settle) -> PortResult<()> {
        let mut state = self.lock();
        let entry = state
            .unacked
            .remove(&tag)
            .ok_or_else(|| PortError::Unavailable(format!("unknown delivery tag {}", tag)))?;
        entry.channel.release();

        let requeue = match outcome {
            Settle::Ack => {
                state.stats.acks += 1;
                false
            }
            Settle::Nack(requeue) => {
                state.stats.nacks += 1;
                requeue
            }
            Settle::Reject(requeue) => {
                state.stats.rejects += 1;
                requeue
            }
        };
        if requeue {
            state.queues.entry(entry.queue).or_default().push_front(entry.body);
        }
        drop(state);
        self.touch();
        Ok(())
    }
}

#[async_trait]
impl Transport for MemoryBroker {
    type Connection = MemoryConnection;

    async fn dial(&self, _addr: &str) -> BrokerResult<MemoryConnection> {
        let mut state = self.lock();
        state.stats.dials += 1;
        if state.unreachable {
            return Err(BrokerError::Transport("connection refused".to_string()));
        }
        Ok(MemoryConnection {
            broker: self.clone(),
            generation: state.generation,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

pub struct MemoryConnection {
    broker: MemoryBroker,
    generation: u64,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportConnection for MemoryConnection {
    type Channel = MemoryChannel;

    async fn open_channel(&self) -> BrokerResult<MemoryChannel> {
        let mut state = self.broker.lock();
        if state.generation != self.generation || self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("connection is closed".to_string()));
        }
        if state.failing_channel_opens > 0 {
            state.failing_channel_opens -= 1;
            return Err(BrokerError::Transport("channel open refused".to_string()));
        }
        state.stats.channels_opened += 1;
        Ok(MemoryChannel {
            broker: self.broker.clone(),
            generation: self.generation,
            connection_closed: self.closed.clone(),
            shared: Arc::new(ChannelShared::default()),
        })
    }

    fn notify_close(&self) -> CloseNotification {
        self.broker.register_closer(self.generation)
    }

    async fn close(&self) -> BrokerResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.broker.touch();
        Ok(())
    }
}

#[derive(Default)]
struct ChannelShared {
    closed: AtomicBool,
    confirms: AtomicBool,
    prefetch: AtomicU16,
    in_flight: Mutex<usize>,
}

impl ChannelShared {
    fn in_flight(&self) -> MutexGuard<'_, usize> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn has_capacity(&self) -> bool {
        let prefetch = self.prefetch.load(Ordering::SeqCst);
        prefetch == 0 || *self.in_flight() < usize::from(prefetch)
    }

    fn acquire(&self) {
        *self.in_flight() += 1;
    }

    fn release(&self) {
        let mut in_flight = self.in_flight();
        *in_flight = in_flight.saturating_sub(1);
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    generation: u64,
    connection_closed: Arc<AtomicBool>,
    shared: Arc<ChannelShared>,
}

impl MemoryChannel {
    fn is_open(&self, state: &State) -> bool {
        state.generation == self.generation
            && !self.connection_closed.load(Ordering::SeqCst)
            && !self.shared.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> BrokerResult<MutexGuard<'_, State>> {
        let state = self.broker.lock();
        if self.is_open(&state) {
            Ok(state)
        } else {
            Err(BrokerError::Transport("channel is closed".to_string()))
        }
    }
}

#[async_trait]
impl TransportChannel for MemoryChannel {
    async fn confirm_select(&self) -> BrokerResult<()> {
        let _state = self.ensure_open()?;
        self.shared.confirms.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> BrokerResult<()> {
        {
            let mut state = self.ensure_open()?;
            state.queues.entry(queue.to_string()).or_default();
        }
        self.broker.declarations_released().await;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> BrokerResult<()> {
        let mut state = self.ensure_open()?;
        self.shared.prefetch.store(count, Ordering::SeqCst);
        state.stats.prefetch = Some(count);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8]) -> BrokerResult<PendingConfirm> {
        let mut state = self.ensure_open()?;
        if state.stall_confirms {
            return Ok(Box::pin(future::pending::<BrokerResult<Confirmation>>()));
        }

        let confirmation = if !self.shared.confirms.load(Ordering::SeqCst) {
            Confirmation::Nack
        } else if state.nack_publishes > 0 {
            state.nack_publishes -= 1;
            Confirmation::Nack
        } else if let Some(messages) = state.queues.get_mut(queue) {
            messages.push_back(Bytes::copy_from_slice(body));
            state.stats.published += 1;
            Confirmation::Ack
        } else {
            // Unroutable with the mandatory flag.
            Confirmation::Nack
        };
        drop(state);
        self.broker.touch();

        Ok(Box::pin(future::ready(Ok::<_, BrokerError>(confirmation))))
    }

    async fn consume(&self, queue: &str) -> BrokerResult<RawDeliveries> {
        {
            let state = self.ensure_open()?;
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::Transport(format!("NOT_FOUND - no queue '{}'", queue)));
            }
        }

        let broker = self.broker.clone();
        let channel = self.clone();
        let queue = queue.to_string();
        Ok(Box::pin(async_stream::stream! {
            loop {
                let changed = broker.inner.changed.notified();
                let mut changed = std::pin::pin!(changed);
                changed.as_mut().enable();

                match broker.take_delivery(&channel, &queue) {
                    Take::Delivery(delivery) => yield Ok(delivery),
                    Take::Closed => {
                        yield Err(BrokerError::Transport("consumer channel closed".to_string()));
                        break;
                    }
                    Take::Empty => changed.await,
                }
            }
        }))
    }

    fn notify_close(&self) -> CloseNotification {
        self.broker.register_closer(self.generation)
    }

    async fn close(&self) -> BrokerResult<()> {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            self.broker.lock().stats.channels_closed += 1;
        }
        self.broker.touch();
        Ok(())
    }
}

struct MemoryAcknowledger {
    broker: MemoryBroker,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcknowledger {
    async fn ack(&self) -> PortResult<()> {
        self.broker.settle(self.tag, Settle::Ack)
    }

    async fn nack(&self, requeue: bool) -> PortResult<()> {
        self.broker.settle(self.tag, Settle::Nack(requeue))
    }

    async fn reject(&self, requeue: bool) -> PortResult<()> {
        self.broker.settle(self.tag, Settle::Reject(requeue))
    }
}
