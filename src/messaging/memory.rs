//! In-process broker with AMQP 0-9-1 routing semantics.
//!
//! Supports fanout and direct exchanges, the default exchange, durable and
//! exclusive queues, per-consumer prefetch, round-robin delivery between
//! competing consumers and redelivery of unacknowledged messages when a
//! connection closes. Used by the test suite and by local runs without a
//! RabbitMQ server (`RABBITMQ_URL=memory://`).

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;
use uuid::Uuid;

use super::broker::{
    Acknowledger, BrokerChannel, Delivery, DeliveryStream, ExchangeKind, ExchangeSpec,
    OutgoingMessage, QueueOptions, DEFAULT_EXCHANGE,
};
use super::errors::MessagingError;
use super::supervisor::Connector;

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredMessage {
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub persistent: bool,
    pub redelivered: bool,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    spec: ExchangeSpec,
    bindings: Vec<Binding>,
}

struct ConsumerSlot {
    connection_id: u64,
    consumer_tag: String,
    sender: mpsc::UnboundedSender<Result<Delivery, MessagingError>>,
    acker: Arc<dyn Acknowledger>,
    in_flight: usize,
}

struct Unacked {
    consumer_tag: String,
    message: StoredMessage,
}

struct QueueState {
    durable: bool,
    exclusive: bool,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    unacked: HashMap<(u64, u64), Unacked>,
}

struct ConnectionState {
    prefetch: u16,
    next_delivery_tag: u64,
}

struct BrokerState {
    available: bool,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnectionState>,
    next_connection_id: u64,
}

type SharedState = Arc<Mutex<BrokerState>>;

/// Handle to an in-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: SharedState,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(BrokerState {
                available: true,
                exchanges: HashMap::new(),
                queues: HashMap::new(),
                connections: HashMap::new(),
                next_connection_id: 1,
            })),
        }
    }

    /// Open a connection with a single channel.
    pub fn connect(&self) -> Result<InMemoryChannel, MessagingError> {
        let mut state = self.shared.lock();
        if !state.available {
            return Err(MessagingError::connection("memory://", "broker unavailable"));
        }

        let connection_id = state.next_connection_id;
        state.next_connection_id += 1;
        state.connections.insert(
            connection_id,
            ConnectionState {
                prefetch: 0,
                next_delivery_tag: 1,
            },
        );

        debug!(connection_id, "In-memory connection opened");

        Ok(InMemoryChannel {
            shared: Arc::clone(&self.shared),
            connection_id,
            open: AtomicBool::new(true),
        })
    }

    /// Refuse new connections while `false`.
    pub fn set_available(&self, available: bool) {
        self.shared.lock().available = available;
    }

    /// Drop every connection, as a broker restart would. Durable queues and
    /// exchanges survive with their persistent messages; everything else is
    /// lost.
    pub fn restart(&self) {
        let mut state = self.shared.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        for id in ids {
            close_connection(&mut state, id);
        }

        state.exchanges.retain(|_, exchange| exchange.spec.durable);
        state.queues.retain(|_, queue| queue.durable);
        for queue in state.queues.values_mut() {
            queue.ready.retain(|message| message.persistent);
        }
        let queues: Vec<String> = state.queues.keys().cloned().collect();
        for exchange in state.exchanges.values_mut() {
            exchange.bindings.retain(|b| queues.contains(&b.queue));
        }
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.shared.lock().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn binding_count(&self, exchange: &str) -> usize {
        self.shared
            .lock()
            .exchanges
            .get(exchange)
            .map_or(0, |e| e.bindings.len())
    }

    /// Messages waiting for a consumer.
    pub fn message_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet settled.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Connections currently open.
    pub fn connection_count(&self) -> usize {
        self.shared.lock().connections.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.len())
    }

    /// Copy of the messages waiting in a queue, oldest first.
    pub fn peek_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    type Connection = InMemoryChannel;

    fn target(&self) -> String {
        "memory://".to_string()
    }

    async fn connect(&self) -> Result<InMemoryChannel, MessagingError> {
        InMemoryBroker::connect(self)
    }
}

/// A connection to an [`InMemoryBroker`] carrying one channel.
pub struct InMemoryChannel {
    shared: SharedState,
    connection_id: u64,
    open: AtomicBool,
}

impl InMemoryChannel {
    pub fn connection_id(&self) -> u64 {
        self.connection_id
    }

    fn ensure_open(&self, state: &BrokerState) -> Result<(), MessagingError> {
        if self.open.load(Ordering::SeqCst) && state.connections.contains_key(&self.connection_id)
        {
            Ok(())
        } else {
            Err(MessagingError::ChannelClosed)
        }
    }

    fn shutdown(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let mut state = self.shared.lock();
            close_connection(&mut state, self.connection_id);
            debug!(connection_id = self.connection_id, "In-memory connection closed");
        }
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), MessagingError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        if let Some(existing) = state.exchanges.get(&spec.name) {
            if existing.spec.kind != spec.kind {
                return Err(MessagingError::topology_conflict(
                    "exchange",
                    &spec.name,
                    format!("declared as {}, exists as {}", spec.kind, existing.spec.kind),
                ));
            }
            if existing.spec.durable != spec.durable {
                return Err(MessagingError::topology_conflict(
                    "exchange",
                    &spec.name,
                    format!(
                        "declared durable={}, exists durable={}",
                        spec.durable, existing.spec.durable
                    ),
                ));
            }
            return Ok(());
        }

        state.exchanges.insert(
            spec.name.clone(),
            ExchangeState {
                spec: spec.clone(),
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    async fn declare_queue(&self, options: &QueueOptions) -> Result<String, MessagingError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        let name = if options.name.is_empty() {
            format!("amq.gen-{}", Uuid::new_v4().simple())
        } else {
            options.name.clone()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.exclusive && existing.owner != Some(self.connection_id) {
                return Err(MessagingError::ResourceLocked {
                    entity: "queue",
                    name,
                });
            }
            if existing.durable != options.durable {
                return Err(MessagingError::topology_conflict(
                    "queue",
                    &name,
                    format!(
                        "declared durable={}, exists durable={}",
                        options.durable, existing.durable
                    ),
                ));
            }
            if existing.exclusive != options.exclusive {
                return Err(MessagingError::topology_conflict(
                    "queue",
                    &name,
                    format!(
                        "declared exclusive={}, exists exclusive={}",
                        options.exclusive, existing.exclusive
                    ),
                ));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                durable: options.durable,
                exclusive: options.exclusive,
                owner: options.exclusive.then_some(self.connection_id),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                unacked: HashMap::new(),
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(MessagingError::not_found("queue", queue));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| MessagingError::not_found("exchange", exchange))?;

        let already_bound = exchange_state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !already_bound {
            exchange_state.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), MessagingError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        let targets: Vec<String> = if exchange == DEFAULT_EXCHANGE {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            let exchange_state = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| MessagingError::not_found("exchange", exchange))?;
            let mut targets: Vec<String> = Vec::new();
            for binding in &exchange_state.bindings {
                let matches = match exchange_state.spec.kind {
                    ExchangeKind::Fanout => true,
                    ExchangeKind::Direct => binding.routing_key == routing_key,
                };
                if matches && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "Message unroutable, dropped");
        }

        for queue in &targets {
            if let Some(queue_state) = state.queues.get_mut(queue) {
                queue_state.ready.push_back(StoredMessage {
                    body: message.body.clone(),
                    headers: message.headers.clone(),
                    persistent: message.persistent,
                    redelivered: false,
                });
            }
            dispatch(&mut state, queue);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;
        if let Some(connection) = state.connections.get_mut(&self.connection_id) {
            connection.prefetch = count;
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, MessagingError> {
        let mut state = self.shared.lock();
        self.ensure_open(&state)?;

        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| MessagingError::not_found("queue", queue))?;
        if queue_state.exclusive && queue_state.owner != Some(self.connection_id) {
            return Err(MessagingError::ResourceLocked {
                entity: "queue",
                name: queue.to_string(),
            });
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        queue_state.consumers.push(ConsumerSlot {
            connection_id: self.connection_id,
            consumer_tag: consumer_tag.to_string(),
            sender,
            acker: Arc::new(MemoryAcker {
                shared: Arc::clone(&self.shared),
                connection_id: self.connection_id,
                queue: queue.to_string(),
            }),
            in_flight: 0,
        });
        dispatch(&mut state, queue);

        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
            && self
                .shared
                .lock()
                .connections
                .contains_key(&self.connection_id)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.shutdown();
        Ok(())
    }
}

struct MemoryAcker {
    shared: SharedState,
    connection_id: u64,
    queue: String,
}

impl MemoryAcker {
    fn settle(&self, delivery_tag: u64, requeue: Option<bool>) -> Result<(), MessagingError> {
        let mut state = self.shared.lock();
        if !state.connections.contains_key(&self.connection_id) {
            return Err(MessagingError::ChannelClosed);
        }

        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| MessagingError::not_found("queue", &self.queue))?;
        let unacked = queue
            .unacked
            .remove(&(self.connection_id, delivery_tag))
            .ok_or_else(|| {
                MessagingError::broker(
                    "basic.ack",
                    format!("unknown delivery tag {delivery_tag}"),
                )
            })?;

        if let Some(slot) = queue.consumers.iter_mut().find(|c| {
            c.connection_id == self.connection_id && c.consumer_tag == unacked.consumer_tag
        }) {
            slot.in_flight = slot.in_flight.saturating_sub(1);
        }

        if requeue == Some(true) {
            let mut message = unacked.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }

        dispatch(&mut state, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.settle(delivery_tag, None)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.settle(delivery_tag, Some(requeue))
    }
}

/// Hand ready messages to consumers that have prefetch room, round-robin.
fn dispatch(state: &mut BrokerState, queue: &str) {
    let BrokerState {
        queues,
        connections,
        ..
    } = state;
    let Some(queue_state) = queues.get_mut(queue) else {
        return;
    };

    queue_state.consumers.retain(|c| !c.sender.is_closed());

    while !queue_state.ready.is_empty() && !queue_state.consumers.is_empty() {
        let count = queue_state.consumers.len();
        let start = queue_state.next_consumer % count;

        let chosen = (0..count).map(|offset| (start + offset) % count).find(|&i| {
            let slot = &queue_state.consumers[i];
            let prefetch = connections
                .get(&slot.connection_id)
                .map_or(0, |c| c.prefetch as usize);
            prefetch == 0 || slot.in_flight < prefetch
        });
        let Some(index) = chosen else {
            break;
        };
        queue_state.next_consumer = index + 1;

        let Some(connection) = connections.get_mut(&queue_state.consumers[index].connection_id)
        else {
            break;
        };
        let delivery_tag = connection.next_delivery_tag;
        connection.next_delivery_tag += 1;

        let Some(message) = queue_state.ready.pop_front() else {
            break;
        };
        let slot = &mut queue_state.consumers[index];
        let delivery = Delivery::new(
            delivery_tag,
            queue,
            message.body.clone(),
            message.headers.clone(),
            message.redelivered,
            Arc::clone(&slot.acker),
        );

        if slot.sender.send(Ok(delivery)).is_err() {
            queue_state.ready.push_front(message);
            queue_state.consumers.remove(index);
            continue;
        }

        slot.in_flight += 1;
        queue_state.unacked.insert(
            (slot.connection_id, delivery_tag),
            Unacked {
                consumer_tag: slot.consumer_tag.clone(),
                message,
            },
        );
    }
}

/// Tear down a connection: cancel its consumers, return its unacknowledged
/// messages to their queues and delete the exclusive queues it owned.
fn close_connection(state: &mut BrokerState, connection_id: u64) {
    if state.connections.remove(&connection_id).is_none() {
        return;
    }

    let mut owned = Vec::new();
    for (name, queue) in state.queues.iter_mut() {
        queue.consumers.retain(|c| c.connection_id != connection_id);

        let mut returned: Vec<(u64, StoredMessage)> = Vec::new();
        queue.unacked.retain(|(conn, tag), unacked| {
            if *conn == connection_id {
                let mut message = unacked.message.clone();
                message.redelivered = true;
                returned.push((*tag, message));
                false
            } else {
                true
            }
        });
        returned.sort_by_key(|(tag, _)| *tag);
        for (_, message) in returned.into_iter().rev() {
            queue.ready.push_front(message);
        }

        if queue.owner == Some(connection_id) {
            owned.push(name.clone());
        }
    }

    for name in &owned {
        state.queues.remove(name);
    }
    for exchange in state.exchanges.values_mut() {
        exchange.bindings.retain(|b| !owned.contains(&b.queue));
    }

    let queues: Vec<String> = state.queues.keys().cloned().collect();
    for queue in queues {
        dispatch(state, &queue);
    }
}
