//! Broker channel abstraction.
//!
//! Publisher, consumer and topology manager all talk to the broker through
//! [`BrokerChannel`]. A channel is owned explicitly and injected; nothing in
//! the crate keeps a process-wide channel.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::MessagingError;

/// Exchange name that routes straight to the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

/// Header carrying the number of times a message has been republished.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    /// Every bound queue gets a copy; routing key ignored
    Fanout,
    /// Queues bound with exactly the routing key get a copy
    Direct,
}

impl std::fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExchangeKind::Fanout => write!(f, "fanout"),
            ExchangeKind::Direct => write!(f, "direct"),
        }
    }
}

/// Declared properties of an exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            durable: true,
        }
    }
}

/// Declared properties of a queue. An empty name asks the broker to
/// generate one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
}

/// A message handed to the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub body: Vec<u8>,
    pub content_type: String,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

impl OutgoingMessage {
    /// Persistent JSON message.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            body,
            content_type: "application/json".to_string(),
            persistent: true,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// Stream of deliveries for one consumer; ends when the channel closes.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, MessagingError>>;

/// Settles deliveries on the channel that received them.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;
}

/// A message received from a queue.
///
/// A delivery can be settled once: the first `ack` or `nack` wins and any
/// later call fails with [`MessagingError::AlreadySettled`].
pub struct Delivery {
    pub delivery_tag: u64,
    pub queue: String,
    pub body: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub redelivered: bool,
    acker: Arc<dyn Acknowledger>,
    settled: AtomicBool,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        queue: impl Into<String>,
        body: Vec<u8>,
        headers: BTreeMap<String, String>,
        redelivered: bool,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            queue: queue.into(),
            body,
            headers,
            redelivered,
            acker,
            settled: AtomicBool::new(false),
        }
    }

    /// Number of times this message was republished after failing.
    pub fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub async fn ack(&self) -> Result<(), MessagingError> {
        self.settle()?;
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn nack(&self, requeue: bool) -> Result<(), MessagingError> {
        self.settle()?;
        self.acker.nack(self.delivery_tag, requeue).await
    }

    fn settle(&self) -> Result<(), MessagingError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(MessagingError::AlreadySettled {
                delivery_tag: self.delivery_tag,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("queue", &self.queue)
            .field("body_len", &self.body.len())
            .field("headers", &self.headers)
            .field("redelivered", &self.redelivered)
            .field("settled", &self.is_settled())
            .finish()
    }
}

/// One channel on one broker connection.
///
/// Implementations serialise frame writes per connection; callers may share
/// a channel between publishing and acknowledging tasks.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange, or confirm an identical one exists.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), MessagingError>;

    /// Declare a queue and return its actual name.
    async fn declare_queue(&self, options: &QueueOptions) -> Result<String, MessagingError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError>;

    /// Hand a message to the broker. Resolves once the broker has the
    /// frame, not when any consumer has processed it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), MessagingError>;

    /// Limit unacknowledged deliveries per consumer; 0 means unlimited.
    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError>;

    async fn consume(&self, queue: &str, consumer_tag: &str)
        -> Result<DeliveryStream, MessagingError>;

    fn is_connected(&self) -> bool;

    /// Close the channel and its connection. Unacknowledged deliveries go
    /// back to their queues.
    async fn close(&self) -> Result<(), MessagingError>;
}
