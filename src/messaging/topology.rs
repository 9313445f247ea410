//! Broker Topology Manager
//!
//! Declares the exchange, queues and bindings a service needs before it
//! publishes or consumes. Declaring an identical topology again is a no-op;
//! declaring conflicting properties for an existing name fails with
//! [`MessagingError::TopologyConflict`].

use std::sync::Arc;

use tracing::{debug, info, instrument};

use super::broker::{BrokerChannel, ExchangeKind, ExchangeSpec, QueueOptions};
use super::errors::MessagingError;

/// Fanout exchange carrying order facts.
pub const ORDER_EVENTS_EXCHANGE: &str = "order_events";

/// Durable queue shared by the dispatch and drone consumers.
pub const DISPATCH_QUEUE: &str = "dispatch_queue";

/// Direct exchange receiving messages no consumer could process.
pub const DEAD_LETTER_EXCHANGE: &str = "order_events.dead_letter";

/// Queue identity in a topology descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueName {
    Named(String),
    /// Broker-generated name
    Anonymous,
}

/// One queue and its binding to the topology's exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: QueueName,
    pub durable: bool,
    pub exclusive: bool,
    pub binding_key: String,
}

impl QueueSpec {
    /// Named durable queue that survives broker restarts.
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: QueueName::Named(name.into()),
            durable: true,
            exclusive: false,
            binding_key: String::new(),
        }
    }

    /// Anonymous queue deleted with its connection.
    pub fn exclusive() -> Self {
        Self {
            name: QueueName::Anonymous,
            durable: false,
            exclusive: true,
            binding_key: String::new(),
        }
    }

    fn options(&self) -> QueueOptions {
        QueueOptions {
            name: match &self.name {
                QueueName::Named(name) => name.clone(),
                QueueName::Anonymous => String::new(),
            },
            durable: self.durable,
            exclusive: self.exclusive,
        }
    }
}

/// Where a consumer parks messages it gives up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterSpec {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
}

impl DeadLetterSpec {
    /// `<consumer>.dead_letter` on the shared dead-letter exchange.
    pub fn for_consumer(consumer: &str) -> Self {
        Self {
            exchange: DEAD_LETTER_EXCHANGE.to_string(),
            queue: format!("{consumer}.dead_letter"),
            routing_key: consumer.to_string(),
        }
    }
}

/// Everything one service declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySpec {
    pub exchange: ExchangeSpec,
    pub queues: Vec<QueueSpec>,
    pub dead_letter: Option<DeadLetterSpec>,
}

impl TopologySpec {
    /// Durable fanout exchange with no queues yet.
    pub fn fanout(exchange: impl Into<String>) -> Self {
        Self {
            exchange: ExchangeSpec::durable(exchange, ExchangeKind::Fanout),
            queues: Vec::new(),
            dead_letter: None,
        }
    }

    pub fn with_queue(mut self, queue: QueueSpec) -> Self {
        self.queues.push(queue);
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetterSpec) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }
}

/// Resolved names after declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredTopology {
    pub exchange: String,
    /// Actual queue names, in descriptor order
    pub queues: Vec<String>,
    pub dead_letter: Option<DeadLetterSpec>,
}

impl DeclaredTopology {
    /// First declared queue, which is the one a consumer reads.
    pub fn primary_queue(&self) -> Option<&str> {
        self.queues.first().map(String::as_str)
    }
}

/// Declares topologies over an injected channel.
pub struct TopologyManager {
    channel: Arc<dyn BrokerChannel>,
}

impl TopologyManager {
    pub fn new(channel: Arc<dyn BrokerChannel>) -> Self {
        Self { channel }
    }

    /// Ensure the exchange, queues and bindings exist as described.
    #[instrument(skip(self, spec), fields(exchange = %spec.exchange.name))]
    pub async fn declare(&self, spec: &TopologySpec) -> Result<DeclaredTopology, MessagingError> {
        self.channel.declare_exchange(&spec.exchange).await?;

        let mut queues = Vec::with_capacity(spec.queues.len());
        for queue in &spec.queues {
            let name = self.channel.declare_queue(&queue.options()).await?;
            self.channel
                .bind_queue(&name, &spec.exchange.name, &queue.binding_key)
                .await?;
            debug!(queue = %name, binding_key = %queue.binding_key, "Queue bound");
            queues.push(name);
        }

        if let Some(dead_letter) = &spec.dead_letter {
            self.channel
                .declare_exchange(&ExchangeSpec::durable(
                    &dead_letter.exchange,
                    ExchangeKind::Direct,
                ))
                .await?;
            let name = self
                .channel
                .declare_queue(&QueueOptions {
                    name: dead_letter.queue.clone(),
                    durable: true,
                    exclusive: false,
                })
                .await?;
            self.channel
                .bind_queue(&name, &dead_letter.exchange, &dead_letter.routing_key)
                .await?;
        }

        info!(
            exchange = %spec.exchange.name,
            kind = %spec.exchange.kind,
            queues = ?queues,
            dead_letter = spec.dead_letter.as_ref().map(|d| d.queue.as_str()),
            "Topology declared"
        );

        Ok(DeclaredTopology {
            exchange: spec.exchange.name.clone(),
            queues,
            dead_letter: spec.dead_letter.clone(),
        })
    }
}
