//! # Order Events Messaging
//!
//! Broker plumbing shared by every service role.
//!
//! ## Features
//! - Broker channel seam with RabbitMQ (lapin) and in-process implementations
//! - Idempotent topology declaration, including dead-letter routing
//! - Connection supervision with bounded retry and pluggable backoff
//! - Channels that reconnect and re-declare their topology when the broker
//!   drops them
//! - JSON event publishing and at-least-once consumption with retry and
//!   dead-lettering

pub mod amqp;
pub mod broker;
pub mod consumer;
pub mod errors;
pub mod managed;
pub mod memory;
pub mod publisher;
pub mod supervisor;
pub mod topology;

pub use amqp::{AmqpChannel, AmqpConnector};
pub use broker::{BrokerChannel, Delivery, ExchangeKind, ExchangeSpec, OutgoingMessage};
pub use consumer::{
    ConsumerSettings, ConsumerStats, ConsumerStatsSnapshot, Disposition, EventConsumer,
    MessageState,
};
pub use errors::MessagingError;
pub use managed::{ChannelConnector, ManagedChannel};
pub use memory::InMemoryBroker;
pub use publisher::EventPublisher;
pub use supervisor::{
    BackoffStrategy, ConnectionState, ConnectionStatus, ConnectionSupervisor, Connector,
    RetryPolicy,
};
pub use topology::{
    DeadLetterSpec, DeclaredTopology, QueueSpec, TopologyManager, TopologySpec,
    DEAD_LETTER_EXCHANGE, DISPATCH_QUEUE, ORDER_EVENTS_EXCHANGE,
};
