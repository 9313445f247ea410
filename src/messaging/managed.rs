//! Supervised, replaceable broker channel.
//!
//! [`ManagedChannel`] owns the live channel of one service instance together
//! with the topology declared on it. When the channel dies it is replaced
//! through the [`ConnectionSupervisor`], the topology is declared again on
//! the new channel, and callers holding the `ManagedChannel` carry on with
//! it. Publishes that fail because the channel died are retried once on the
//! replacement.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::broker::{BrokerChannel, DeliveryStream, ExchangeSpec, OutgoingMessage, QueueOptions};
use super::errors::MessagingError;
use super::supervisor::{ConnectionSupervisor, Connector};
use super::topology::{DeclaredTopology, TopologyManager, TopologySpec};

/// Anything that opens broker channels.
pub type ChannelConnector = dyn Connector<Connection = Arc<dyn BrokerChannel>>;

struct Session {
    channel: Arc<dyn BrokerChannel>,
    declared: DeclaredTopology,
}

pub struct ManagedChannel {
    session: RwLock<Session>,
    reconnecting: Mutex<()>,
    connector: Arc<ChannelConnector>,
    supervisor: Arc<ConnectionSupervisor>,
    topology: TopologySpec,
}

impl ManagedChannel {
    /// Connect through the supervisor and declare `topology`.
    pub async fn connect(
        connector: Arc<ChannelConnector>,
        supervisor: Arc<ConnectionSupervisor>,
        topology: TopologySpec,
    ) -> Result<Self, MessagingError> {
        let channel = supervisor.connect(connector.as_ref()).await?;
        let declared = TopologyManager::new(Arc::clone(&channel))
            .declare(&topology)
            .await?;

        Ok(Self {
            session: RwLock::new(Session { channel, declared }),
            reconnecting: Mutex::new(()),
            connector,
            supervisor,
            topology,
        })
    }

    pub fn topology(&self) -> &TopologySpec {
        &self.topology
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    /// The channel in use right now.
    pub async fn current(&self) -> Arc<dyn BrokerChannel> {
        Arc::clone(&self.session.read().await.channel)
    }

    /// Queue the role consumes from on the current channel. Anonymous queues
    /// get a new name after every reconnect.
    pub async fn primary_queue(&self) -> Option<String> {
        self.consume_target().await.1
    }

    /// The current channel together with the queue declared on it.
    pub async fn consume_target(&self) -> (Arc<dyn BrokerChannel>, Option<String>) {
        let session = self.session.read().await;
        (
            Arc::clone(&session.channel),
            session.declared.primary_queue().map(str::to_string),
        )
    }

    /// Replace `failed` with a fresh channel and declare the topology on it.
    ///
    /// Concurrent callers reporting the same dead channel share one
    /// reconnect; a caller whose channel was already replaced gets the
    /// replacement. Connection exhaustion and topology conflicts are fatal,
    /// any other error leaves the dead channel in place for the next call.
    pub async fn reconnect(
        &self,
        failed: &Arc<dyn BrokerChannel>,
    ) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        let _guard = self.reconnecting.lock().await;
        {
            let session = self.session.read().await;
            if !std::ptr::addr_eq(Arc::as_ptr(&session.channel), Arc::as_ptr(failed)) {
                return Ok(Arc::clone(&session.channel));
            }
        }

        self.supervisor.mark_disconnected();
        if let Err(e) = failed.close().await {
            debug!(error = %e, "Closing dead channel failed");
        }

        let channel = self.supervisor.connect(self.connector.as_ref()).await?;
        let declared = match TopologyManager::new(Arc::clone(&channel))
            .declare(&self.topology)
            .await
        {
            Ok(declared) => declared,
            Err(e) => {
                self.supervisor.mark_disconnected();
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Closing half-open channel failed");
                }
                return Err(e);
            }
        };

        info!(
            exchange = %self.topology.exchange.name,
            queues = ?declared.queues,
            "Broker channel re-established"
        );
        let mut session = self.session.write().await;
        session.channel = Arc::clone(&channel);
        session.declared = declared;
        Ok(channel)
    }
}

#[async_trait]
impl BrokerChannel for ManagedChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), MessagingError> {
        self.current().await.declare_exchange(spec).await
    }

    async fn declare_queue(&self, options: &QueueOptions) -> Result<String, MessagingError> {
        self.current().await.declare_queue(options).await
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.current()
            .await
            .bind_queue(queue, exchange, routing_key)
            .await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<(), MessagingError> {
        let channel = self.current().await;
        match channel.publish(exchange, routing_key, message.clone()).await {
            Ok(()) => Ok(()),
            Err(e) if channel.is_connected() => Err(e),
            Err(e) => {
                warn!(exchange, error = %e, "Publish hit a dead channel, reconnecting");
                let channel = self.reconnect(&channel).await?;
                channel.publish(exchange, routing_key, message).await
            }
        }
    }

    async fn set_prefetch(&self, count: u16) -> Result<(), MessagingError> {
        self.current().await.set_prefetch(count).await
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, MessagingError> {
        self.current().await.consume(queue, consumer_tag).await
    }

    /// `false` while a reconnect holds the session.
    fn is_connected(&self) -> bool {
        self.session
            .try_read()
            .map_or(false, |session| session.channel.is_connected())
    }

    async fn close(&self) -> Result<(), MessagingError> {
        self.supervisor.mark_disconnected();
        self.current().await.close().await
    }
}
