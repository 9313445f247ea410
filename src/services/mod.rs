//! Per-role service wiring.
//!
//! Every role connects to the broker, and the order and dispatch roles also
//! connect to the backing store. Each connection has its own supervisor and
//! attempt counter. The store connects in the background: the role declares
//! its topology and starts consuming as soon as the broker is up, and store
//! operations fail transiently until the store arrives. Consuming roles run a
//! consume loop that reconnects and re-declares whenever the broker drops;
//! the order role runs a watchdog that does the same for its publisher.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::api::{self, handlers::AppState};
use crate::handlers::{DispatchHandler, DroneHandler, EventHandler, NotificationHandler};
use crate::messaging::{
    AmqpConnector, BrokerChannel, ChannelConnector, ConnectionSupervisor, Connector,
    ConsumerSettings, ConsumerStats, DeadLetterSpec, EventConsumer, EventPublisher,
    InMemoryBroker, ManagedChannel, MessagingError, QueueSpec, TopologySpec, DISPATCH_QUEUE,
    ORDER_EVENTS_EXCHANGE,
};
use crate::orders::OrderPlacement;
use crate::store::{DeferredStore, MemoryStore, PgConnector, StoreHandle};
use crate::types::{OrderCreatedEvent, ServiceConfig, ServiceRole};

/// URL scheme selecting the in-process broker or store.
pub const MEMORY_URL_SCHEME: &str = "memory://";

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error("HTTP server error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{role} service requires a backing store")]
    StoreRequired { role: ServiceRole },

    #[error("Background task ended abnormally: {0}")]
    Task(String),
}

/// Broker the service connects to.
#[derive(Clone)]
pub enum BrokerConnector {
    Amqp(AmqpConnector),
    Memory(InMemoryBroker),
}

impl BrokerConnector {
    pub fn from_url(url: &str) -> Self {
        if url.starts_with(MEMORY_URL_SCHEME) {
            BrokerConnector::Memory(InMemoryBroker::new())
        } else {
            BrokerConnector::Amqp(AmqpConnector::new(url))
        }
    }
}

#[async_trait]
impl Connector for BrokerConnector {
    type Connection = Arc<dyn BrokerChannel>;

    fn target(&self) -> String {
        match self {
            BrokerConnector::Amqp(connector) => connector.target(),
            BrokerConnector::Memory(broker) => Connector::target(broker),
        }
    }

    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
        let channel: Arc<dyn BrokerChannel> = match self {
            BrokerConnector::Amqp(connector) => Arc::new(Connector::connect(connector).await?),
            BrokerConnector::Memory(broker) => Arc::new(broker.connect()?),
        };
        Ok(channel)
    }
}

/// Backing store the service connects to.
#[derive(Clone)]
pub enum StoreConnector {
    Postgres(PgConnector),
    Memory(MemoryStore),
}

impl StoreConnector {
    pub fn from_url(url: &str, max_connections: u32) -> Self {
        if url.starts_with(MEMORY_URL_SCHEME) {
            StoreConnector::Memory(MemoryStore::new())
        } else {
            StoreConnector::Postgres(PgConnector::new(url, max_connections))
        }
    }
}

#[async_trait]
impl Connector for StoreConnector {
    type Connection = StoreHandle;

    fn target(&self) -> String {
        match self {
            StoreConnector::Postgres(connector) => connector.target(),
            StoreConnector::Memory(store) => Connector::target(store),
        }
    }

    async fn connect(&self) -> Result<StoreHandle, MessagingError> {
        match self {
            StoreConnector::Postgres(connector) => {
                let store = connector.connect().await?;
                store
                    .ensure_schema()
                    .await
                    .map_err(|e| MessagingError::connection(self.target(), e.to_string()))?;
                let store = Arc::new(store);
                Ok(StoreHandle {
                    dispatches: store.clone(),
                    orders: store,
                })
            }
            StoreConnector::Memory(store) => {
                let store = Arc::new(Connector::connect(store).await?);
                Ok(StoreHandle {
                    dispatches: store.clone(),
                    orders: store,
                })
            }
        }
    }
}

/// Exchange, queues and dead-letter routing a role declares.
pub fn topology_for(role: ServiceRole) -> TopologySpec {
    let exchange = TopologySpec::fanout(ORDER_EVENTS_EXCHANGE);
    match role {
        ServiceRole::Order => exchange,
        ServiceRole::Dispatch | ServiceRole::Drone => exchange
            .with_queue(QueueSpec::durable(DISPATCH_QUEUE))
            .with_dead_letter(DeadLetterSpec::for_consumer(role.as_str())),
        ServiceRole::Notification => exchange
            .with_queue(QueueSpec::exclusive())
            .with_dead_letter(DeadLetterSpec::for_consumer(role.as_str())),
    }
}

/// A role before its connections are established.
pub struct Service {
    config: ServiceConfig,
    broker: BrokerConnector,
    store: Option<StoreConnector>,
}

impl Service {
    /// Connectors chosen from the configured URLs.
    pub fn new(config: ServiceConfig) -> Self {
        let broker = BrokerConnector::from_url(&config.rabbitmq_url);
        let store = config
            .role
            .uses_store()
            .then(|| StoreConnector::from_url(&config.database_url, config.db_max_connections));
        Self::with_connectors(config, broker, store)
    }

    pub fn with_connectors(
        config: ServiceConfig,
        broker: BrokerConnector,
        store: Option<StoreConnector>,
    ) -> Self {
        Self {
            config,
            broker,
            store,
        }
    }

    /// Connect to the broker, declare the role's topology and start
    /// consuming. The store keeps connecting in the background.
    pub async fn start(self) -> Result<RunningService, ServiceError> {
        let role = self.config.role;
        let mut tasks = JoinSet::new();

        let store = DeferredStore::new();
        let store_status = match &self.store {
            Some(connector) => {
                let supervisor = ConnectionSupervisor::new(self.config.connect.clone());
                let status = supervisor.status();
                tasks.spawn(connect_store(supervisor, connector.clone(), store.clone()));
                Some(status)
            }
            None if role.uses_store() => return Err(ServiceError::StoreRequired { role }),
            None => None,
        };

        let broker_supervisor = Arc::new(ConnectionSupervisor::new(self.config.connect.clone()));
        let connector: Arc<ChannelConnector> = Arc::new(self.broker.clone());
        let channel = Arc::new(
            ManagedChannel::connect(connector, Arc::clone(&broker_supervisor), topology_for(role))
                .await?,
        );

        let mut placement = None;
        let mut consumer_stats = None;
        if role == ServiceRole::Order {
            let publisher: Arc<dyn BrokerChannel> = channel.clone();
            placement = Some(OrderPlacement::new(
                Arc::new(store.clone()),
                EventPublisher::new(publisher, ORDER_EVENTS_EXCHANGE),
                self.config.publish_failure_policy,
            ));
            tasks.spawn(watch_channel(Arc::clone(&channel)));
            info!(role = %role, "{} Service ready to publish orders", capitalize(role.as_str()));
        } else {
            let stats = Arc::new(ConsumerStats::default());
            let settings = self.config.consumer.clone();
            let channel = Arc::clone(&channel);
            let loop_stats = Arc::clone(&stats);
            match role {
                ServiceRole::Dispatch => {
                    let handler = Arc::new(DispatchHandler::new(Arc::new(store.clone())));
                    tasks.spawn(consume_loop(handler, channel, settings, loop_stats));
                }
                ServiceRole::Drone => {
                    tasks.spawn(consume_loop(Arc::new(DroneHandler), channel, settings, loop_stats));
                }
                _ => {
                    tasks.spawn(consume_loop(
                        Arc::new(NotificationHandler),
                        channel,
                        settings,
                        loop_stats,
                    ));
                }
            }
            consumer_stats = Some(stats);
            info!(role = %role, "{} Service listening for orders...", capitalize(role.as_str()));
        }

        let state = Arc::new(AppState {
            role,
            broker: broker_supervisor.status(),
            store: store_status,
            placement,
            consumer_stats,
        });

        Ok(RunningService {
            port: self.config.port,
            state,
            tasks,
        })
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// A role with live connections.
pub struct RunningService {
    port: u16,
    state: Arc<AppState>,
    tasks: JoinSet<Result<(), ServiceError>>,
}

impl RunningService {
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Stop consuming and reconnecting without serving HTTP.
    pub fn abort(&mut self) {
        self.tasks.abort_all();
    }

    /// Serve HTTP until a background task fails fatally or the process is
    /// interrupted.
    pub async fn serve(self) -> Result<(), ServiceError> {
        let RunningService { port, state, tasks } = self;
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Listening on http://{}", addr);

        let server = axum::serve(listener, api::router(state)).into_future();

        tokio::select! {
            result = server => result?,
            result = watch_tasks(tasks) => result?,
            _ = tokio::signal::ctrl_c() => info!("Shutdown requested"),
        }
        Ok(())
    }
}

/// Resolves with the first task failure. Tasks that finish cleanly, such as
/// a connected store, are dropped from the set; an empty set never resolves.
async fn watch_tasks(mut tasks: JoinSet<Result<(), ServiceError>>) -> Result<(), ServiceError> {
    while let Some(joined) = tasks.join_next().await {
        joined.map_err(|e| ServiceError::Task(e.to_string()))??;
    }
    std::future::pending().await
}

/// Full role start-up: connect, declare, consume and serve.
pub async fn run(config: ServiceConfig) -> Result<(), ServiceError> {
    info!(
        role = %config.role,
        port = config.port,
        max_attempts = config.connect.max_attempts,
        "Starting {} service v{}",
        config.role,
        env!("CARGO_PKG_VERSION")
    );
    Service::new(config).start().await?.serve().await
}

async fn connect_store(
    supervisor: ConnectionSupervisor,
    connector: StoreConnector,
    store: DeferredStore,
) -> Result<(), ServiceError> {
    match supervisor.connect(&connector).await {
        Ok(handle) => {
            store.fill(handle);
            info!(endpoint = %connector.target(), "Backing store ready");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Store connection exhausted");
            Err(e.into())
        }
    }
}

/// Replace the publisher's channel when it dies between publishes.
async fn watch_channel(channel: Arc<ManagedChannel>) -> Result<(), ServiceError> {
    let interval = channel.supervisor().policy().backoff.delay_for(1);
    loop {
        tokio::time::sleep(interval).await;
        let current = channel.current().await;
        if current.is_connected() {
            continue;
        }

        warn!("Broker channel lost, reconnecting");
        match channel.reconnect(&current).await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Broker reconnection exhausted");
                return Err(e.into());
            }
            Err(e) => warn!(error = %e, "Broker reconnect failed, will retry"),
        }
    }
}

/// Consume until a fatal error, reconnecting whenever the stream ends.
async fn consume_loop<H>(
    handler: Arc<H>,
    channel: Arc<ManagedChannel>,
    settings: ConsumerSettings,
    stats: Arc<ConsumerStats>,
) -> Result<(), ServiceError>
where
    H: EventHandler<Event = OrderCreatedEvent> + 'static,
{
    let pause = channel.supervisor().policy().backoff.delay_for(1);
    loop {
        let (current, queue) = channel.consume_target().await;
        match queue {
            Some(queue) => {
                let mut consumer = EventConsumer::new(
                    Arc::clone(&current),
                    queue.clone(),
                    Arc::clone(&handler),
                    settings.clone(),
                )
                .with_stats(Arc::clone(&stats));
                if let Some(dead_letter) = &channel.topology().dead_letter {
                    consumer = consumer.with_dead_letter(dead_letter.clone());
                }

                match consumer.run().await {
                    Ok(_) => warn!(queue = %queue, "Delivery stream ended, reconnecting to broker"),
                    Err(e) if e.is_fatal() => return Err(e.into()),
                    Err(e) => {
                        warn!(queue = %queue, error = %e, "Consumer failed, reconnecting to broker")
                    }
                }
            }
            None => warn!("No consumer queue declared, reconnecting to broker"),
        }

        tokio::time::sleep(pause).await;
        match channel.reconnect(&current).await {
            Ok(_) => info!("Consumer resuming after reconnect"),
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Broker reconnection exhausted");
                return Err(e.into());
            }
            Err(e) => warn!(error = %e, "Broker reconnect failed, will retry"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::{
        ConnectionState, OutgoingMessage, DEAD_LETTER_EXCHANGE,
    };
    use crate::store::DispatchStore;
    use crate::types::{DispatchStatus, NewOrder};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn config_with(role: &str, vars: &[(&str, &str)]) -> ServiceConfig {
        ServiceConfig::from_lookup(Some(role), |key| {
            if let Some((_, value)) = vars.iter().find(|(k, _)| *k == key) {
                return Some(value.to_string());
            }
            match key {
                "CONNECT_BACKOFF_MS" => Some("10".to_string()),
                "HANDLER_ATTEMPTS" => Some("1".to_string()),
                _ => None,
            }
        })
        .unwrap()
    }

    fn config(role: &str) -> ServiceConfig {
        config_with(role, &[])
    }

    fn service(config: ServiceConfig, broker: &InMemoryBroker, store: &MemoryStore) -> Service {
        let store = config
            .role
            .uses_store()
            .then(|| StoreConnector::Memory(store.clone()));
        Service::with_connectors(config, BrokerConnector::Memory(broker.clone()), store)
    }

    async fn start(role: &str, broker: &InMemoryBroker, store: &MemoryStore) -> RunningService {
        service(config(role), broker, store).start().await.unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    fn acked(service: &RunningService) -> u64 {
        service
            .state()
            .consumer_stats
            .as_ref()
            .map_or(0, |stats| stats.snapshot().acked)
    }

    async fn publish_order(broker: &InMemoryBroker, body: &[u8]) {
        broker
            .connect()
            .unwrap()
            .publish(ORDER_EVENTS_EXCHANGE, "", OutgoingMessage::json(body.to_vec()))
            .await
            .unwrap();
    }

    fn new_order() -> NewOrder {
        NewOrder {
            user_id: 7,
            restaurant_id: 3,
            total_amount: 19.99,
        }
    }

    #[test]
    fn test_role_topologies() {
        assert!(topology_for(ServiceRole::Order).queues.is_empty());
        assert_eq!(
            topology_for(ServiceRole::Drone).dead_letter,
            Some(DeadLetterSpec::for_consumer("drone"))
        );
        let notification = topology_for(ServiceRole::Notification);
        assert!(notification.queues[0].exclusive);
        assert_eq!(notification.queues[0].binding_key, "");
    }

    #[tokio::test]
    async fn test_order_event_reaches_dispatch_and_notification() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new();
        let mut dispatch = start("dispatch", &broker, &store).await;
        let mut notification = start("notification", &broker, &store).await;
        wait_until(|| dispatch.state().store.as_ref().unwrap().get() == ConnectionState::Connected)
            .await;

        publish_order(
            &broker,
            br#"{"orderId": 42, "userId": 7, "restaurantId": 3, "totalAmount": 19.99}"#,
        )
        .await;

        wait_until(|| acked(&dispatch) == 1 && acked(&notification) == 1).await;

        let records = store.find_by_order(42).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, DispatchStatus::Assigned);
        assert!(records[0].dispatch_id > 0);
        assert_eq!(store.dispatches().len(), 1);
        assert!(store.orders().is_empty());

        dispatch.abort();
        notification.abort();
    }

    #[tokio::test]
    async fn test_order_service_places_and_dispatch_consumes() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new();
        let order = start("order", &broker, &store).await;
        let mut dispatch = start("dispatch", &broker, &store).await;
        wait_until(|| order.state().store.as_ref().unwrap().get() == ConnectionState::Connected)
            .await;

        let state = order.state();
        let placed = state
            .placement
            .as_ref()
            .unwrap()
            .place_order(&new_order())
            .await
            .unwrap();
        assert!(placed.event_published);

        wait_until(|| acked(&dispatch) == 1).await;
        let records = store.find_by_order(placed.order.order_id).await.unwrap();
        assert_eq!(records.len(), 1);
        dispatch.abort();
    }

    #[tokio::test]
    async fn test_dispatch_consumes_while_store_is_down() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new();
        store.set_available(false);
        let config = config_with(
            "dispatch",
            &[
                ("CONNECT_MAX_ATTEMPTS", "1000"),
                ("HANDLER_ATTEMPTS", "2"),
                ("MAX_REDELIVERIES", "100"),
            ],
        );
        let mut dispatch = service(config, &broker, &store).start().await.unwrap();

        assert!(broker.queue_names().contains(&DISPATCH_QUEUE.to_string()));
        assert_eq!(broker.binding_count(ORDER_EVENTS_EXCHANGE), 1);
        wait_until(|| broker.consumer_count(DISPATCH_QUEUE) == 1).await;
        let store_state = dispatch.state().store.clone().unwrap();
        assert_ne!(store_state.get(), ConnectionState::Connected);

        publish_order(&broker, br#"{"orderId": 11}"#).await;
        let stats = dispatch.state().consumer_stats.clone().unwrap();
        wait_until(|| stats.snapshot().handler_failed >= 1).await;
        assert_eq!(stats.snapshot().dead_lettered, 0);
        assert!(store.dispatches().is_empty());

        store.set_available(true);
        wait_until(|| store_state.get() == ConnectionState::Connected).await;
        wait_until(|| store.dispatches().len() == 1).await;
        assert_eq!(store.dispatches()[0].order_id, 11);
        dispatch.abort();
    }

    #[tokio::test]
    async fn test_store_exhaustion_stops_the_service() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new();
        store.set_available(false);
        let config = config_with("dispatch", &[("CONNECT_MAX_ATTEMPTS", "2"), ("PORT", "0")]);

        let running = service(config, &broker, &store).start().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), running.serve())
            .await
            .unwrap();

        match result {
            Err(ServiceError::Messaging(e)) => assert!(e.is_fatal()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_order_publishes_after_broker_restart() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new();
        let mut dispatch = start("dispatch", &broker, &store).await;
        let mut order = start("order", &broker, &store).await;
        wait_until(|| order.state().store.as_ref().unwrap().get() == ConnectionState::Connected)
            .await;

        broker.restart();

        let state = order.state();
        let placed = state
            .placement
            .as_ref()
            .unwrap()
            .place_order(&new_order())
            .await
            .unwrap();
        assert!(placed.event_published);
        assert_eq!(state.broker.get(), ConnectionState::Connected);

        wait_until(|| acked(&dispatch) == 1).await;
        order.abort();
        dispatch.abort();
    }

    #[tokio::test]
    async fn test_order_channel_is_restored_without_traffic() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new();
        let mut order = start("order", &broker, &store).await;
        assert_eq!(broker.connection_count(), 1);

        broker.restart();
        assert_eq!(broker.connection_count(), 0);

        wait_until(|| broker.connection_count() == 1).await;
        wait_until(|| order.state().broker.get() == ConnectionState::Connected).await;
        order.abort();
    }

    #[tokio::test]
    async fn test_consumer_reconnects_after_broker_restart() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new();
        let mut notification = start("notification", &broker, &store).await;
        assert_eq!(notification.state().broker.get(), ConnectionState::Connected);

        broker.restart();
        // the exclusive queue is gone until the consumer re-declares it
        wait_until(|| broker.binding_count(ORDER_EVENTS_EXCHANGE) == 1).await;
        wait_until(|| notification.state().broker.get() == ConnectionState::Connected).await;

        publish_order(&broker, br#"{"orderId": 9}"#).await;

        wait_until(|| acked(&notification) == 1).await;
        assert!(broker.exchange_names().contains(&DEAD_LETTER_EXCHANGE.to_string()));
        notification.abort();
    }

    #[tokio::test]
    async fn test_consumer_survives_back_to_back_restarts() {
        let broker = InMemoryBroker::new();
        let store = MemoryStore::new();
        let mut notification = start("notification", &broker, &store).await;

        for _ in 0..2 {
            broker.restart();
            wait_until(|| broker.binding_count(ORDER_EVENTS_EXCHANGE) == 1).await;
        }

        publish_order(&broker, br#"{"orderId": 3}"#).await;
        wait_until(|| acked(&notification) == 1).await;
        notification.abort();
    }

    /// Hands out a channel that is already closed on the second connect.
    struct FlappingConnector {
        broker: InMemoryBroker,
        connects: AtomicU32,
    }

    #[async_trait]
    impl Connector for FlappingConnector {
        type Connection = Arc<dyn BrokerChannel>;

        fn target(&self) -> String {
            "memory://flapping".to_string()
        }

        async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, MessagingError> {
            let channel = self.broker.connect()?;
            if self.connects.fetch_add(1, Ordering::SeqCst) == 1 {
                channel.close().await?;
            }
            let channel: Arc<dyn BrokerChannel> = Arc::new(channel);
            Ok(channel)
        }
    }

    #[tokio::test]
    async fn test_failed_redeclare_does_not_end_consume_loop() {
        let broker = InMemoryBroker::new();
        let connector = Arc::new(FlappingConnector {
            broker: broker.clone(),
            connects: AtomicU32::new(0),
        });
        let config = config("notification");
        let supervisor = Arc::new(ConnectionSupervisor::new(config.connect.clone()));
        let channel = Arc::new(
            ManagedChannel::connect(
                connector.clone(),
                supervisor,
                topology_for(ServiceRole::Notification),
            )
            .await
            .unwrap(),
        );
        let stats = Arc::new(ConsumerStats::default());
        let task = tokio::spawn(consume_loop(
            Arc::new(NotificationHandler),
            Arc::clone(&channel),
            config.consumer.clone(),
            Arc::clone(&stats),
        ));

        broker.restart();
        wait_until(|| connector.connects.load(Ordering::SeqCst) >= 3).await;
        wait_until(|| broker.binding_count(ORDER_EVENTS_EXCHANGE) == 1).await;
        assert!(!task.is_finished());

        publish_order(&broker, br#"{"orderId": 8}"#).await;
        wait_until(|| stats.snapshot().acked == 1).await;
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_broker_is_fatal() {
        let broker = InMemoryBroker::new();
        broker.set_available(false);

        let result = Service::with_connectors(
            config("drone"),
            BrokerConnector::Memory(broker),
            None,
        )
        .start()
        .await;

        match result {
            Err(ServiceError::Messaging(e)) => assert!(e.is_fatal()),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("service started without a broker"),
        }
    }
}
