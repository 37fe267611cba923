use crate::helpers::{endpoint, eventually, FakeChannel, FakeDelivery, InMemoryBroker};
use amqp_tools::amqp::options::QueueBindOptions;
use amqp_tools::amqp::transport::{BrokerChannel, DeliveryStream};
use amqp_tools::amqp::{BrokerEndpoint, ExchangeKind};
use amqp_tools::consumers::hooks::{
    BindingSetup, ConsumeSetup, ExistingExchange, QueueSetup, Topology,
};
use amqp_tools::consumers::{Consumer, ConnectionManager, HandlerError, Incoming, SessionPhase};
use futures_util::StreamExt;
use shutdown_handler::ShutdownHandler;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn the_default_topology_declares_durable_resources_and_consumes_with_manual_acks() {
    // Arrange
    let broker = InMemoryBroker::new();
    let endpoint = endpoint();
    let manager = ConnectionManager::new(broker.clone(), endpoint.clone(), Topology::default());

    // Act
    let (session, _deliveries) = manager.establish().await.unwrap();

    // Assert
    let exchanges = broker.exchange_declarations();
    assert_eq!(exchanges.len(), 1);
    assert_eq!(exchanges[0].exchange, endpoint.exchange);
    assert!(matches!(exchanges[0].kind, ExchangeKind::Topic));
    assert!(exchanges[0].options.durable);
    assert!(!exchanges[0].options.auto_delete);
    assert!(!exchanges[0].options.internal);

    let queues = broker.queue_declarations();
    assert_eq!(queues.len(), 1);
    assert_eq!(queues[0].0, endpoint.queue);
    assert!(queues[0].1.durable);
    assert!(!queues[0].1.exclusive);
    assert!(!queues[0].1.auto_delete);

    let bindings = broker.bindings();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].queue, endpoint.queue);
    assert_eq!(bindings[0].exchange, endpoint.exchange);
    assert_eq!(bindings[0].routing_key, endpoint.routing_key);

    let consumes = broker.consumes();
    assert_eq!(consumes.len(), 1);
    assert!(!consumes[0].options.no_ack);
    assert!(!consumes[0].options.exclusive);
    assert_eq!(consumes[0].consumer_tag, session.consumer_tag());
}

#[tokio::test]
async fn an_empty_consumer_tag_is_generated_and_a_configured_one_is_kept() {
    // Arrange
    let broker = InMemoryBroker::new();
    let generated = ConnectionManager::new(broker.clone(), endpoint(), Topology::default());
    let configured = ConnectionManager::new(
        broker.clone(),
        BrokerEndpoint {
            consumer_tag: "billing-consumer".into(),
            ..endpoint()
        },
        Topology::default(),
    );

    // Act
    let (first, _) = generated.establish().await.unwrap();
    let (second, _) = generated.establish().await.unwrap();
    let (third, _) = configured.establish().await.unwrap();

    // Assert
    assert!(first.consumer_tag().starts_with("amqp-tools-"));
    assert_ne!(first.consumer_tag(), second.consumer_tag());
    assert_eq!(third.consumer_tag(), "billing-consumer");
}

#[derive(Clone, Default)]
struct CountingQueueSetup {
    counter: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl QueueSetup<FakeChannel> for CountingQueueSetup {
    async fn setup_queue(
        &self,
        _channel: &FakeChannel,
        _endpoint: &BrokerEndpoint,
    ) -> Result<(), anyhow::Error> {
        self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn overridden_steps_replace_the_defaults() {
    // Arrange
    let broker = InMemoryBroker::new();
    let queue_setup = CountingQueueSetup::default();
    let topology = Topology::<FakeChannel>::default()
        .with_exchange_setup(ExistingExchange)
        .with_queue_setup(queue_setup.clone());
    let manager = ConnectionManager::new(broker.clone(), endpoint(), topology);

    // Act
    let _ = manager.establish().await.unwrap();

    // Assert
    assert!(broker.exchange_declarations().is_empty());
    assert!(broker.queue_declarations().is_empty());
    assert_eq!(queue_setup.counter.load(Ordering::SeqCst), 1);
    // Steps that were not overridden keep their default behaviour
    assert_eq!(broker.bindings().len(), 1);
    assert_eq!(broker.consumes().len(), 1);
}

#[tokio::test]
async fn a_failed_declaration_closes_the_connection_and_reports_the_phase() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_queue_declares(1);
    let manager = ConnectionManager::new(broker.clone(), endpoint(), Topology::default());

    // Act
    let error = manager.establish().await.err().unwrap();

    // Assert
    assert_eq!(error.phase, SessionPhase::Queue);
    assert_eq!(broker.open_connections(), 0);
    assert!(!broker.has_consumer());
}

#[tokio::test]
async fn a_refused_connection_is_reported_as_a_dial_failure() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_connects(1);
    let manager = ConnectionManager::new(broker.clone(), endpoint(), Topology::default());

    // Act
    let error = manager.establish().await.err().unwrap();

    // Assert
    assert_eq!(error.phase, SessionPhase::Dial);
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
async fn a_refused_channel_closes_the_connection_and_reports_the_phase() {
    // Arrange
    let broker = InMemoryBroker::new();
    broker.fail_next_channels(1);
    let manager = ConnectionManager::new(broker.clone(), endpoint(), Topology::default());

    // Act
    let error = manager.establish().await.err().unwrap();

    // Assert
    assert_eq!(error.phase, SessionPhase::Channel);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.closed_connections(), 1);
    assert!(broker.exchange_declarations().is_empty());
}

/// Binds with a fixed routing key instead of the endpoint's.
struct FixedRoutingKey;

#[async_trait::async_trait]
impl BindingSetup<FakeChannel> for FixedRoutingKey {
    async fn bind(
        &self,
        channel: &FakeChannel,
        endpoint: &BrokerEndpoint,
    ) -> Result<(), anyhow::Error> {
        channel
            .queue_bind(
                &endpoint.queue,
                &endpoint.exchange,
                "audit.#",
                QueueBindOptions::default(),
            )
            .await
    }
}

struct RefusedBinding;

#[async_trait::async_trait]
impl BindingSetup<FakeChannel> for RefusedBinding {
    async fn bind(
        &self,
        _channel: &FakeChannel,
        _endpoint: &BrokerEndpoint,
    ) -> Result<(), anyhow::Error> {
        anyhow::bail!("ACCESS_REFUSED - access to exchange denied")
    }
}

#[tokio::test]
async fn the_binding_step_can_be_overridden() {
    // Arrange
    let broker = InMemoryBroker::new();
    let topology = Topology::<FakeChannel>::default().with_binding_setup(FixedRoutingKey);
    let manager = ConnectionManager::new(broker.clone(), endpoint(), topology);

    // Act
    let _ = manager.establish().await.unwrap();

    // Assert
    let bindings = broker.bindings();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].routing_key, "audit.#");
    assert_eq!(broker.consumes().len(), 1);
}

#[tokio::test]
async fn a_failed_binding_closes_the_connection_and_reports_the_phase() {
    // Arrange
    let broker = InMemoryBroker::new();
    let topology = Topology::<FakeChannel>::default().with_binding_setup(RefusedBinding);
    let manager = ConnectionManager::new(broker.clone(), endpoint(), topology);

    // Act
    let error = manager.establish().await.err().unwrap();

    // Assert
    assert_eq!(error.phase, SessionPhase::Bind);
    assert_eq!(broker.open_connections(), 0);
    assert!(broker.consumes().is_empty());
    assert!(!broker.has_consumer());
}

struct RefusedConsume;

#[async_trait::async_trait]
impl ConsumeSetup<FakeChannel> for RefusedConsume {
    async fn consume(
        &self,
        _channel: &FakeChannel,
        _endpoint: &BrokerEndpoint,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream<FakeDelivery>, anyhow::Error> {
        anyhow::bail!("RESOURCE_LOCKED - queue in exclusive use")
    }
}

#[tokio::test]
async fn a_failed_consume_closes_the_connection_and_reports_the_phase() {
    // Arrange
    let broker = InMemoryBroker::new();
    let topology = Topology::<FakeChannel>::default().with_consume_setup(RefusedConsume);
    let manager = ConnectionManager::new(broker.clone(), endpoint(), topology);

    // Act
    let error = manager.establish().await.err().unwrap();

    // Assert
    assert_eq!(error.phase, SessionPhase::Consume);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(broker.closed_connections(), 1);
    assert_eq!(broker.bindings().len(), 1);
}

/// Hands out a fixed set of deliveries instead of consuming from the queue.
struct ScriptedConsume {
    broker: InMemoryBroker,
    bodies: Vec<&'static str>,
}

#[async_trait::async_trait]
impl ConsumeSetup<FakeChannel> for ScriptedConsume {
    async fn consume(
        &self,
        _channel: &FakeChannel,
        _endpoint: &BrokerEndpoint,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream<FakeDelivery>, anyhow::Error> {
        let deliveries: Vec<_> = self
            .bodies
            .iter()
            .map(|body| Ok(self.broker.delivery(*body)))
            .collect();
        // Keep the stream open, as a live consumer would
        Ok(futures_util::stream::iter(deliveries)
            .chain(futures_util::stream::pending())
            .boxed())
    }
}

async fn ping_handler(incoming: Incoming<'_, ()>) -> Result<(), HandlerError> {
    if incoming.body == b"ping" {
        Ok(())
    } else {
        Err(anyhow::anyhow!("Unexpected payload").into())
    }
}

#[tokio::test(start_paused = true)]
async fn deliveries_from_an_overridden_consume_step_are_dispatched() {
    // Arrange
    let broker = InMemoryBroker::new();
    let consumer = Consumer::builder(broker.clone(), endpoint(), ())
        .handler_fn(ping_handler)
        .with_consume_setup(ScriptedConsume {
            broker: broker.clone(),
            bodies: vec!["ping", "pong"],
        })
        .build();
    let shutdown = Arc::new(ShutdownHandler::new());
    let handle = tokio::spawn(consumer.run_until_shutdown(shutdown.clone()));

    // Act
    eventually(|| broker.acked().len() == 1 && !broker.rejected().is_empty()).await;
    shutdown.shutdown();
    handle.await.unwrap();

    // Assert
    assert!(broker.consumes().is_empty());
    assert_eq!(broker.acked(), vec![b"ping".to_vec()]);
    assert_eq!(broker.rejected()[0], (b"pong".to_vec(), true));
}
