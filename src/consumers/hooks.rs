//! Pluggable declaration steps executed every time a session with the broker is established.
//!
//! Each step has a default implementation matching the topology expected by `amqp-tools`:
//!
//! - [`DeclareDurableExchange`], a durable, non auto-deleted, non internal exchange;
//! - [`DeclareDurableQueue`], a durable, non auto-deleted, non exclusive queue;
//! - [`BindRoutingKey`], binding the queue to the exchange with the configured routing key;
//! - [`ManualAckConsume`], a non exclusive consumer that acknowledges messages explicitly.
//!
//! Any step can be swapped out on the [`Topology`] (see
//! [`ConsumerBuilder`](crate::consumers::ConsumerBuilder)) without altering the reconnection
//! logic, e.g. to rely on resources provisioned by other means.
//!
//! ```
//! use amqp_tools::amqp::RabbitMqChannel;
//! use amqp_tools::consumers::hooks::{ExistingExchange, Topology};
//!
//! // The exchange is managed via Terraform, we only need the queue and the binding.
//! let topology = Topology::<RabbitMqChannel>::default().with_exchange_setup(ExistingExchange);
//! # drop(topology);
//! ```
use crate::amqp::transport::{BrokerChannel, DeliveryStream};
use crate::amqp::BrokerEndpoint;
use lapin::options::{
    BasicConsumeOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use std::sync::Arc;

#[async_trait::async_trait]
/// Defines how to set up the exchange.
pub trait ExchangeSetup<C: BrokerChannel>: Send + Sync + 'static {
    async fn setup_exchange(
        &self,
        channel: &C,
        endpoint: &BrokerEndpoint,
    ) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
/// Defines how to set up the queue.
pub trait QueueSetup<C: BrokerChannel>: Send + Sync + 'static {
    async fn setup_queue(&self, channel: &C, endpoint: &BrokerEndpoint)
        -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
/// Defines how to bind the queue to the exchange.
pub trait BindingSetup<C: BrokerChannel>: Send + Sync + 'static {
    async fn bind(&self, channel: &C, endpoint: &BrokerEndpoint) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
/// Defines how to start pulling messages from the queue.
pub trait ConsumeSetup<C: BrokerChannel>: Send + Sync + 'static {
    async fn consume(
        &self,
        channel: &C,
        endpoint: &BrokerEndpoint,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<C::Delivery>, anyhow::Error>;
}

/// Declares a new durable exchange, named and typed after the endpoint.
pub struct DeclareDurableExchange;

/// Uses a pre-existing exchange
pub struct ExistingExchange;

/// Declares a new durable queue, named after the endpoint.
pub struct DeclareDurableQueue;

/// Binds the endpoint queue to the endpoint exchange using the endpoint routing key.
pub struct BindRoutingKey;

/// Consumes from the endpoint queue with manual acknowledgements.
pub struct ManualAckConsume;

#[async_trait::async_trait]
impl<C: BrokerChannel> ExchangeSetup<C> for DeclareDurableExchange {
    async fn setup_exchange(
        &self,
        channel: &C,
        endpoint: &BrokerEndpoint,
    ) -> Result<(), anyhow::Error> {
        channel
            .exchange_declare(
                &endpoint.exchange,
                endpoint.exchange_kind.clone(),
                ExchangeDeclareOptions {
                    passive: false,
                    // The exchange will survive RabbitMq server restarts
                    durable: true,
                    auto_delete: false,
                    internal: false,
                    nowait: false,
                },
            )
            .await
    }
}

#[async_trait::async_trait]
impl<C: BrokerChannel> ExchangeSetup<C> for ExistingExchange {
    async fn setup_exchange(
        &self,
        _channel: &C,
        _endpoint: &BrokerEndpoint,
    ) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

#[async_trait::async_trait]
impl<C: BrokerChannel> QueueSetup<C> for DeclareDurableQueue {
    async fn setup_queue(
        &self,
        channel: &C,
        endpoint: &BrokerEndpoint,
    ) -> Result<(), anyhow::Error> {
        channel
            .queue_declare(
                &endpoint.queue,
                QueueDeclareOptions {
                    passive: false,
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    nowait: false,
                },
            )
            .await
    }
}

#[async_trait::async_trait]
impl<C: BrokerChannel> BindingSetup<C> for BindRoutingKey {
    async fn bind(&self, channel: &C, endpoint: &BrokerEndpoint) -> Result<(), anyhow::Error> {
        channel
            .queue_bind(
                &endpoint.queue,
                &endpoint.exchange,
                &endpoint.routing_key,
                QueueBindOptions { nowait: false },
            )
            .await
    }
}

#[async_trait::async_trait]
impl<C: BrokerChannel> ConsumeSetup<C> for ManualAckConsume {
    async fn consume(
        &self,
        channel: &C,
        endpoint: &BrokerEndpoint,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<C::Delivery>, anyhow::Error> {
        channel
            .basic_consume(
                &endpoint.queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    // The broker must wait for an explicit ack/reject.
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
            )
            .await
    }
}

/// The full set of declaration steps run when establishing a session.
pub struct Topology<C: BrokerChannel> {
    pub(crate) exchange: Arc<dyn ExchangeSetup<C>>,
    pub(crate) queue: Arc<dyn QueueSetup<C>>,
    pub(crate) binding: Arc<dyn BindingSetup<C>>,
    pub(crate) consume: Arc<dyn ConsumeSetup<C>>,
}

impl<C: BrokerChannel> Default for Topology<C> {
    fn default() -> Self {
        Self {
            exchange: Arc::new(DeclareDurableExchange),
            queue: Arc::new(DeclareDurableQueue),
            binding: Arc::new(BindRoutingKey),
            consume: Arc::new(ManualAckConsume),
        }
    }
}

impl<C: BrokerChannel> Clone for Topology<C> {
    fn clone(&self) -> Self {
        Self {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            binding: self.binding.clone(),
            consume: self.consume.clone(),
        }
    }
}

impl<C: BrokerChannel> Topology<C> {
    #[must_use]
    pub fn with_exchange_setup<S: ExchangeSetup<C>>(mut self, setup: S) -> Self {
        self.exchange = Arc::new(setup);
        self
    }

    #[must_use]
    pub fn with_queue_setup<S: QueueSetup<C>>(mut self, setup: S) -> Self {
        self.queue = Arc::new(setup);
        self
    }

    #[must_use]
    pub fn with_binding_setup<S: BindingSetup<C>>(mut self, setup: S) -> Self {
        self.binding = Arc::new(setup);
        self
    }

    #[must_use]
    pub fn with_consume_setup<S: ConsumeSetup<C>>(mut self, setup: S) -> Self {
        self.consume = Arc::new(setup);
        self
    }
}
