//! The seam between the resilience logic and the AMQP client.
//!
//! [`Transport`], [`BrokerConnection`] and [`BrokerChannel`] describe the handful of broker
//! operations the consumer and the publisher rely on. [`ConnectionFactory`] implements them on
//! top of `lapin`; tests can provide an in-memory broker instead and exercise reconnection,
//! acknowledgement and confirmation flows without a running RabbitMq instance.
//!
//! [`ConnectionFactory`]: crate::amqp::ConnectionFactory
use crate::consumers::Delivery;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::uri::AMQPUri;
use lapin::{BasicProperties, ExchangeKind};
use tokio::sync::mpsc;

/// The lazy, unbounded sequence of messages pushed by the broker to a consumer.
///
/// The stream ends when the consumer is cancelled or the underlying channel goes away.
pub type DeliveryStream<D> = BoxStream<'static, Result<D, anyhow::Error>>;

/// The outcome of a single publish, as reported by the broker.
///
/// It resolves to [`Confirmation::NotRequested`] if the channel is not in confirm mode.
pub type PendingConfirm = BoxFuture<'static, Result<Confirmation, anyhow::Error>>;

/// `Transport` knows how to dial a RabbitMq broker.
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    type Connection: BrokerConnection;

    /// Open a new connection to the broker behind `uri`.
    async fn connect(&self, uri: &AMQPUri) -> Result<Self::Connection, anyhow::Error>;
}

/// An open connection to a RabbitMq broker.
#[async_trait::async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    type Channel: BrokerChannel;

    async fn create_channel(&self) -> Result<Self::Channel, anyhow::Error>;

    /// Register a subscription to connection-level failures.
    ///
    /// Only the most recent subscription receives notifications.
    fn notify_failure(&self) -> FailureNotifications;

    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// A channel multiplexed over a [`BrokerConnection`].
///
/// Options are expressed with `lapin`'s types so that implementations (and test doubles) can
/// assert on the exact flags requested by the caller.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    type Delivery: Delivery;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), anyhow::Error>;

    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<(), anyhow::Error>;

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
    ) -> Result<(), anyhow::Error>;

    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream<Self::Delivery>, anyhow::Error>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error>;

    /// Put the channel in confirm mode.
    async fn confirm_select(&self) -> Result<(), anyhow::Error>;

    /// Hand a message over to the broker.
    ///
    /// The returned future resolves once the broker has confirmed (or refused) the message.
    /// Callers that do not care about confirmations can drop it.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, anyhow::Error>;

    /// Register a subscription to channel-level failures.
    ///
    /// Only the most recent subscription receives notifications.
    fn notify_failure(&self) -> FailureNotifications;

    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// The sending half of a [`FailureNotifications`] subscription.
#[derive(Clone, Debug)]
pub struct FailureNotifier(mpsc::UnboundedSender<lapin::Error>);

impl FailureNotifier {
    /// Forward a failure to the subscriber.
    ///
    /// Failures raised after the subscription has been closed are dropped.
    pub fn notify(&self, error: lapin::Error) {
        let _ = self.0.send(error);
    }
}

/// A subscription to the failures of a connection or a channel.
///
/// Once [`drain`](FailureNotifications::drain) has been called no new failure is accepted, so
/// notifications raised by a dead session can never leak into the next one.
#[derive(Debug)]
pub struct FailureNotifications(mpsc::UnboundedReceiver<lapin::Error>);

impl FailureNotifications {
    pub fn new() -> (FailureNotifier, Self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (FailureNotifier(sender), Self(receiver))
    }

    /// Wait for the next failure.
    ///
    /// Returns `None` if every notifier has been dropped or the subscription has been closed
    /// and all buffered failures have been read.
    pub async fn recv(&mut self) -> Option<lapin::Error> {
        self.0.recv().await
    }

    /// Stop accepting failures and return every failure that was still buffered.
    pub async fn drain(mut self) -> Vec<lapin::Error> {
        self.0.close();
        let mut errors = Vec::new();
        while let Some(error) = self.0.recv().await {
            errors.push(error);
        }
        errors
    }
}
