use crate::amqp::transport::{BrokerChannel, BrokerConnection, Transport};
use crate::amqp::BrokerEndpoint;
use crate::consumers::hooks::{DeclareDurableExchange, ExchangeSetup};
use crate::consumers::ChannelOf;
use crate::publishers::confirm::{PublisherConfirmGuard, DEFAULT_CONFIRM_TIMEOUT};
use lapin::options::BasicPublishOptions;
use lapin::BasicProperties;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Delivery mode: Non-persistent (1) or persistent (2).
const TRANSIENT_DELIVERY_MODE: u8 = 1;

/// Publishes messages to the exchange of a [`BrokerEndpoint`], using the endpoint routing key.
///
/// # Resources
///
/// Every call to [`Publisher::publish`] opens its own connection and closes it before returning,
/// whatever the outcome. Nothing is pooled or shared between calls: a `Publisher` can be used
/// concurrently from multiple tasks.
///
/// # Reliability
///
/// If the endpoint is `reliable`, the channel is put in confirm mode and `publish` waits for the
/// broker to confirm the message (see [`PublisherConfirmGuard`]).
pub struct Publisher<T: Transport> {
    transport: T,
    endpoint: Arc<BrokerEndpoint>,
    exchange_setup: Arc<dyn ExchangeSetup<ChannelOf<T>>>,
    confirm_timeout: Duration,
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublishError {
    #[error("Failed to connect to RabbitMq")]
    Dial(#[source] anyhow::Error),
    #[error("Failed to open a channel")]
    Channel(#[source] anyhow::Error),
    #[error("Failed to declare the exchange")]
    ExchangeDeclare(#[source] anyhow::Error),
    #[error("The channel could not be put into confirm mode")]
    ConfirmSelect(#[source] anyhow::Error),
    #[error("Failed to publish the message")]
    Publish(#[source] anyhow::Error),
}

impl<T: Transport> Publisher<T> {
    /// Start building a [`Publisher`].
    pub fn builder(
        transport: T,
        endpoint: impl Into<Arc<BrokerEndpoint>>,
    ) -> PublisherBuilder<T> {
        PublisherBuilder {
            transport,
            endpoint: endpoint.into(),
            exchange_setup: Arc::new(DeclareDurableExchange),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }

    /// Publish `body` to RabbitMq.
    ///
    /// Messages are published with transient delivery mode and without the mandatory flag:
    /// the broker silently drops messages that cannot be routed to a queue.
    #[tracing::instrument(
        name = "publish_message",
        skip(self, body),
        fields(
            exchange = %self.endpoint.exchange,
            routing_key = %self.endpoint.routing_key,
            reliable = self.endpoint.reliable
        )
    )]
    pub async fn publish(&self, content_type: &str, body: &[u8]) -> Result<(), PublishError> {
        let connection = self
            .transport
            .connect(&self.endpoint.uri)
            .await
            .map_err(PublishError::Dial)?;

        let outcome = self.publish_on(&connection, content_type, body).await;

        if let Err(e) = connection.close().await {
            warn!(error = ?e, "Failed to close the publisher connection");
        }
        outcome
    }

    async fn publish_on(
        &self,
        connection: &T::Connection,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), PublishError> {
        let channel = connection
            .create_channel()
            .await
            .map_err(PublishError::Channel)?;

        self.exchange_setup
            .setup_exchange(&channel, &self.endpoint)
            .await
            .map_err(PublishError::ExchangeDeclare)?;

        let mut confirm_guard = if self.endpoint.reliable {
            let guard = PublisherConfirmGuard::engage(&channel, self.confirm_timeout)
                .await
                .map_err(PublishError::ConfirmSelect)?;
            Some(guard)
        } else {
            None
        };

        let options = BasicPublishOptions {
            mandatory: false,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        let properties = BasicProperties::default()
            .with_content_type(content_type.into())
            .with_delivery_mode(TRANSIENT_DELIVERY_MODE);
        let pending = channel
            .basic_publish(
                &self.endpoint.exchange,
                &self.endpoint.routing_key,
                options,
                body,
                properties,
            )
            .await
            .map_err(PublishError::Publish)?;

        if let Some(guard) = confirm_guard.as_mut() {
            guard.confirm_one(pending).await;
        }
        Ok(())
    }
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<T: Transport> {
    transport: T,
    endpoint: Arc<BrokerEndpoint>,
    exchange_setup: Arc<dyn ExchangeSetup<ChannelOf<T>>>,
    confirm_timeout: Duration,
}

impl<T: Transport> PublisherBuilder<T> {
    /// Replace how the exchange is set up before publishing. Defaults to
    /// [`DeclareDurableExchange`].
    #[must_use]
    pub fn with_exchange_setup<S: ExchangeSetup<ChannelOf<T>>>(mut self, setup: S) -> Self {
        self.exchange_setup = Arc::new(setup);
        self
    }

    /// How long to wait for the broker to confirm a message when the endpoint is reliable.
    /// Defaults to 30 seconds.
    #[must_use]
    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Finalise the builder and get an instance of [`Publisher`].
    pub fn build(self) -> Publisher<T> {
        Publisher {
            transport: self.transport,
            endpoint: self.endpoint,
            exchange_setup: self.exchange_setup,
            confirm_timeout: self.confirm_timeout,
        }
    }
}
