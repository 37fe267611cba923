//! `lapin`-backed implementations of [`BrokerConnection`] and [`BrokerChannel`].
use crate::amqp::transport::{
    BrokerChannel, BrokerConnection, DeliveryStream, FailureNotifications, PendingConfirm,
};
use futures_util::{FutureExt, StreamExt, TryStreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, ExchangeKind,
};
use tracing::warn;

/// AMQP reply code for a normal, client-initiated shutdown.
const REPLY_SUCCESS: u16 = 200;

/// A connection to a RabbitMq broker.
pub struct RabbitMqConnection(lapin::Connection);

/// A RabbitMq channel.
pub struct RabbitMqChannel(lapin::Channel);

impl RabbitMqConnection {
    pub(crate) fn new(connection: lapin::Connection) -> Self {
        // Register a callback to log connection errors.
        // It is replaced as soon as somebody subscribes to failure notifications.
        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });
        Self(connection)
    }
}

#[async_trait::async_trait]
impl BrokerConnection for RabbitMqConnection {
    type Channel = RabbitMqChannel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn create_channel(&self) -> Result<RabbitMqChannel, anyhow::Error> {
        Ok(RabbitMqChannel(self.0.create_channel().await?))
    }

    fn notify_failure(&self) -> FailureNotifications {
        let (notifier, notifications) = FailureNotifications::new();
        self.0.on_error(move |e| {
            warn!("RabbitMQ broken connection: {:?}", e);
            notifier.notify(e);
        });
        notifications
    }

    fn is_closed(&self) -> bool {
        !self.0.status().connected()
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.0.close(REPLY_SUCCESS, "amqp-tools closing").await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for RabbitMqChannel {
    type Delivery = Delivery;

    #[tracing::instrument(name = "rabbitmq_declare_exchange", skip(self))]
    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), anyhow::Error> {
        self.0
            .exchange_declare(exchange, kind, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_declare_queue", skip(self))]
    async fn queue_declare(
        &self,
        queue: &str,
        options: QueueDeclareOptions,
    ) -> Result<(), anyhow::Error> {
        self.0
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_bind_queue", skip(self))]
    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        options: QueueBindOptions,
    ) -> Result<(), anyhow::Error> {
        self.0
            .queue_bind(queue, exchange, routing_key, options, FieldTable::default())
            .await?;
        Ok(())
    }

    #[tracing::instrument(name = "rabbitmq_consume", skip(self))]
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: BasicConsumeOptions,
    ) -> Result<DeliveryStream<Delivery>, anyhow::Error> {
        let consumer = self
            .0
            .basic_consume(queue, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(consumer.map_err(anyhow::Error::from).boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), anyhow::Error> {
        self.0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn confirm_select(&self) -> Result<(), anyhow::Error> {
        // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
        self.0
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, payload, properties))]
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<PendingConfirm, anyhow::Error> {
        let confirm = self
            .0
            .basic_publish(exchange, routing_key, options, payload, properties)
            .await?;
        Ok(confirm.map(|c| c.map_err(anyhow::Error::from)).boxed())
    }

    fn notify_failure(&self) -> FailureNotifications {
        let (notifier, notifications) = FailureNotifications::new();
        self.0.on_error(move |e| {
            warn!("RabbitMQ broken channel: {:?}", e);
            notifier.notify(e);
        });
        notifications
    }

    async fn close(&self) -> Result<(), anyhow::Error> {
        self.0.close(REPLY_SUCCESS, "amqp-tools closing").await?;
        Ok(())
    }
}
