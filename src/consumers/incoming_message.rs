use amq_protocol_types::DeliveryTag;
use lapin::options::{BasicAckOptions, BasicRejectOptions};
use std::sync::Arc;

/// A message pushed by the broker that is waiting to be settled.
///
/// Settling a delivery (with [`acknowledge`](Delivery::acknowledge) or
/// [`reject`](Delivery::reject)) consumes it: the AMQP protocol specifies that a message must not
/// be acked/rejected multiple times, see
/// <https://www.rabbitmq.com/amqp-0-9-1-reference.html#basic.ack.delivery-tag>.
#[async_trait::async_trait]
pub trait Delivery: Send + 'static {
    /// The payload of the message in binary format.
    fn body(&self) -> &[u8];

    fn delivery_tag(&self) -> DeliveryTag;

    /// Positive, single-message acknowledgement.
    async fn acknowledge(self) -> Result<(), anyhow::Error>;

    /// Negative acknowledgement. If `requeue` is `true` the broker puts the message back on
    /// the queue for redelivery.
    async fn reject(self, requeue: bool) -> Result<(), anyhow::Error>;
}

#[async_trait::async_trait]
impl Delivery for lapin::message::Delivery {
    fn body(&self) -> &[u8] {
        &self.data
    }

    fn delivery_tag(&self) -> DeliveryTag {
        self.delivery_tag
    }

    async fn acknowledge(self) -> Result<(), anyhow::Error> {
        self.acker.ack(BasicAckOptions { multiple: false }).await?;
        Ok(())
    }

    async fn reject(self, requeue: bool) -> Result<(), anyhow::Error> {
        self.acker.reject(BasicRejectOptions { requeue }).await?;
        Ok(())
    }
}

/// A dequeued message, ready for processing.
///
/// `Incoming` is the input type of our message handlers (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
pub struct Incoming<'a, Context> {
    /// `context` is a set of resources that are required to process the message and are outside
    /// the lifecycle of the message itself - e.g. an HTTP client for a third-party API, a db connection
    /// pool, etc.
    pub context: Arc<Context>,
    /// The payload of the message.
    pub body: &'a [u8],
    pub delivery_tag: DeliveryTag,
}
