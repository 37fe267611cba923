use crate::amqp::transport::{
    BrokerChannel, BrokerConnection, DeliveryStream, FailureNotifications, Transport,
};
use crate::amqp::BrokerEndpoint;
use crate::consumers::error::{ConnectionError, SessionPhase};
use crate::consumers::hooks::Topology;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// The channel type of a [`Transport`].
pub type ChannelOf<T> = <<T as Transport>::Connection as BrokerConnection>::Channel;

/// The delivery type of a [`Transport`].
pub type DeliveryOf<T> = <ChannelOf<T> as BrokerChannel>::Delivery;

/// A fully established consuming session: an open connection, an open channel consuming from
/// the endpoint queue and a failure subscription for each of them.
///
/// `SessionHandle`s are only ever handed out fully initialised. They are never repaired: on
/// failure the whole handle is torn down and a new one is established.
pub struct SessionHandle<T: Transport> {
    pub(crate) connection: T::Connection,
    pub(crate) channel: ChannelOf<T>,
    pub(crate) connection_failures: FailureNotifications,
    pub(crate) channel_failures: FailureNotifications,
    pub(crate) consumer_tag: String,
}

impl<T: Transport> SessionHandle<T> {
    /// The tag of the consumer running on this session.
    ///
    /// It differs from the configured tag if the latter was left empty.
    pub fn consumer_tag(&self) -> &str {
        &self.consumer_tag
    }
}

/// `ConnectionManager` establishes consuming sessions against a single [`BrokerEndpoint`].
///
/// Every session goes through the same steps: dial, open a channel, run the [`Topology`]
/// declaration steps (exchange, queue, binding, consume) and subscribe to failures.
/// If any step fails, whatever was already opened is closed before returning the error.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    endpoint: Arc<BrokerEndpoint>,
    topology: Topology<ChannelOf<T>>,
}

impl<T: Transport> ConnectionManager<T> {
    pub fn new(
        transport: T,
        endpoint: impl Into<Arc<BrokerEndpoint>>,
        topology: Topology<ChannelOf<T>>,
    ) -> Self {
        Self {
            transport,
            endpoint: endpoint.into(),
            topology,
        }
    }

    pub fn endpoint(&self) -> &BrokerEndpoint {
        &self.endpoint
    }

    /// Establish a new consuming session.
    ///
    /// On success, it returns the session together with the stream of deliveries for the
    /// endpoint queue.
    #[tracing::instrument(
        name = "establish_session",
        skip(self),
        fields(address = %self.endpoint.address(), queue = %self.endpoint.queue)
    )]
    pub async fn establish(
        &self,
    ) -> Result<(SessionHandle<T>, DeliveryStream<DeliveryOf<T>>), ConnectionError> {
        let connection = self
            .transport
            .connect(&self.endpoint.uri)
            .await
            .map_err(|e| ConnectionError::new(SessionPhase::Dial, e))?;
        let connection_failures = connection.notify_failure();

        let channel = match connection.create_channel().await {
            Ok(channel) => channel,
            Err(e) => {
                close_connection(&connection).await;
                return Err(ConnectionError::new(SessionPhase::Channel, e));
            }
        };
        let channel_failures = channel.notify_failure();

        let consumer_tag = self.consumer_tag();
        match self.declare_and_consume(&channel, &consumer_tag).await {
            Ok(deliveries) => Ok((
                SessionHandle {
                    connection,
                    channel,
                    connection_failures,
                    channel_failures,
                    consumer_tag,
                },
                deliveries,
            )),
            Err(e) => {
                if let Err(close_error) = channel.close().await {
                    warn!(error = ?close_error, "Failed to close the channel of a broken session");
                }
                close_connection(&connection).await;
                Err(e)
            }
        }
    }

    async fn declare_and_consume(
        &self,
        channel: &ChannelOf<T>,
        consumer_tag: &str,
    ) -> Result<DeliveryStream<DeliveryOf<T>>, ConnectionError> {
        let endpoint = self.endpoint.as_ref();
        self.topology
            .exchange
            .setup_exchange(channel, endpoint)
            .await
            .map_err(|e| ConnectionError::new(SessionPhase::Exchange, e))?;
        self.topology
            .queue
            .setup_queue(channel, endpoint)
            .await
            .map_err(|e| ConnectionError::new(SessionPhase::Queue, e))?;
        self.topology
            .binding
            .bind(channel, endpoint)
            .await
            .map_err(|e| ConnectionError::new(SessionPhase::Bind, e))?;
        self.topology
            .consume
            .consume(channel, endpoint, consumer_tag)
            .await
            .map_err(|e| ConnectionError::new(SessionPhase::Consume, e))
    }

    /// The configured consumer tag or, if empty, a freshly generated one.
    fn consumer_tag(&self) -> String {
        if self.endpoint.consumer_tag.is_empty() {
            format!("amqp-tools-{}", Uuid::new_v4())
        } else {
            self.endpoint.consumer_tag.clone()
        }
    }
}

async fn close_connection<C: BrokerConnection>(connection: &C) {
    if let Err(e) = connection.close().await {
        warn!(error = ?e, "Failed to close the connection of a broken session");
    }
}
