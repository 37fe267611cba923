use crate::amqp::transport::Transport;
use crate::amqp::BrokerEndpoint;
use crate::consumers::connection_manager::{ChannelOf, ConnectionManager};
use crate::consumers::dispatcher::DeliveryDispatcher;
use crate::consumers::handler::{AsyncClosure, ClosureHandler};
use crate::consumers::hooks::{BindingSetup, ConsumeSetup, ExchangeSetup, QueueSetup, Topology};
use crate::consumers::supervisor::{ReconnectSupervisor, DEFAULT_RECONNECT_DELAY};
use crate::consumers::Handler;
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;
use std::time::Duration;

/// A RabbitMq consumer that survives connection and channel failures.
///
/// `Consumer` is the main entrypoint if you want to pull and process messages from a queue.
/// It connects to the broker described by a [`BrokerEndpoint`], declares the exchange, the queue
/// and the binding, and hands every message over to your [`Handler`].
/// When the connection (or the channel) breaks, it reconnects - forever, until you shut it down.
///
/// # How do I build a `Consumer`?
///
/// `Consumer` provides a fluent API to add configuration step-by-step, known as
/// "builder pattern" in Rust.
/// The starting point is [`Consumer::builder`].
pub struct Consumer<T: Transport, Context: Send + Sync + 'static> {
    manager: ConnectionManager<T>,
    dispatcher: DeliveryDispatcher<Context>,
    reconnect_delay: Duration,
}

impl<T, Context> Consumer<T, Context>
where
    T: Transport,
    Context: Send + Sync + 'static,
{
    /// Start building a [`Consumer`].
    ///
    /// You will need a transport (e.g. a [`ConnectionFactory`]), the endpoint to consume from
    /// and a context.
    ///
    /// # Context
    ///
    /// In message handlers you will often need to use resources with a significant initialisation
    /// cost - e.g. a HTTP client, a database connection, etc.
    /// Instead of creating a new instance of these expensive resources every single time you handle
    /// a message, you can put those resources in the _context_.
    ///
    /// [`ConnectionFactory`]: crate::amqp::ConnectionFactory
    pub fn builder(
        transport: T,
        endpoint: impl Into<Arc<BrokerEndpoint>>,
        context: impl Into<Arc<Context>>,
    ) -> ConsumerBuilder<T, Context> {
        ConsumerBuilder {
            transport,
            endpoint: endpoint.into(),
            context: context.into(),
            handler: None,
            topology: Topology::default(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    /// Start consuming messages.
    /// As the name implies, `run_until_sigterm` returns control to the caller only when
    /// the application is stopped via SIGTERM.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        self.run_until_shutdown(ShutdownHandler::sigterm()?).await;
        Ok(())
    }

    /// Start consuming messages.
    /// `run_until_shutdown` returns control to the caller only when the shutdown handler fires.
    pub async fn run_until_shutdown(self, shutdown: Arc<ShutdownHandler>) {
        self.into_supervisor(shutdown).run().await
    }

    /// Get hold of the state machine driving this consumer, to step through it manually.
    pub fn into_supervisor(self, shutdown: Arc<ShutdownHandler>) -> ReconnectSupervisor<T, Context> {
        ReconnectSupervisor::new(self.manager, self.dispatcher, shutdown)
            .with_reconnect_delay(self.reconnect_delay)
    }
}

/// A builder for [`Consumer`].
///
/// Use [`Consumer::builder`] as entrypoint.
pub struct ConsumerBuilder<T: Transport, Context> {
    transport: T,
    endpoint: Arc<BrokerEndpoint>,
    context: Arc<Context>,
    handler: Option<Arc<dyn Handler<Context>>>,
    topology: Topology<ChannelOf<T>>,
    reconnect_delay: Duration,
}

impl<T, Context> ConsumerBuilder<T, Context>
where
    T: Transport,
    Context: Send + Sync + 'static,
{
    /// The handler processing messages.
    ///
    /// If you never set one, every message is rejected and requeued.
    #[must_use]
    pub fn handler<H: Handler<Context>>(mut self, handler: H) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Use an async function as handler. See [`AsyncClosure`].
    #[must_use]
    pub fn handler_fn<F>(self, handler: F) -> Self
    where
        F: for<'a> AsyncClosure<'a, Context>,
    {
        self.handler(ClosureHandler(handler))
    }

    /// Replace how the exchange is set up. Defaults to
    /// [`DeclareDurableExchange`](crate::consumers::hooks::DeclareDurableExchange).
    #[must_use]
    pub fn with_exchange_setup<S: ExchangeSetup<ChannelOf<T>>>(mut self, setup: S) -> Self {
        self.topology = self.topology.with_exchange_setup(setup);
        self
    }

    /// Replace how the queue is set up. Defaults to
    /// [`DeclareDurableQueue`](crate::consumers::hooks::DeclareDurableQueue).
    #[must_use]
    pub fn with_queue_setup<S: QueueSetup<ChannelOf<T>>>(mut self, setup: S) -> Self {
        self.topology = self.topology.with_queue_setup(setup);
        self
    }

    /// Replace how the queue is bound to the exchange. Defaults to
    /// [`BindRoutingKey`](crate::consumers::hooks::BindRoutingKey).
    #[must_use]
    pub fn with_binding_setup<S: BindingSetup<ChannelOf<T>>>(mut self, setup: S) -> Self {
        self.topology = self.topology.with_binding_setup(setup);
        self
    }

    /// Replace how consumption is started. Defaults to
    /// [`ManualAckConsume`](crate::consumers::hooks::ManualAckConsume).
    #[must_use]
    pub fn with_consume_setup<S: ConsumeSetup<ChannelOf<T>>>(mut self, setup: S) -> Self {
        self.topology = self.topology.with_consume_setup(setup);
        self
    }

    /// How long to wait between two attempts to (re)establish a session with the broker.
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Finalise the builder.
    ///
    /// No connection is opened until the consumer is run.
    pub fn build(self) -> Consumer<T, Context> {
        Consumer {
            manager: ConnectionManager::new(self.transport, self.endpoint, self.topology),
            dispatcher: DeliveryDispatcher::new(self.handler, self.context),
            reconnect_delay: self.reconnect_delay,
        }
    }
}
