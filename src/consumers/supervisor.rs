use crate::amqp::transport::{BrokerChannel, BrokerConnection, DeliveryStream, Transport};
use crate::consumers::connection_manager::{ConnectionManager, DeliveryOf, SessionHandle};
use crate::consumers::dispatcher::DeliveryDispatcher;
use futures_util::future::{BoxFuture, Shared};
use futures_util::FutureExt;
use shutdown_handler::ShutdownHandler;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

/// How long the supervisor waits before trying to establish a new session after a failure.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// How long a dispatcher gets to process the last in-flight message of a dead session before
/// being aborted.
const DISPATCHER_GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Same as [`DISPATCHER_GRACE_PERIOD`], when the process is shutting down.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(2);

/// The states of a [`ReconnectSupervisor`].
///
/// ```text
///            establish ok
///  Backoff ───────────────► Connected ── shutdown ──► Shutdown
///   ▲   │ ▲                    │
///   │   │ └─ establish failed  │ connection/channel failure
///   │   │    (wait, retry)     │ or end of deliveries
///   │   │                      ▼
///   │   └── shutdown ──►    Failed ──► Draining ──┐
///   └─────────────────────────────────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    /// A session is live and its dispatcher is running.
    Connected,
    /// A failure has been observed on the live session.
    Failed,
    /// The failed session has been closed; its failure notifications are being drained.
    Draining,
    /// No session: establish one, waiting between attempts. A new supervisor starts here.
    Backoff,
    /// Terminal.
    Shutdown,
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self {
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Draining => "draining",
            Self::Backoff => "backoff",
            Self::Shutdown => "shutdown",
        };
        f.write_str(state)
    }
}

/// What woke up a supervisor in the `Connected` state.
enum Wakeup {
    Shutdown,
    ConnectionFailure(Option<lapin::Error>),
    ChannelFailure(Option<lapin::Error>),
    /// The delivery stream ended without a failure notification, e.g. the broker cancelled
    /// the consumer or closed the connection gracefully.
    DeliveriesEnded(Result<(), JoinError>),
}

/// `ReconnectSupervisor` owns the lifecycle of a consumer.
///
/// It keeps a consuming session alive for as long as the process runs: whenever the connection
/// or the channel fails, or the broker stops delivering to the consumer, the session is torn
/// down and a new one is established, waiting a fixed delay between attempts. There is no cap on the number of attempts - the only way out is the
/// shutdown signal.
///
/// A new dispatcher is never started before the previous session has been closed, its failure
/// notifications drained and its dispatcher stopped.
pub struct ReconnectSupervisor<T: Transport, Context> {
    manager: ConnectionManager<T>,
    dispatcher: DeliveryDispatcher<Context>,
    /// Resolves once the shutdown signal has been received. Created once, polled many times.
    shutdown: Shared<BoxFuture<'static, ()>>,
    reconnect_delay: Duration,
    state: SupervisorState,
    session: Option<SessionHandle<T>>,
    dispatcher_task: Option<JoinHandle<()>>,
}

impl<T, Context> ReconnectSupervisor<T, Context>
where
    T: Transport,
    Context: Send + Sync + 'static,
{
    pub fn new(
        manager: ConnectionManager<T>,
        dispatcher: DeliveryDispatcher<Context>,
        shutdown: Arc<ShutdownHandler>,
    ) -> Self {
        let shutdown = async move { shutdown.wait_for_signal().await }
            .boxed()
            .shared();
        Self {
            manager,
            dispatcher,
            shutdown,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            state: SupervisorState::Backoff,
            session: None,
            dispatcher_task: None,
        }
    }

    /// Wait `delay` between two failed attempts to establish a session.
    /// Defaults to [`DEFAULT_RECONNECT_DELAY`].
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// The live session, if any.
    pub fn session(&self) -> Option<&SessionHandle<T>> {
        self.session.as_ref()
    }

    /// Drive the state machine until the shutdown signal is received.
    #[tracing::instrument(
        name = "consumer_run",
        skip_all,
        fields(address = %self.manager.endpoint().address(), queue = %self.manager.endpoint().queue)
    )]
    pub async fn run(mut self) {
        while self.state != SupervisorState::Shutdown {
            self.step().await;
        }
        info!("Consumer shut down");
    }

    /// Execute the current state and move to the next one, which is returned.
    pub async fn step(&mut self) -> SupervisorState {
        let next = match self.state {
            SupervisorState::Connected => self.connected().await,
            SupervisorState::Failed => self.fail().await,
            SupervisorState::Draining => self.drain().await,
            SupervisorState::Backoff => self.backoff().await,
            SupervisorState::Shutdown => SupervisorState::Shutdown,
        };
        debug!(from = %self.state, to = %next, "Consumer state transition");
        self.state = next;
        next
    }

    /// Wait for a failure of the live session, the end of its deliveries or the shutdown signal.
    async fn connected(&mut self) -> SupervisorState {
        let shutdown = self.shutdown.clone();
        let Some(session) = self.session.as_mut() else {
            return SupervisorState::Backoff;
        };
        let Some(dispatcher_task) = self.dispatcher_task.as_mut() else {
            return SupervisorState::Failed;
        };
        let wakeup = tokio::select! {
            biased;

            _ = shutdown => Wakeup::Shutdown,
            e = session.connection_failures.recv() => Wakeup::ConnectionFailure(e),
            e = session.channel_failures.recv() => Wakeup::ChannelFailure(e),
            outcome = dispatcher_task => Wakeup::DeliveriesEnded(outcome),
        };

        match wakeup {
            Wakeup::Shutdown => {
                info!("Consumer received shutdown event");
                self.close_session().await;
                if let Some(session) = self.session.take() {
                    drain_failures(session).await;
                }
                self.stop_dispatcher(SHUTDOWN_GRACE_PERIOD).await;
                SupervisorState::Shutdown
            }
            Wakeup::ConnectionFailure(e) => {
                error!(error = ?e, "RabbitMq connection closed");
                SupervisorState::Failed
            }
            Wakeup::ChannelFailure(e) => {
                error!(error = ?e, "RabbitMq channel closed");
                SupervisorState::Failed
            }
            Wakeup::DeliveriesEnded(outcome) => {
                // A finished task must not be polled again
                self.dispatcher_task = None;
                match outcome {
                    Ok(()) => error!("RabbitMq stopped delivering messages to the consumer"),
                    Err(e) => error!(error = ?e, "The message dispatcher crashed"),
                }
                SupervisorState::Failed
            }
        }
    }

    /// Tear down what is left of the failed session.
    async fn fail(&mut self) -> SupervisorState {
        self.close_session().await;
        SupervisorState::Draining
    }

    /// Read every pending failure notification of the dead session and wait for its dispatcher.
    async fn drain(&mut self) -> SupervisorState {
        if let Some(session) = self.session.take() {
            drain_failures(session).await;
        }
        self.stop_dispatcher(DISPATCHER_GRACE_PERIOD).await;
        SupervisorState::Backoff
    }

    /// Try to establish a new session until it succeeds or the shutdown signal is received.
    async fn backoff(&mut self) -> SupervisorState {
        let shutdown = self.shutdown.clone();
        loop {
            if shutdown.clone().now_or_never().is_some() {
                info!("Consumer received shutdown event, giving up on reconnecting");
                return SupervisorState::Shutdown;
            }

            info!("Establishing a session with RabbitMq");
            match self.manager.establish().await {
                Ok((session, deliveries)) => {
                    info!(consumer_tag = %session.consumer_tag(), "Session established, consuming");
                    self.start_dispatcher(deliveries);
                    self.session = Some(session);
                    return SupervisorState::Connected;
                }
                Err(e) => {
                    error!(
                        error = ?e,
                        phase = %e.phase,
                        "Failed to establish a session with RabbitMq, retrying in {:?}",
                        self.reconnect_delay
                    );
                    tokio::select! {
                        biased;

                        _ = shutdown.clone() => {
                            info!("Consumer received shutdown event, giving up on reconnecting");
                            return SupervisorState::Shutdown;
                        }
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
    }

    /// Cancel the consumer and close the connection, unless the broker already did it for us.
    ///
    /// Errors are logged and swallowed: nothing should stand in the way of reconnecting.
    async fn close_session(&self) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.connection.is_closed() {
            return;
        }
        if let Err(e) = session.channel.basic_cancel(&session.consumer_tag).await {
            error!(error = ?e, consumer_tag = %session.consumer_tag, "Failed to cancel the consumer");
        }
        if let Err(e) = session.connection.close().await {
            error!(error = ?e, "Failed to close the RabbitMq connection");
        }
    }

    fn start_dispatcher(&mut self, deliveries: DeliveryStream<DeliveryOf<T>>) {
        let dispatcher = self.dispatcher.clone();
        self.dispatcher_task = Some(tokio::spawn(async move {
            dispatcher.run(deliveries).await;
        }));
    }

    async fn stop_dispatcher(&mut self, grace_period: Duration) {
        let Some(mut task) = self.dispatcher_task.take() else {
            return;
        };
        match tokio::time::timeout(grace_period, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = ?e, "The message dispatcher crashed"),
            Err(_) => {
                warn!("The message dispatcher did not stop in time, aborting it");
                task.abort();
            }
        }
    }
}

/// Read both failure subscriptions of a dead session to the end.
///
/// Dropping the session handle here also releases the connection and the channel.
async fn drain_failures<T: Transport>(session: SessionHandle<T>) {
    let SessionHandle {
        connection_failures,
        channel_failures,
        ..
    } = session;
    for e in channel_failures.drain().await {
        error!(error = ?e, "RabbitMq channel failure");
    }
    for e in connection_failures.drain().await {
        error!(error = ?e, "RabbitMq connection failure");
    }
}
