use crate::amqp::transport::DeliveryStream;
use crate::consumers::{Delivery, Handler, Incoming};
use futures_util::StreamExt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// The action we asked the broker to take when finalising the processing of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAction {
    /// Positive acknowledgement - the message can be removed from the queue.
    Ack,
    /// Rejection with requeue - the message goes back to the queue and will be redelivered.
    Requeue,
}

/// `DeliveryDispatcher` drains a [`DeliveryStream`], hands every message over to the handler
/// and settles it with the broker according to the outcome.
///
/// | handler outcome      | broker action            |
/// |----------------------|--------------------------|
/// | `Ok(())`             | ack (single message)     |
/// | `Err(HandlerError)`  | reject, requeue = `true` |
/// | no handler           | reject, requeue = `true` |
///
/// The dispatcher is the only component settling deliveries.
pub struct DeliveryDispatcher<Context> {
    handler: Option<Arc<dyn Handler<Context>>>,
    context: Arc<Context>,
}

impl<Context> Clone for DeliveryDispatcher<Context> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            context: self.context.clone(),
        }
    }
}

impl<Context: Send + Sync + 'static> DeliveryDispatcher<Context> {
    pub fn new(handler: Option<Arc<dyn Handler<Context>>>, context: Arc<Context>) -> Self {
        Self { handler, context }
    }

    /// Process deliveries, one at a time and in arrival order, until the stream ends.
    ///
    /// The broker ends the stream when the channel or the connection goes away.
    pub async fn run<D: Delivery>(&self, mut deliveries: DeliveryStream<D>) {
        while let Some(next) = deliveries.next().await {
            match next {
                Ok(delivery) => {
                    self.dispatch(delivery).await;
                }
                Err(e) => {
                    warn!(error = ?e, "Consumer error, no more deliveries on this session");
                    break;
                }
            }
        }
        info!("Delivery stream closed");
    }

    /// Process a single delivery - handler, ack/reject against the AMQP broker.
    ///
    /// A failure to settle the message is logged: the broker will redeliver the message anyway
    /// once the channel is gone.
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(delivery_tag = delivery.delivery_tag()),
        level = tracing::Level::DEBUG
    )]
    pub async fn dispatch<D: Delivery>(&self, delivery: D) -> BrokerAction {
        let action = match &self.handler {
            None => {
                warn!("No message handler configured, requeueing the message");
                BrokerAction::Requeue
            }
            Some(handler) => {
                let incoming = Incoming {
                    context: self.context.clone(),
                    body: delivery.body(),
                    delivery_tag: delivery.delivery_tag(),
                };
                match handler.handle(incoming).await {
                    Ok(()) => BrokerAction::Ack,
                    Err(e) => {
                        warn!(error = ?e.inner_error(), "Handling of a message failed, requeueing it");
                        BrokerAction::Requeue
                    }
                }
            }
        };

        let outcome = match action {
            BrokerAction::Ack => delivery.acknowledge().await,
            BrokerAction::Requeue => delivery.reject(true).await,
        };
        if let Err(e) = outcome {
            error!(error = ?e, ?action, "Failed to settle the message with the broker");
        }
        action
    }
}
