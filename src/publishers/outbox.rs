use crate::amqp::transport::Transport;
use crate::publishers::Publisher;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// How many messages can wait in an [`Outbox`] before senders are slowed down.
pub const DEFAULT_OUTBOX_CAPACITY: usize = 10;

/// Content type of the messages published through an [`Outbox`].
pub const OUTBOX_CONTENT_TYPE: &str = "text/plain";

/// A bounded queue of messages waiting to be published, drained by a background task.
///
/// The background task publishes one message at a time, in order, using its [`Publisher`].
/// Publishing failures are logged and the message is dropped.
/// The task stops when every `Outbox` handle has been dropped and the queue is empty.
#[derive(Clone, Debug)]
pub struct Outbox(mpsc::Sender<Vec<u8>>);

/// The background task of the [`Outbox`] has stopped.
#[derive(thiserror::Error, Debug)]
#[error("The outbox is closed")]
pub struct OutboxClosed;

impl Outbox {
    /// Spawn the background task publishing messages with `publisher`.
    pub fn spawn<T: Transport>(publisher: Publisher<T>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (sender, mut receiver) = mpsc::channel::<Vec<u8>>(capacity);
        let task = tokio::spawn(async move {
            while let Some(body) = receiver.recv().await {
                if let Err(e) = publisher.publish(OUTBOX_CONTENT_TYPE, &body).await {
                    error!(error = ?e, "Failed to publish a message from the outbox");
                }
            }
        });
        (Self(sender), task)
    }

    /// Queue `body` for publishing, waiting for room if the outbox is full.
    pub async fn send(&self, body: impl Into<Vec<u8>>) -> Result<(), OutboxClosed> {
        let body = body.into();
        info!(body = %String::from_utf8_lossy(&body), "Queueing a message for publishing");
        self.0.send(body).await.map_err(|_| OutboxClosed)
    }
}
