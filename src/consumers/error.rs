use std::fmt;

/// The error type returned by message handlers.
///
/// It is opaque on purpose: whatever went wrong, the message is rejected and requeued so that
/// the broker can redeliver it.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct HandlerError(#[from] anyhow::Error);

impl HandlerError {
    pub fn inner_error(&self) -> &anyhow::Error {
        &self.0
    }
}

/// The step of session establishment that failed.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionPhase {
    Dial,
    Channel,
    Exchange,
    Queue,
    Bind,
    Consume,
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::Dial => "dial",
            Self::Channel => "channel",
            Self::Exchange => "exchange",
            Self::Queue => "queue",
            Self::Bind => "bind",
            Self::Consume => "consume",
        };
        f.write_str(phase)
    }
}

/// Failed to establish a consuming session with the broker.
///
/// All connection errors are transient from the point of view of the consumer: it will try again
/// after a back-off period.
#[derive(thiserror::Error, Debug)]
#[error("Failed to establish a session with RabbitMq ({phase} phase)")]
pub struct ConnectionError {
    pub phase: SessionPhase,
    #[source]
    pub source: anyhow::Error,
}

impl ConnectionError {
    pub(crate) fn new(phase: SessionPhase, source: anyhow::Error) -> Self {
        Self { phase, source }
    }
}
