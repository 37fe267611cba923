//! Facilities to publish messages to a RabbitMq exchange. Check out [`Publisher`] as a starting point.
mod confirm;
mod outbox;
mod publisher;

pub use confirm::{ConfirmationResult, PublisherConfirmGuard, DEFAULT_CONFIRM_TIMEOUT};
pub use outbox::{Outbox, OutboxClosed, DEFAULT_OUTBOX_CAPACITY, OUTBOX_CONTENT_TYPE};
pub use publisher::{PublishError, Publisher, PublisherBuilder};
