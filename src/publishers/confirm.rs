use crate::amqp::transport::{BrokerChannel, PendingConfirm};
use amq_protocol_types::DeliveryTag;
use lapin::publisher_confirm::Confirmation;
use std::time::Duration;
use tracing::{error, warn};

/// How long the guard waits for the broker to confirm a message, by default.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// The verdict of the broker on a published message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationResult {
    pub delivery_tag: DeliveryTag,
    /// `false` if the broker nacked the message.
    pub acknowledged: bool,
}

/// `PublisherConfirmGuard` waits for the broker to confirm messages published on a channel in
/// confirm mode.
///
/// Confirmations are for observability only: a negative acknowledgement, or no confirmation at
/// all within the timeout, is logged as an error and nothing else.
#[derive(Debug)]
pub struct PublisherConfirmGuard {
    timeout: Duration,
    /// The broker numbers messages, starting from 1, from the moment the channel enters
    /// confirm mode.
    next_delivery_tag: DeliveryTag,
}

impl PublisherConfirmGuard {
    /// Put `channel` in confirm mode.
    pub async fn engage<C: BrokerChannel>(
        channel: &C,
        timeout: Duration,
    ) -> Result<Self, anyhow::Error> {
        channel.confirm_select().await?;
        Ok(Self {
            timeout,
            next_delivery_tag: 1,
        })
    }

    /// Wait for the confirmation of the next published message.
    ///
    /// Returns `None` if no confirmation could be retrieved.
    pub async fn confirm_one(&mut self, pending: PendingConfirm) -> Option<ConfirmationResult> {
        let delivery_tag = self.next_delivery_tag;
        self.next_delivery_tag += 1;

        let confirmation = match tokio::time::timeout(self.timeout, pending).await {
            Ok(Ok(confirmation)) => confirmation,
            Ok(Err(e)) => {
                error!(error = ?e, delivery_tag, "Failed to receive the publisher confirmation");
                return None;
            }
            Err(_) => {
                error!(
                    delivery_tag,
                    "Timed out after {:?} waiting for the publisher confirmation", self.timeout
                );
                return None;
            }
        };

        let acknowledged = match confirmation {
            Confirmation::Ack(_) => true,
            Confirmation::Nack(_) => false,
            Confirmation::NotRequested => {
                warn!(delivery_tag, "The channel is not in confirm mode");
                return None;
            }
        };
        if !acknowledged {
            error!(delivery_tag, "Failed delivery of delivery tag {}", delivery_tag);
        }
        Some(ConfirmationResult {
            delivery_tag,
            acknowledged,
        })
    }
}
