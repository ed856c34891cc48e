use super::context::Delivery;
use crate::transport::BrokerChannel;
use lapin::options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions};

/// How a delivery is settled with the broker once processing is over.
///
/// Handlers can return one explicitly through
/// [`HandlerOutcome::Action`](super::HandlerOutcome::Action); otherwise it is derived from
/// the outcome of processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultAction {
    /// The message was processed and can be removed from the queue.
    Acknowledge,
    /// The message was not processed. It goes back to the queue if `requeue` is set,
    /// to the dead letter exchange (if any) otherwise.
    NegativeAcknowledge { requeue: bool },
    /// The message is refused.
    Reject { requeue: bool },
}

impl ResultAction {
    /// Settle `delivery` on `channel`. Exactly one call is made to the broker and it only
    /// covers this delivery.
    pub async fn execute(
        self,
        channel: &dyn BrokerChannel,
        delivery: &Delivery,
    ) -> Result<(), anyhow::Error> {
        let delivery_tag = delivery.delivery_tag;
        match self {
            Self::Acknowledge => {
                channel
                    .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
                    .await
            }
            Self::NegativeAcknowledge { requeue } => {
                channel
                    .basic_nack(
                        delivery_tag,
                        BasicNackOptions {
                            multiple: false,
                            requeue,
                        },
                    )
                    .await
            }
            Self::Reject { requeue } => {
                channel
                    .basic_reject(delivery_tag, BasicRejectOptions { requeue })
                    .await
            }
        }
    }

    /// `true` if the message goes back to the queue.
    pub fn requeues(&self) -> bool {
        match self {
            Self::Acknowledge => false,
            Self::NegativeAcknowledge { requeue } | Self::Reject { requeue } => *requeue,
        }
    }
}
