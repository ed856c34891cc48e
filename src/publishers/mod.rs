//! Facilities to publish messages to a RabbitMq exchange.
//! Check out [`Publisher`] as a starting point.
mod message_envelope;
mod publisher;

pub use message_envelope::MessageEnvelope;
pub use publisher::{Publisher, PublisherBuilder, PublisherError, Via};
