use crate::serialization::DefaultSerializer;
use crate::services::ServiceLookup;
use crate::telemetry::TraceContext;
use crate::transport::{BrokerChannel, ChannelFactory};
use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::BasicProperties;
use std::borrow::Cow;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A message received from RabbitMq.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    /// Empty if the default exchange was used.
    pub exchange: ShortString,
    pub routing_key: ShortString,
    pub redelivered: bool,
    /// Properties and headers.
    pub properties: BasicProperties,
    /// The raw body.
    pub data: Vec<u8>,
}

impl Delivery {
    pub fn new(delivery_tag: DeliveryTag, properties: BasicProperties, data: Vec<u8>) -> Self {
        Self {
            delivery_tag,
            exchange: ShortString::from(""),
            routing_key: ShortString::from(""),
            redelivered: false,
            properties,
            data,
        }
    }

    /// The body as text, for diagnostics.
    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

impl From<lapin::message::Delivery> for Delivery {
    fn from(value: lapin::message::Delivery) -> Self {
        Self {
            delivery_tag: value.delivery_tag,
            exchange: value.exchange,
            routing_key: value.routing_key,
            redelivered: value.redelivered,
            properties: value.properties,
            data: value.data,
        }
    }
}

/// A delivery together with the handles needed to process it.
///
/// This is what the consumer loop hands over to a [`Dispatch`](super::Dispatch)
/// implementation.
pub struct Inbound {
    pub delivery: Delivery,
    /// The channel the delivery was received on. It must be settled on this channel.
    pub channel: Arc<dyn BrokerChannel>,
    /// Shared connection, to publish on a channel other than the consuming one.
    pub connection: Arc<dyn ChannelFactory>,
    /// Cancelled when the host shuts down.
    pub cancellation: CancellationToken,
}

/// Everything known about a delivery while its handler runs.
///
/// A context is built for a single delivery and is gone by the time the message is
/// acknowledged (or rejected).
pub struct DispatchContext<'a, M, S = DefaultSerializer> {
    pub delivery: &'a Delivery,
    pub channel: &'a Arc<dyn BrokerChannel>,
    pub connection: &'a Arc<dyn ChannelFactory>,
    pub queue_name: &'a str,
    /// The deserialized body.
    pub message: Arc<M>,
    /// Resolves services from the root provider or from the scope of this delivery.
    pub services: ServiceLookup<'a>,
    pub serializer: &'a S,
    pub cancellation: &'a CancellationToken,
    /// The trace this delivery is processed under.
    pub trace: &'a TraceContext,
}
