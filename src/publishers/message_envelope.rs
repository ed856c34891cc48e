use crate::amqp::convenience::set_header_str;
use amq_protocol_types::{ShortShortUInt, ShortString};
use lapin::BasicProperties;

/// A pre-serialized message to be published via [`Publisher::publish`].
///
/// [`Publisher::publish`]: super::Publisher::publish
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageEnvelope {
    /// The body of the message.
    pub payload: Vec<u8>,
    /// Empty for the default exchange.
    pub exchange_name: String,
    /// Used by the exchange to route the message. With the default exchange, the name of the
    /// destination queue.
    pub routing_key: String,
    pub properties: BasicProperties,
}

impl MessageEnvelope {
    pub fn new(
        exchange_name: impl Into<String>,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            payload,
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            properties: BasicProperties::default(),
        }
    }

    fn props(mut self, f: impl FnOnce(BasicProperties) -> BasicProperties) -> Self {
        self.properties = f(self.properties);
        self
    }

    #[must_use]
    pub fn with_properties(mut self, properties: BasicProperties) -> Self {
        self.properties = properties;
        self
    }

    #[must_use]
    pub fn with_correlation_id(self, value: impl Into<ShortString>) -> Self {
        self.props(|p| p.with_correlation_id(value.into()))
    }

    #[must_use]
    pub fn with_reply_to(self, value: impl Into<ShortString>) -> Self {
        self.props(|p| p.with_reply_to(value.into()))
    }

    #[must_use]
    pub fn with_message_id(self, value: impl Into<ShortString>) -> Self {
        self.props(|p| p.with_message_id(value.into()))
    }

    #[must_use]
    pub fn with_content_type(self, value: impl Into<ShortString>) -> Self {
        self.props(|p| p.with_content_type(value.into()))
    }

    #[must_use]
    pub fn with_priority(self, value: ShortShortUInt) -> Self {
        self.props(|p| p.with_priority(value))
    }

    #[must_use]
    pub fn with_expiration(self, value: impl Into<ShortString>) -> Self {
        self.props(|p| p.with_expiration(value.into()))
    }

    /// Add a string header.
    #[must_use]
    pub fn with_header(self, name: &str, value: &str) -> Self {
        self.props(|p| set_header_str(p, name, value))
    }
}
