use super::MessageEnvelope;
use crate::amqp::convenience::{ensure_headers, BasicPropertiesExt};
use crate::serialization::{DefaultSerializer, SerializationError, Serializer};
use crate::telemetry::{TelemetryConfig, TraceContext};
use crate::transport::{BrokerChannel, ChannelFactory};
use lapin::{options::BasicPublishOptions, BasicProperties};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{field, warn, Instrument};
use uuid::Uuid;

/// Delivery mode: non-persistent (1) or persistent (2).
const PERSISTENT: u8 = 2;

/// Where to publish.
#[derive(Clone, Copy)]
pub enum Via<'a> {
    /// Open a new channel for this message.
    Connection(&'a dyn ChannelFactory),
    /// Publish on a channel owned by the caller, e.g. the one a request was received on.
    Channel(&'a dyn BrokerChannel),
}

/// A high-level interface to publish messages.
///
/// Every message leaves with:
///
/// - delivery mode 2 (durable);
/// - the content type of the serializer;
/// - a message id and a timestamp, unless already set;
/// - a header table, carrying the `TraceId` and `SpanId` headers.
///
/// # How do I build a `Publisher`?
///
/// The starting point is [`Publisher::builder`].
///
/// ```rust
/// use carrot_dispatch::publishers::{Publisher, Via};
/// use carrot_dispatch::serialization::DefaultSerializer;
/// use carrot_dispatch::transport::memory::MemoryConnection;
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), carrot_dispatch::publishers::PublisherError> {
/// let publisher = Publisher::builder(Arc::new(DefaultSerializer::default()))
///     .publish_timeout(std::time::Duration::from_secs(5))
///     .build();
///
/// let connection = MemoryConnection::new();
/// publisher
///     .send(Via::Connection(connection.as_ref()), "payments", "payment.created", &42)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Publisher<S = DefaultSerializer> {
    serializer: Arc<S>,
    timeout: Duration,
    telemetry: TelemetryConfig,
}

impl<S: Serializer> Publisher<S> {
    /// Start building a [`Publisher`].
    pub fn builder(serializer: Arc<S>) -> PublisherBuilder<S> {
        PublisherBuilder::new(serializer)
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Serialize `message` and publish it as the root of a new trace.
    ///
    /// Use [`Publisher::send_in`] when publishing while processing a delivery.
    pub async fn send<T: Serialize + ?Sized>(
        &self,
        via: Via<'_>,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), PublisherError> {
        self.send_with(BasicProperties::default(), via, exchange, routing_key, message)
            .await
    }

    /// Serialize `message` and publish it in a child span of `trace`, e.g. the trace of
    /// the delivery being processed.
    pub async fn send_in<T: Serialize + ?Sized>(
        &self,
        trace: &TraceContext,
        via: Via<'_>,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), PublisherError> {
        let properties = trace.child().inject(BasicProperties::default());
        self.send_with(properties, via, exchange, routing_key, message)
            .await
    }

    async fn send_with<T: Serialize + ?Sized>(
        &self,
        properties: BasicProperties,
        via: Via<'_>,
        exchange: &str,
        routing_key: &str,
        message: &T,
    ) -> Result<(), PublisherError> {
        let properties = self.outbound_properties(properties);
        let payload = self.serializer.serialize(&properties, message)?;
        self.publish_prepared(
            via,
            MessageEnvelope {
                payload,
                exchange_name: exchange.to_owned(),
                routing_key: routing_key.to_owned(),
                properties,
            },
        )
        .await
    }

    /// Publish a pre-serialized message.
    ///
    /// Properties already set on the envelope are kept, except for the delivery mode.
    pub async fn publish(
        &self,
        via: Via<'_>,
        envelope: MessageEnvelope,
    ) -> Result<(), PublisherError> {
        let properties = self.outbound_properties(envelope.properties.clone());
        self.publish_prepared(
            via,
            MessageEnvelope {
                properties,
                ..envelope
            },
        )
        .await
    }

    async fn publish_prepared(
        &self,
        via: Via<'_>,
        envelope: MessageEnvelope,
    ) -> Result<(), PublisherError> {
        let MessageEnvelope {
            payload,
            exchange_name,
            routing_key,
            properties,
        } = envelope;

        let span = tracing::info_span!(
            "publish",
            otel.kind = "producer",
            otel.status_code = field::Empty,
            messaging.destination = %exchange_name,
            messaging.routing_key = %routing_key,
            messaging.message_id = properties.message_id_str(),
            messaging.correlation_id = properties.correlation_id_str(),
            trace_id = properties.get_header_str(crate::telemetry::TRACE_ID_HEADER).as_deref(),
            span_id = properties.get_header_str(crate::telemetry::SPAN_ID_HEADER).as_deref(),
            source = %self.telemetry.source,
        );

        // Acquiring the channel and publishing share the same timeout.
        let publish = async {
            let opened;
            let channel: &dyn BrokerChannel = match via {
                Via::Channel(channel) => channel,
                Via::Connection(connection) => {
                    opened = connection
                        .create_channel()
                        .await
                        .map_err(PublisherError::Channel)?;
                    opened.as_ref()
                }
            };
            channel
                .basic_publish(
                    &exchange_name,
                    &routing_key,
                    BasicPublishOptions::default(),
                    &payload,
                    properties,
                )
                .await
                .map_err(PublisherError::Broker)
        };

        let result = match tokio::time::timeout(self.timeout, publish)
            .instrument(span.clone())
            .await
        {
            Ok(result) => result,
            Err(_) => Err(PublisherError::Timeout),
        };
        if let Err(e) = &result {
            span.record("otel.status_code", "ERROR");
            span.in_scope(|| warn!("Failed to publish message: {}", e));
        }
        result
    }

    fn outbound_properties(&self, properties: BasicProperties) -> BasicProperties {
        let headers = ensure_headers(&properties);
        let properties = properties
            .with_delivery_mode(PERSISTENT)
            .with_headers(headers);

        let properties = match properties.content_type() {
            Some(_) => properties,
            None => properties.with_content_type(self.serializer.content_type().into()),
        };

        let properties = match properties.message_id() {
            Some(_) => properties,
            None => properties.with_message_id(Uuid::new_v4().to_string().into()),
        };

        let properties = match (properties.timestamp(), current_timestamp()) {
            (None, Some(now)) => properties.with_timestamp(now),
            _ => properties,
        };

        TraceContext::extract(&properties)
            .unwrap_or_else(TraceContext::new_root)
            .inject(properties)
    }
}

fn current_timestamp() -> Option<u64> {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(now) => Some(now.as_secs()),
        Err(_) => {
            warn!("System time is before 1970");
            None
        }
    }
}

/// Error returned when trying to publish a message using [`Publisher`].
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Failed to serialize the message")]
    Serialization(#[from] SerializationError),
    #[error("Failed to open a channel to the RabbitMq broker")]
    Channel(#[source] anyhow::Error),
    #[error("The RabbitMq broker did not accept the message")]
    Broker(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while trying to publish the message")]
    Timeout,
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<S> {
    serializer: Arc<S>,
    timeout: Duration,
    telemetry: TelemetryConfig,
}

impl<S: Serializer> PublisherBuilder<S> {
    fn new(serializer: Arc<S>) -> Self {
        Self {
            serializer,
            timeout: Duration::from_secs(3),
            telemetry: TelemetryConfig::default(),
        }
    }

    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn build(self) -> Publisher<S> {
        Publisher {
            serializer: self.serializer,
            timeout: self.timeout,
            telemetry: self.telemetry,
        }
    }
}
