use super::{SerializationError, Serializer};
use crate::amqp::convenience::BasicPropertiesExt;
use crate::telemetry::TelemetryConfig;
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};
use std::any::type_name;
use tracing::{field, Span};

/// Wraps a [`Serializer`] in a `serialize`/`deserialize` span.
///
/// Failures are recorded on the span and handed back untouched.
#[derive(Debug, Clone, Default)]
pub struct Traced<S> {
    inner: S,
    telemetry: TelemetryConfig,
}

impl<S> Traced<S> {
    pub fn new(inner: S, telemetry: TelemetryConfig) -> Self {
        Self { inner, telemetry }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

fn record_outcome<T>(span: &Span, result: &Result<T, SerializationError>) {
    if let Err(e) = result {
        span.record("otel.status_code", "ERROR");
        span.record("exception.message", field::display(e));
    }
}

impl<S: Serializer> Serializer for Traced<S> {
    fn content_type(&self) -> &'static str {
        self.inner.content_type()
    }

    fn serialize<T>(
        &self,
        properties: &BasicProperties,
        value: &T,
    ) -> Result<Vec<u8>, SerializationError>
    where
        T: Serialize + ?Sized,
    {
        let span = tracing::info_span!(
            "serialize",
            otel.kind = "internal",
            otel.status_code = field::Empty,
            exception.message = field::Empty,
            message_id = properties.message_id_str(),
            message_type = type_name::<T>(),
            source = %self.telemetry.source,
        );
        let result = span.in_scope(|| self.inner.serialize(properties, value));
        record_outcome(&span, &result);
        result
    }

    fn deserialize<T>(
        &self,
        properties: &BasicProperties,
        body: &[u8],
    ) -> Result<T, SerializationError>
    where
        T: DeserializeOwned + Default,
    {
        let span = tracing::info_span!(
            "deserialize",
            otel.kind = "internal",
            otel.status_code = field::Empty,
            exception.message = field::Empty,
            message_id = properties.message_id_str(),
            message_type = type_name::<T>(),
            source = %self.telemetry.source,
        );
        let result = span.in_scope(|| self.inner.deserialize(properties, body));
        record_outcome(&span, &result);
        result
    }
}
