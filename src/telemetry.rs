//! Trace propagation across message boundaries.
//!
//! Traces travel with the messages as two string headers, `TraceId` and `SpanId`.
//! Consumers pick them up when a message is received; publishers stamp the current
//! context on every outbound message.
use crate::amqp::convenience::{set_header_str, BasicPropertiesExt};
use lapin::BasicProperties;
use std::borrow::Cow;
use uuid::Uuid;

pub const TRACE_ID_HEADER: &str = "TraceId";
pub const SPAN_ID_HEADER: &str = "SpanId";

const DEFAULT_SOURCE: &str = "carrot-dispatch";

/// The instrumentation source recorded on every span opened by consumers, publishers
/// and serializers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryConfig {
    pub source: Cow<'static, str>,
}

impl TelemetryConfig {
    pub fn new(source: impl Into<Cow<'static, str>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_SOURCE)
    }
}

/// A (trace id, span id) pair.
///
/// Trace ids are 32 lowercase hex characters, span ids 16.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Start a brand new trace.
    pub fn new_root() -> Self {
        Self {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
        }
    }

    /// A new span within the same trace.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
        }
    }

    /// Read the trace context carried by a message, if any.
    ///
    /// A message carrying a `TraceId` but no `SpanId` still joins the trace.
    pub fn extract(properties: &BasicProperties) -> Option<Self> {
        let trace_id = properties
            .get_header_str(TRACE_ID_HEADER)
            .filter(|id| !id.trim().is_empty())?;
        let span_id = properties
            .get_header_str(SPAN_ID_HEADER)
            .map(Cow::into_owned)
            .unwrap_or_else(new_span_id);
        Some(Self {
            trace_id: trace_id.into_owned(),
            span_id,
        })
    }

    /// Continue the trace of an inbound message, or start a new one.
    ///
    /// The returned context always has a fresh span id.
    pub fn continue_from(properties: &BasicProperties) -> Self {
        Self::extract(properties)
            .map(|parent| parent.child())
            .unwrap_or_else(Self::new_root)
    }

    /// Write the trace headers on a set of outbound properties.
    pub fn inject(&self, properties: BasicProperties) -> BasicProperties {
        let properties = set_header_str(properties, TRACE_ID_HEADER, &self.trace_id);
        set_header_str(properties, SPAN_ID_HEADER, &self.span_id)
    }
}

fn new_span_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(16);
    id
}
