use super::binding::{BinderConfigurationError, BinderSet, HandlerSignature};
use super::context::Inbound;
use super::dispatch::{record_outcome, Dispatch, DispatchOptions, Invocation, Pipeline};
use super::error::{error_chain, DispatchError, ProcessingOutcome};
use super::handler::{Handler, HandlerOutcome};
use super::result_action::ResultAction;
use crate::amqp::convenience::{set_header_str, BasicPropertiesExt};
use crate::publishers::{MessageEnvelope, Publisher, PublisherError, Via};
use crate::serialization::{DefaultSerializer, Serializer};
use crate::services::ServiceProvider;
use crate::telemetry::TraceContext;
use lapin::BasicProperties;
use serde::{de::DeserializeOwned, Serialize};
use std::any::type_name;
use std::sync::Arc;
use std::time::Instant;
use tracing::{field, Instrument};
use uuid::Uuid;

/// Header carrying the failure of a request on an error reply.
pub const EXCEPTION_HEADER: &str = "Exception";

/// Runs a request/reply handler for every message of a queue.
///
/// Requests must carry a `reply-to` address: requests without one are rejected (without
/// requeue) before being deserialized. The value returned by the handler is published to
/// the `reply-to` queue through the default exchange, with the `correlation-id` of the
/// request, and only then is the request acknowledged.
///
/// If processing fails, an empty reply carrying the failure in its `Exception` header is
/// published and the request is negatively acknowledged. A handler returning a
/// [`ResultAction`] explicitly gets no reply.
pub struct RpcConsumer<M, H, S = DefaultSerializer> {
    pipeline: Pipeline<M, H, S>,
    publisher: Publisher<S>,
}

impl<M, H, S> RpcConsumer<M, H, S>
where
    M: DeserializeOwned + Default + Send + Sync + 'static,
    H: Handler<M>,
    H::Output: Serialize,
    S: Serializer,
{
    pub fn new(
        signature: HandlerSignature<M, S>,
        handler: H,
        serializer: Arc<S>,
        services: Arc<dyn ServiceProvider>,
        options: DispatchOptions,
    ) -> Result<Self, BinderConfigurationError> {
        let binders = BinderSet::build(&signature)?;
        Ok(Self::with_binders(
            binders, handler, serializer, services, options,
        ))
    }

    /// Build from an already validated [`BinderSet`].
    pub fn with_binders(
        binders: BinderSet<M, S>,
        handler: H,
        serializer: Arc<S>,
        services: Arc<dyn ServiceProvider>,
        options: DispatchOptions,
    ) -> Self {
        let publisher = Publisher::builder(Arc::clone(&serializer))
            .telemetry(options.telemetry.clone())
            .build();
        Self {
            pipeline: Pipeline {
                binders,
                handler,
                serializer,
                services,
                options,
            },
            publisher,
        }
    }

    async fn process(
        &self,
        queue_name: &str,
        inbound: &Inbound,
        trace: &TraceContext,
    ) -> ProcessingOutcome {
        let pipeline = &self.pipeline;
        let properties = &inbound.delivery.properties;

        let reply_to = match properties.reply_to_str() {
            Some(reply_to) => reply_to,
            None => {
                tracing::warn!(
                    message_type = type_name::<M>(),
                    queue_name,
                    correlation_id = properties.correlation_id_str(),
                    "Received a request without a reply-to address, rejecting it."
                );
                return pipeline
                    .settle(
                        ResultAction::Reject { requeue: false },
                        inbound,
                        Err(DispatchError::MissingReplyTo),
                    )
                    .await;
            }
        };

        let Invocation { result, scope } = pipeline.invoke(queue_name, inbound, trace).await;

        let (action, outcome) = match result {
            Ok(HandlerOutcome::Value(response)) => {
                match self.reply(inbound, reply_to, trace, response).await {
                    Ok(()) => (ResultAction::Acknowledge, Ok(())),
                    Err(e) => {
                        let e = DispatchError::Reply(e);
                        pipeline.report_fault(queue_name, inbound, &e);
                        (pipeline.fault_action(inbound, &e), Err(e))
                    }
                }
            }
            Ok(HandlerOutcome::Action(action)) => (action, Ok(())),
            Err(e) => {
                pipeline.report_fault(queue_name, inbound, &e);
                // A cancelled request is redelivered: whoever processes it next replies.
                if !matches!(e, DispatchError::Cancelled) {
                    if let Err(reply_error) =
                        self.reply_error(inbound, reply_to, trace, &e).await
                    {
                        tracing::error!(
                            queue_name,
                            reply_to,
                            "Failed to publish the error reply: {}",
                            error_chain(&reply_error)
                        );
                    }
                }
                (pipeline.fault_action(inbound, &e), Err(e))
            }
        };

        let outcome = pipeline.settle(action, inbound, outcome).await;
        drop(scope);
        outcome
    }

    async fn reply(
        &self,
        inbound: &Inbound,
        reply_to: &str,
        trace: &TraceContext,
        response: H::Output,
    ) -> Result<(), PublisherError> {
        let properties = reply_properties(&inbound.delivery.properties, trace);
        let payload = self.publisher.serializer().serialize(&properties, &response)?;
        self.send_reply(inbound, reply_to, properties, payload)
            .await
    }

    async fn reply_error(
        &self,
        inbound: &Inbound,
        reply_to: &str,
        trace: &TraceContext,
        error: &DispatchError,
    ) -> Result<(), PublisherError> {
        let properties = set_header_str(
            reply_properties(&inbound.delivery.properties, trace),
            EXCEPTION_HEADER,
            &error_chain(error),
        );
        self.send_reply(inbound, reply_to, properties, Vec::new())
            .await
    }

    async fn send_reply(
        &self,
        inbound: &Inbound,
        reply_to: &str,
        properties: BasicProperties,
        payload: Vec<u8>,
    ) -> Result<(), PublisherError> {
        let span = tracing::info_span!(
            "rpc_reply",
            otel.kind = "client",
            otel.status_code = field::Empty,
            messaging.destination = reply_to,
            messaging.message_id = properties.message_id_str(),
            messaging.correlation_id = properties.correlation_id_str(),
            trace_id = properties.get_header_str(crate::telemetry::TRACE_ID_HEADER).as_deref(),
            span_id = properties.get_header_str(crate::telemetry::SPAN_ID_HEADER).as_deref(),
        );

        let envelope = MessageEnvelope {
            payload,
            exchange_name: String::new(),
            routing_key: reply_to.to_owned(),
            properties,
        };
        let result = self
            .publisher
            .publish(Via::Channel(inbound.channel.as_ref()), envelope)
            .instrument(span.clone())
            .await;
        if result.is_err() {
            span.record("otel.status_code", "ERROR");
        }
        result
    }
}

/// Correlation and trace properties of a reply to `request`.
fn reply_properties(request: &BasicProperties, trace: &TraceContext) -> BasicProperties {
    let properties = trace
        .child()
        .inject(BasicProperties::default())
        .with_message_id(Uuid::new_v4().to_string().into());
    match request.correlation_id() {
        Some(correlation_id) => properties.with_correlation_id(correlation_id.clone()),
        None => properties,
    }
}

#[async_trait::async_trait]
impl<M, H, S> Dispatch for RpcConsumer<M, H, S>
where
    M: DeserializeOwned + Default + Send + Sync + 'static,
    H: Handler<M>,
    H::Output: Serialize,
    S: Serializer,
{
    async fn dispatch(&self, queue_name: &str, inbound: Inbound) -> ProcessingOutcome {
        let trace = TraceContext::continue_from(&inbound.delivery.properties);
        let span = self.pipeline.receive_span(queue_name, &inbound, &trace);
        let started = Instant::now();

        let outcome = self
            .process(queue_name, &inbound, &trace)
            .instrument(span.clone())
            .await;
        record_outcome(&span, &outcome, started);
        outcome
    }
}
