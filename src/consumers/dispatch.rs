use super::binding::{BinderConfigurationError, BinderSet, HandlerSignature};
use super::context::{DispatchContext, Inbound};
use super::error::{error_chain, DispatchError, ProcessingOutcome};
use super::handler::{Handler, HandlerOutcome};
use super::result_action::ResultAction;
use crate::amqp::convenience::BasicPropertiesExt;
use crate::serialization::{DefaultSerializer, Serializer};
use crate::services::{DispatchScope, ServiceLookup, ServiceProvider, ServiceScope};
use crate::telemetry::{TelemetryConfig, TraceContext};
use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use std::any::{type_name, Any};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{field, Instrument, Span};

/// Processes one delivery at a time, settling it with the broker.
///
/// Implemented by [`QueueConsumer`] and [`RpcConsumer`](super::RpcConsumer).
#[async_trait::async_trait]
pub trait Dispatch: Send + Sync + 'static {
    /// Process `inbound`, executing exactly one [`ResultAction`] against its channel.
    async fn dispatch(&self, queue_name: &str, inbound: Inbound) -> ProcessingOutcome;
}

/// How a consumer resolves services and reacts to failures.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub scope: DispatchScope,
    /// Requeue deliveries whose processing failed.
    pub requeue_on_fault: bool,
    pub telemetry: TelemetryConfig,
}

impl DispatchOptions {
    pub fn new(scope: DispatchScope, requeue_on_fault: bool) -> Self {
        Self {
            scope,
            requeue_on_fault,
            telemetry: TelemetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.telemetry = telemetry;
        self
    }
}

/// Deserialization, scoping, binding and invocation: what queue and request/reply
/// consumers have in common.
pub(super) struct Pipeline<M, H, S> {
    pub(super) binders: BinderSet<M, S>,
    pub(super) handler: H,
    pub(super) serializer: Arc<S>,
    pub(super) services: Arc<dyn ServiceProvider>,
    pub(super) options: DispatchOptions,
}

/// The result of running the handler, plus the scope created for the delivery (if any).
///
/// The scope must outlive the settlement of the delivery.
pub(super) struct Invocation<T> {
    pub(super) result: Result<HandlerOutcome<T>, DispatchError>,
    pub(super) scope: Option<Box<dyn ServiceScope>>,
}

impl<M, H, S> Pipeline<M, H, S>
where
    M: DeserializeOwned + Default + Send + Sync + 'static,
    H: Handler<M>,
    S: Serializer,
{
    pub(super) async fn invoke(
        &self,
        queue_name: &str,
        inbound: &Inbound,
        trace: &TraceContext,
    ) -> Invocation<H::Output> {
        let delivery = &inbound.delivery;
        let message: M = match self
            .serializer
            .deserialize(&delivery.properties, &delivery.data)
        {
            Ok(message) => message,
            Err(e) => return Invocation::failed(e.into()),
        };

        if inbound.cancellation.is_cancelled() {
            return Invocation::failed(DispatchError::Cancelled);
        }

        let scope = match self.options.scope {
            DispatchScope::RootScope => None,
            DispatchScope::ChildScope => match self.services.create_scope().await {
                Ok(scope) => Some(scope),
                Err(e) => return Invocation::failed(DispatchError::Scope(e)),
            },
        };

        let arguments = {
            let services = match &scope {
                Some(scope) => ServiceLookup::Scoped(scope.as_ref()),
                None => ServiceLookup::Root(self.services.as_ref()),
            };
            let context = DispatchContext {
                delivery,
                channel: &inbound.channel,
                connection: &inbound.connection,
                queue_name,
                message: Arc::new(message),
                services,
                serializer: self.serializer.as_ref(),
                cancellation: &inbound.cancellation,
                trace,
            };
            self.binders.evaluate(&context)
        };

        let result = match arguments {
            // A panicking handler still gets its delivery settled.
            Ok(arguments) => match AssertUnwindSafe(self.handler.handle(arguments))
                .catch_unwind()
                .await
            {
                Ok(result) => result.map_err(DispatchError::Handler),
                Err(panic) => Err(DispatchError::Handler(anyhow::anyhow!(
                    "The handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            },
            Err(e) => Err(e.into()),
        };
        Invocation { result, scope }
    }

    /// Log a failed delivery with everything needed to replay it.
    pub(super) fn report_fault(&self, queue_name: &str, inbound: &Inbound, error: &DispatchError) {
        let body = inbound.delivery.body_text();
        match error {
            DispatchError::Cancelled => tracing::warn!(
                message_type = type_name::<M>(),
                queue_name,
                "Shutting down, the message will be requeued."
            ),
            error => tracing::error!(
                message_type = type_name::<M>(),
                queue_name,
                body = %body,
                error = %error_chain(error),
                "Failed to process message of type {} from queue {}: {}",
                type_name::<M>(),
                queue_name,
                error_chain(error)
            ),
        }
    }

    /// How to settle a delivery whose processing failed.
    ///
    /// Anything failing while the host is shutting down goes back to the queue.
    pub(super) fn fault_action(&self, inbound: &Inbound, error: &DispatchError) -> ResultAction {
        let requeue = matches!(error, DispatchError::Cancelled)
            || inbound.cancellation.is_cancelled()
            || self.options.requeue_on_fault;
        ResultAction::NegativeAcknowledge { requeue }
    }

    /// Execute `action`, folding a broker failure into the outcome.
    pub(super) async fn settle(
        &self,
        action: ResultAction,
        inbound: &Inbound,
        outcome: Result<(), DispatchError>,
    ) -> ProcessingOutcome {
        let outcome = match action.execute(inbound.channel.as_ref(), &inbound.delivery).await {
            Ok(()) => outcome,
            Err(e) => {
                tracing::error!(
                    delivery_tag = inbound.delivery.delivery_tag,
                    ?action,
                    "Failed to settle message: {:?}",
                    e
                );
                // Keep the processing error if there is one.
                outcome.and(Err(DispatchError::ResultAction(e)))
            }
        };
        ProcessingOutcome::new(action, outcome)
    }

    pub(super) fn receive_span(
        &self,
        queue_name: &str,
        inbound: &Inbound,
        trace: &TraceContext,
    ) -> Span {
        let properties = &inbound.delivery.properties;
        tracing::info_span!(
            "receive",
            otel.kind = "consumer",
            otel.status_code = field::Empty,
            messaging.destination = queue_name,
            messaging.message_id = properties.message_id_str(),
            messaging.correlation_id = properties.correlation_id_str(),
            delivery_tag = inbound.delivery.delivery_tag,
            message_type = type_name::<M>(),
            trace_id = %trace.trace_id,
            span_id = %trace.span_id,
            source = %self.options.telemetry.source,
        )
    }
}

impl<T> Invocation<T> {
    fn failed(error: DispatchError) -> Self {
        Self {
            result: Err(error),
            scope: None,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}

pub(super) fn record_outcome(span: &Span, outcome: &ProcessingOutcome, started: Instant) {
    if outcome.result().is_err() {
        span.record("otel.status_code", "ERROR");
    }
    span.in_scope(|| {
        tracing::debug!(
            action = ?outcome.action(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Message processed."
        )
    });
}

/// Runs a handler for every message of a queue.
///
/// - the handler returns a value: the message is acknowledged;
/// - the handler returns a [`ResultAction`]: that action is executed;
/// - deserialization, binding or the handler fail: the failure is logged and the message
///   is negatively acknowledged, requeued according to
///   [`DispatchOptions::requeue_on_fault`].
pub struct QueueConsumer<M, H, S = DefaultSerializer> {
    pipeline: Pipeline<M, H, S>,
}

impl<M, H, S> QueueConsumer<M, H, S>
where
    M: DeserializeOwned + Default + Send + Sync + 'static,
    H: Handler<M>,
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
        Self {
            pipeline: Pipeline {
                binders,
                handler,
                serializer,
                services,
                options,
            },
        }
    }

    async fn process(
        &self,
        queue_name: &str,
        inbound: &Inbound,
        trace: &TraceContext,
    ) -> ProcessingOutcome {
        let pipeline = &self.pipeline;
        let Invocation { result, scope } = pipeline.invoke(queue_name, inbound, trace).await;

        let (action, outcome) = match result {
            Ok(HandlerOutcome::Value(_)) => (ResultAction::Acknowledge, Ok(())),
            Ok(HandlerOutcome::Action(action)) => (action, Ok(())),
            Err(e) => {
                pipeline.report_fault(queue_name, inbound, &e);
                (pipeline.fault_action(inbound, &e), Err(e))
            }
        };

        let outcome = pipeline.settle(action, inbound, outcome).await;
        drop(scope);
        outcome
    }
}

#[async_trait::async_trait]
impl<M, H, S> Dispatch for QueueConsumer<M, H, S>
where
    M: DeserializeOwned + Default + Send + Sync + 'static,
    H: Handler<M>,
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
