use super::Invocations;
use crate::helpers::{inbound, json, options, PaymentRequested};
use carrot_dispatch::amqp::convenience::BasicPropertiesExt;
use carrot_dispatch::amqp::BasicProperties;
use carrot_dispatch::consumers::{
    Arguments, ClosureHandler, Dispatch, DispatchError, Handler, HandlerOutcome,
    HandlerSignature, ResultAction, RpcConsumer, EXCEPTION_HEADER,
};
use carrot_dispatch::serialization::{Serializer, SimdJsonSerializer};
use carrot_dispatch::services::{DispatchScope, ServiceCollection};
use carrot_dispatch::telemetry::{TraceContext, SPAN_ID_HEADER, TRACE_ID_HEADER};
use carrot_dispatch::transport::memory::{ChannelCall, MemoryChannel};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
struct PaymentAuthorised {
    payment_id: String,
    authorised: bool,
}

async fn authorise(
    arguments: Arguments<PaymentRequested>,
) -> Result<HandlerOutcome<PaymentAuthorised>, anyhow::Error> {
    let payment = arguments.body(0)?;
    Ok(HandlerOutcome::Value(PaymentAuthorised {
        payment_id: payment.payment_id.clone(),
        authorised: payment.amount < 5_000,
    }))
}

fn rpc_consumer<F, S>(
    serializer: S,
    handler: F,
) -> RpcConsumer<PaymentRequested, ClosureHandler<F>, S>
where
    S: Serializer,
    ClosureHandler<F>: Handler<PaymentRequested>,
    <ClosureHandler<F> as Handler<PaymentRequested>>::Output: Serialize,
{
    RpcConsumer::new(
        HandlerSignature::new().body::<PaymentRequested>("payment"),
        ClosureHandler(handler),
        Arc::new(serializer),
        ServiceCollection::new().build(),
        options(DispatchScope::RootScope, false),
    )
    .unwrap()
}

fn request_properties() -> BasicProperties {
    TraceContext::new_root()
        .inject(BasicProperties::default())
        .with_reply_to("payments.replies".into())
        .with_correlation_id("c0ffee".into())
}

#[tokio::test]
async fn requests_without_reply_to_are_rejected_without_invoking_the_handler() {
    let invocations = Invocations::default();
    let consumer = rpc_consumer(
        SimdJsonSerializer,
        invocations.ack::<PaymentRequested>(),
    );

    for properties in [
        BasicProperties::default(),
        BasicProperties::default().with_reply_to("".into()),
    ] {
        let channel = MemoryChannel::new();

        // The body is not even valid JSON: it is never deserialized.
        let outcome = consumer
            .dispatch("payments", inbound(&channel, 6, properties, b"{".to_vec()))
            .await;

        assert!(matches!(outcome.result(), Err(DispatchError::MissingReplyTo)));
        assert_eq!(outcome.action(), ResultAction::Reject { requeue: false });
        assert_eq!(
            channel.calls(),
            vec![ChannelCall::Reject {
                delivery_tag: 6,
                requeue: false
            }]
        );
    }
    assert_eq!(invocations.count(), 0);
}

#[tokio::test]
async fn the_reply_is_correlated_with_the_request() {
    // Arrange
    let payment = PaymentRequested {
        amount: 10,
        ..PaymentRequested::fake()
    };
    let consumer = rpc_consumer(SimdJsonSerializer, authorise);
    let channel = MemoryChannel::new();
    let request = request_properties();

    // Act
    let outcome = consumer
        .dispatch("payments", inbound(&channel, 1, request.clone(), json(&payment)))
        .await;

    // Assert
    assert!(outcome.result().is_ok());
    let published = channel.published();
    assert_eq!(published.len(), 1);
    let ChannelCall::Publish {
        exchange,
        routing_key,
        properties,
        payload,
    } = &published[0]
    else {
        unreachable!()
    };
    assert_eq!(exchange, "");
    assert_eq!(routing_key, "payments.replies");
    assert_eq!(properties.correlation_id_str(), Some("c0ffee"));
    assert_eq!(*properties.delivery_mode(), Some(2));
    assert!(properties.message_id().is_some());
    assert_eq!(
        properties.get_header_str(TRACE_ID_HEADER),
        request.get_header_str(TRACE_ID_HEADER)
    );
    assert_ne!(
        properties.get_header_str(SPAN_ID_HEADER),
        request.get_header_str(SPAN_ID_HEADER)
    );
    assert_eq!(
        serde_json::from_slice::<PaymentAuthorised>(payload).unwrap(),
        PaymentAuthorised {
            payment_id: payment.payment_id,
            authorised: true
        }
    );
    assert_eq!(
        channel.settlements(),
        vec![ChannelCall::Ack { delivery_tag: 1 }]
    );
}

#[tokio::test]
async fn malformed_requests_get_an_exception_reply() {
    let invocations = Invocations::default();
    let consumer = rpc_consumer(SimdJsonSerializer, invocations.ack::<PaymentRequested>());
    let channel = MemoryChannel::new();

    let outcome = consumer
        .dispatch(
            "payments",
            inbound(&channel, 2, request_properties(), b"{\"amount\": \"ten\"}".to_vec()),
        )
        .await;

    assert!(matches!(
        outcome.result(),
        Err(DispatchError::Deserialization(_))
    ));
    assert_eq!(invocations.count(), 0);
    let calls = channel.calls();
    assert_eq!(calls.len(), 2);
    let ChannelCall::Publish {
        routing_key,
        properties,
        payload,
        ..
    } = &calls[0]
    else {
        panic!("Expected the error reply first, got {:?}", calls[0]);
    };
    assert_eq!(routing_key, "payments.replies");
    assert!(payload.is_empty());
    assert_eq!(properties.correlation_id_str(), Some("c0ffee"));
    assert!(properties.get_header_str(EXCEPTION_HEADER).is_some());
    assert_eq!(
        calls[1],
        ChannelCall::Nack {
            delivery_tag: 2,
            requeue: false
        }
    );
}

#[tokio::test]
async fn a_failing_error_reply_does_not_prevent_the_nack() {
    let consumer = rpc_consumer(
        SimdJsonSerializer,
        |_: Arguments<PaymentRequested>| async move {
            Err::<HandlerOutcome<PaymentAuthorised>, _>(anyhow::anyhow!("card declined"))
        },
    );
    let channel = MemoryChannel::new();
    channel.fail_publishes();

    let outcome = consumer
        .dispatch(
            "payments",
            inbound(&channel, 3, request_properties(), json(&PaymentRequested::fake())),
        )
        .await;

    assert!(matches!(outcome.result(), Err(DispatchError::Handler(_))));
    assert_eq!(
        channel.calls(),
        vec![ChannelCall::Nack {
            delivery_tag: 3,
            requeue: false
        }]
    );
}

#[tokio::test]
async fn cancelled_requests_are_requeued_without_a_reply() {
    let invocations = Invocations::default();
    let consumer = rpc_consumer(SimdJsonSerializer, invocations.ack::<PaymentRequested>());
    let channel = MemoryChannel::new();
    let inbound = inbound(&channel, 4, request_properties(), json(&PaymentRequested::fake()));
    inbound.cancellation.cancel();

    let outcome = consumer.dispatch("payments", inbound).await;

    assert!(matches!(outcome.result(), Err(DispatchError::Cancelled)));
    assert_eq!(invocations.count(), 0);
    assert_eq!(
        channel.calls(),
        vec![ChannelCall::Nack {
            delivery_tag: 4,
            requeue: true
        }]
    );
}
