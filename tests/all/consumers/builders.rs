use super::Invocations;
use crate::helpers::PaymentRequested;
use carrot_dispatch::consumers::{
    Arguments, BinderConfigurationError, HandlerOutcome, HandlerSignature, MessageHandler,
};
use carrot_dispatch::serialization::SimdJsonSerializer;
use std::num::{NonZeroU16, NonZeroUsize};
use std::sync::Arc;

#[derive(Debug, Default, serde::Deserialize)]
struct RefundRequested {
    amount: u64,
}

#[test]
fn headers_must_be_bound_to_strings() {
    let invocations = Invocations::default();

    let result = MessageHandler::builder("payments").handler(
        HandlerSignature::new()
            .body::<PaymentRequested>("payment")
            .header::<u32>("attempt", "Attempt"),
        invocations.ack::<PaymentRequested>(),
    );

    let Err(error) = result else {
        panic!("A header bound to a u32 must be rejected");
    };
    assert_eq!(
        error,
        BinderConfigurationError::HeaderNotString {
            parameter: "attempt".into(),
            header: "Attempt".into(),
            declared: "u32",
        }
    );
}

#[test]
fn parameter_names_must_be_unique() {
    let invocations = Invocations::default();

    let result = MessageHandler::builder("payments").handler(
        HandlerSignature::new()
            .body::<PaymentRequested>("payment")
            .header::<String>("payment", "PaymentId"),
        invocations.ack::<PaymentRequested>(),
    );

    assert!(matches!(
        result,
        Err(BinderConfigurationError::DuplicateParameter { parameter }) if parameter == "payment"
    ));
}

#[test]
fn the_body_must_be_bound_to_the_message_type() {
    let invocations = Invocations::default();

    let result = MessageHandler::builder("payments").handler(
        HandlerSignature::<PaymentRequested>::new().body::<RefundRequested>("refund"),
        invocations.ack::<PaymentRequested>(),
    );

    assert!(matches!(
        result,
        Err(BinderConfigurationError::BodyTypeMismatch { parameter, .. }) if parameter == "refund"
    ));
}

#[test]
fn valid_signatures_produce_a_message_handler() {
    let handler = MessageHandler::builder("refunds")
        .with_prefetch_count(NonZeroU16::new(20).unwrap())
        .with_dispatch_concurrency(NonZeroUsize::new(4).unwrap())
        .requeue_on_fault(true)
        .handler(
            HandlerSignature::new()
                .body::<RefundRequested>("refund")
                .header::<Option<String>>("tenant", "TenantId"),
            |arguments: Arguments<RefundRequested>| async move {
                let refund = arguments.body(0)?;
                assert!(refund.amount < u64::MAX);
                Ok::<_, anyhow::Error>(HandlerOutcome::done())
            },
        )
        .unwrap();

    assert_eq!(handler.queue_name(), "refunds");
}

#[test]
fn request_reply_handlers_can_use_another_serializer() {
    let handler = MessageHandler::builder("quotes")
        .with_serializer(Arc::new(SimdJsonSerializer))
        .rpc_handler(
            HandlerSignature::<PaymentRequested, SimdJsonSerializer>::new()
                .body::<PaymentRequested>("payment"),
            |arguments: Arguments<PaymentRequested>| async move {
                let payment = arguments.body(0)?;
                Ok::<_, anyhow::Error>(HandlerOutcome::Value(payment.amount * 2))
            },
        );

    assert!(handler.is_ok());
}
