use super::Invocations;
use crate::helpers::{inbound, json, options, PaymentRequested};
use carrot_dispatch::amqp::convenience::{set_header_str, BasicPropertiesExt};
use carrot_dispatch::amqp::BasicProperties;
use carrot_dispatch::consumers::{
    Arguments, BindError, ClosureHandler, Dispatch, DispatchContext, DispatchError, Handler,
    HandlerOutcome, HandlerSignature, QueueConsumer, ResultAction,
};
use carrot_dispatch::publishers::{Publisher, Via};
use carrot_dispatch::serialization::DefaultSerializer;
use carrot_dispatch::services::{DispatchScope, ServiceCollection, ServiceProvider};
use carrot_dispatch::telemetry::{TraceContext, TRACE_ID_HEADER};
use carrot_dispatch::transport::memory::{ChannelCall, MemoryChannel};
use carrot_dispatch::transport::BrokerChannel;
use std::sync::{Arc, Mutex};

struct Ledger {
    name: &'static str,
}

fn consumer<F>(
    signature: HandlerSignature<PaymentRequested>,
    services: Arc<dyn ServiceProvider>,
    requeue_on_fault: bool,
    handler: F,
) -> QueueConsumer<PaymentRequested, ClosureHandler<F>>
where
    ClosureHandler<F>: Handler<PaymentRequested>,
{
    QueueConsumer::new(
        signature,
        ClosureHandler(handler),
        Arc::new(DefaultSerializer::default()),
        services,
        options(DispatchScope::RootScope, requeue_on_fault),
    )
    .unwrap()
}

#[tokio::test]
async fn handlers_get_their_arguments_and_successful_deliveries_are_acknowledged() {
    // Arrange
    let payment = PaymentRequested::fake();
    let received = Arc::new(Mutex::new(None));
    let signature = HandlerSignature::new()
        .body::<PaymentRequested>("payment")
        .header::<String>("tenant", "TenantId")
        .service::<Ledger>("ledger");
    let consumer = consumer(
        signature,
        ServiceCollection::new()
            .singleton(Ledger { name: "main" })
            .build(),
        false,
        {
            let received = received.clone();
            move |arguments: Arguments<PaymentRequested>| {
                let received = received.clone();
                async move {
                    let payment = arguments.body(0)?;
                    let tenant = arguments.required_header(1)?.to_owned();
                    let ledger = arguments.service::<Ledger>(2)?;
                    *received.lock().unwrap() = Some(((*payment).clone(), tenant, ledger.name));
                    Ok::<_, anyhow::Error>(HandlerOutcome::done())
                }
            }
        },
    );
    let channel = MemoryChannel::new();
    let properties = set_header_str(BasicProperties::default(), "TenantId", "acme");

    // Act
    let outcome = consumer
        .dispatch("payments", inbound(&channel, 4, properties, json(&payment)))
        .await;

    // Assert
    assert!(outcome.result().is_ok());
    assert_eq!(outcome.action(), ResultAction::Acknowledge);
    assert_eq!(channel.calls(), vec![ChannelCall::Ack { delivery_tag: 4 }]);
    assert_eq!(
        received.lock().unwrap().clone(),
        Some((payment, "acme".to_owned(), "main"))
    );
}

#[tokio::test]
async fn handler_errors_are_negatively_acknowledged_according_to_the_requeue_policy() {
    for requeue_on_fault in [true, false] {
        let consumer = consumer(
            HandlerSignature::new().body::<PaymentRequested>("payment"),
            ServiceCollection::new().build(),
            requeue_on_fault,
            |_: Arguments<PaymentRequested>| async move {
                Err::<HandlerOutcome<()>, _>(anyhow::anyhow!("insufficient funds"))
            },
        );
        let channel = MemoryChannel::new();

        let outcome = consumer
            .dispatch(
                "payments",
                inbound(&channel, 1, BasicProperties::default(), json(&PaymentRequested::fake())),
            )
            .await;

        let Err(DispatchError::Handler(e)) = outcome.result() else {
            panic!("Expected a handler error, got {:?}", outcome.result());
        };
        assert_eq!(e.to_string(), "insufficient funds");
        assert_eq!(
            channel.calls(),
            vec![ChannelCall::Nack {
                delivery_tag: 1,
                requeue: requeue_on_fault
            }]
        );
        assert_eq!(outcome.was_requeued(), requeue_on_fault);
    }
}

#[tokio::test]
async fn actions_returned_by_the_handler_are_executed_verbatim() {
    let consumer = consumer(
        HandlerSignature::new().body::<PaymentRequested>("payment"),
        ServiceCollection::new().build(),
        false,
        |_: Arguments<PaymentRequested>| async move {
            Ok::<HandlerOutcome<()>, anyhow::Error>(ResultAction::Reject { requeue: true }.into())
        },
    );
    let channel = MemoryChannel::new();

    let outcome = consumer
        .dispatch(
            "payments",
            inbound(&channel, 2, BasicProperties::default(), json(&PaymentRequested::fake())),
        )
        .await;

    assert!(outcome.result().is_ok());
    assert_eq!(
        channel.calls(),
        vec![ChannelCall::Reject {
            delivery_tag: 2,
            requeue: true
        }]
    );
}

#[tokio::test]
async fn a_missing_required_header_fails_the_delivery_without_invoking_the_handler() {
    let invocations = Invocations::default();
    let consumer = consumer(
        HandlerSignature::new()
            .body::<PaymentRequested>("payment")
            .header::<String>("tenant", "TenantId"),
        ServiceCollection::new().build(),
        false,
        invocations.ack::<PaymentRequested>(),
    );
    let channel = MemoryChannel::new();

    let outcome = consumer
        .dispatch(
            "payments",
            inbound(&channel, 3, BasicProperties::default(), json(&PaymentRequested::fake())),
        )
        .await;

    assert!(matches!(
        outcome.result(),
        Err(DispatchError::Binding(BindError::MissingHeader { header, .. })) if header == "TenantId"
    ));
    assert_eq!(invocations.count(), 0);
    assert_eq!(
        channel.calls(),
        vec![ChannelCall::Nack {
            delivery_tag: 3,
            requeue: false
        }]
    );
}

#[tokio::test]
async fn optional_headers_can_be_absent() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = consumer(
        HandlerSignature::new().header::<Option<String>>("tenant", "TenantId"),
        ServiceCollection::new().build(),
        false,
        {
            let seen = seen.clone();
            move |arguments: Arguments<PaymentRequested>| {
                let seen = seen.clone();
                async move {
                    let tenant = arguments.header(0)?.map(str::to_owned);
                    seen.lock().unwrap().push(tenant);
                    Ok::<_, anyhow::Error>(HandlerOutcome::done())
                }
            }
        },
    );
    let channel = MemoryChannel::new();

    consumer
        .dispatch("payments", inbound(&channel, 1, BasicProperties::default(), Vec::new()))
        .await;
    consumer
        .dispatch(
            "payments",
            inbound(
                &channel,
                2,
                set_header_str(BasicProperties::default(), "TenantId", "acme"),
                Vec::new(),
            ),
        )
        .await;

    assert_eq!(*seen.lock().unwrap(), vec![None, Some("acme".to_owned())]);
    assert_eq!(channel.settlements().len(), 2);
}

#[tokio::test]
async fn unresolved_services_fail_the_delivery() {
    let invocations = Invocations::default();
    let consumer = consumer(
        HandlerSignature::new().keyed_service::<Ledger>("ledger", "secondary"),
        ServiceCollection::new()
            .keyed_singleton("primary", Ledger { name: "primary" })
            .build(),
        true,
        invocations.ack::<PaymentRequested>(),
    );
    let channel = MemoryChannel::new();

    let outcome = consumer
        .dispatch("payments", inbound(&channel, 5, BasicProperties::default(), Vec::new()))
        .await;

    assert!(matches!(
        outcome.result(),
        Err(DispatchError::Binding(BindError::UnresolvedService { .. }))
    ));
    assert_eq!(invocations.count(), 0);
    assert_eq!(
        channel.calls(),
        vec![ChannelCall::Nack {
            delivery_tag: 5,
            requeue: true
        }]
    );
}

#[tokio::test]
async fn an_empty_body_is_handled_as_the_default_message() {
    let received = Arc::new(Mutex::new(None));
    let consumer = consumer(
        HandlerSignature::new().body::<PaymentRequested>("payment"),
        ServiceCollection::new().build(),
        false,
        {
            let received = received.clone();
            move |arguments: Arguments<PaymentRequested>| {
                let received = received.clone();
                async move {
                    *received.lock().unwrap() = Some((*arguments.body(0)?).clone());
                    Ok::<_, anyhow::Error>(HandlerOutcome::done())
                }
            }
        },
    );
    let channel = MemoryChannel::new();

    let outcome = consumer
        .dispatch("payments", inbound(&channel, 1, BasicProperties::default(), Vec::new()))
        .await;

    assert!(outcome.result().is_ok());
    assert_eq!(
        received.lock().unwrap().clone(),
        Some(PaymentRequested::default())
    );
}

#[tokio::test]
async fn dynamic_binders_read_the_dispatch_context() {
    let received = Arc::new(Mutex::new(None));
    let signature = HandlerSignature::new()
        .dynamic("queue", |context: &DispatchContext<'_, PaymentRequested>| {
            Ok::<_, anyhow::Error>(context.queue_name.to_owned())
        })
        .dynamic("delivery_tag", |context: &DispatchContext<'_, PaymentRequested>| {
            Ok::<_, anyhow::Error>(context.delivery.delivery_tag)
        });
    let consumer = consumer(signature, ServiceCollection::new().build(), false, {
        let received = received.clone();
        move |arguments: Arguments<PaymentRequested>| {
            let received = received.clone();
            async move {
                let queue = arguments.value::<String>(0)?;
                let delivery_tag = arguments.value::<u64>(1)?;
                *received.lock().unwrap() = Some(((*queue).clone(), *delivery_tag));
                Ok::<_, anyhow::Error>(HandlerOutcome::done())
            }
        }
    });
    let channel = MemoryChannel::new();

    consumer
        .dispatch("payments", inbound(&channel, 42, BasicProperties::default(), Vec::new()))
        .await;

    assert_eq!(
        received.lock().unwrap().clone(),
        Some(("payments".to_owned(), 42))
    );
}

#[tokio::test]
async fn cancelled_deliveries_are_requeued_without_invoking_the_handler() {
    let invocations = Invocations::default();
    let consumer = consumer(
        HandlerSignature::new().body::<PaymentRequested>("payment"),
        ServiceCollection::new().build(),
        false,
        invocations.ack::<PaymentRequested>(),
    );
    let channel = MemoryChannel::new();
    let inbound = inbound(&channel, 8, BasicProperties::default(), json(&PaymentRequested::fake()));
    inbound.cancellation.cancel();

    let outcome = consumer.dispatch("payments", inbound).await;

    assert!(matches!(outcome.result(), Err(DispatchError::Cancelled)));
    assert_eq!(invocations.count(), 0);
    assert_eq!(
        channel.calls(),
        vec![ChannelCall::Nack {
            delivery_tag: 8,
            requeue: true
        }]
    );
}

#[tokio::test]
async fn panicking_handlers_are_treated_as_handler_faults() {
    let consumer = consumer(
        HandlerSignature::new().body::<PaymentRequested>("payment"),
        ServiceCollection::new().build(),
        true,
        |_: Arguments<PaymentRequested>| async move {
            if true {
                panic!("ledger exploded");
            }
            Ok::<_, anyhow::Error>(HandlerOutcome::done())
        },
    );
    let channel = MemoryChannel::new();

    let outcome = consumer
        .dispatch(
            "payments",
            inbound(&channel, 9, BasicProperties::default(), json(&PaymentRequested::fake())),
        )
        .await;

    let Err(DispatchError::Handler(e)) = outcome.result() else {
        panic!("Expected a handler error, got {:?}", outcome.result());
    };
    assert!(e.to_string().contains("ledger exploded"));
    assert_eq!(
        channel.calls(),
        vec![ChannelCall::Nack {
            delivery_tag: 9,
            requeue: true
        }]
    );
}

#[tokio::test]
async fn messages_published_by_a_handler_join_the_trace_of_the_delivery() {
    let publisher = Arc::new(
        Publisher::builder(Arc::new(DefaultSerializer::default())).build(),
    );
    let signature = HandlerSignature::new()
        .body::<PaymentRequested>("payment")
        .dynamic("trace", |context: &DispatchContext<'_, PaymentRequested>| {
            Ok::<_, anyhow::Error>(context.trace.clone())
        })
        .dynamic("channel", |context: &DispatchContext<'_, PaymentRequested>| {
            Ok::<_, anyhow::Error>(Arc::clone(context.channel))
        });
    let consumer = consumer(signature, ServiceCollection::new().build(), false, {
        move |arguments: Arguments<PaymentRequested>| {
            let publisher = publisher.clone();
            async move {
                let payment = arguments.body(0)?;
                let trace = arguments.value::<TraceContext>(1)?;
                let channel = arguments.value::<Arc<dyn BrokerChannel>>(2)?;
                publisher
                    .send_in(
                        &trace,
                        Via::Channel(channel.as_ref().as_ref()),
                        "ledger",
                        "payment.booked",
                        payment.as_ref(),
                    )
                    .await?;
                Ok::<_, anyhow::Error>(HandlerOutcome::done())
            }
        }
    });
    let channel = MemoryChannel::new();
    let inbound_trace = TraceContext::new_root();

    let outcome = consumer
        .dispatch(
            "payments",
            inbound(
                &channel,
                3,
                inbound_trace.inject(BasicProperties::default()),
                json(&PaymentRequested::fake()),
            ),
        )
        .await;

    assert!(outcome.result().is_ok());
    let calls = channel.calls();
    assert_eq!(calls.len(), 2);
    let ChannelCall::Publish { properties, .. } = &calls[0] else {
        panic!("Expected the handler publish first, got {:?}", calls[0]);
    };
    assert_eq!(
        properties.get_header_str(TRACE_ID_HEADER).as_deref(),
        Some(inbound_trace.trace_id.as_str())
    );
    assert_eq!(calls[1], ChannelCall::Ack { delivery_tag: 3 });
}
