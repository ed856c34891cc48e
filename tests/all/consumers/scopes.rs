use crate::helpers::{inbound, json, options, PaymentRequested};
use carrot_dispatch::amqp::BasicProperties;
use carrot_dispatch::consumers::{
    Arguments, BindError, ClosureHandler, Dispatch, DispatchError, Handler, HandlerOutcome,
    HandlerSignature, QueueConsumer,
};
use carrot_dispatch::serialization::DefaultSerializer;
use carrot_dispatch::services::{DispatchScope, ServiceCollection, ServiceProvider};
use carrot_dispatch::transport::memory::{ChannelCall, MemoryChannel};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Records how many settlements the channel had seen when it was dropped.
struct UnitOfWork {
    id: usize,
    channel: Arc<MemoryChannel>,
    settlements_at_drop: Arc<Mutex<Vec<usize>>>,
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        self.settlements_at_drop
            .lock()
            .unwrap()
            .push(self.channel.settlements().len());
    }
}

struct Fixture {
    channel: Arc<MemoryChannel>,
    settlements_at_drop: Arc<Mutex<Vec<usize>>>,
    services: Arc<dyn ServiceProvider>,
}

impl Fixture {
    fn new() -> Self {
        let channel = MemoryChannel::new();
        let settlements_at_drop = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::new(AtomicUsize::new(0));
        let services = ServiceCollection::new()
            .scoped({
                let channel = channel.clone();
                let settlements_at_drop = settlements_at_drop.clone();
                move || UnitOfWork {
                    id: created.fetch_add(1, Ordering::SeqCst),
                    channel: channel.clone(),
                    settlements_at_drop: settlements_at_drop.clone(),
                }
            })
            .build();
        Self {
            channel,
            settlements_at_drop,
            services,
        }
    }

    fn consumer<F>(
        &self,
        scope: DispatchScope,
        handler: F,
    ) -> QueueConsumer<PaymentRequested, ClosureHandler<F>>
    where
        ClosureHandler<F>: Handler<PaymentRequested>,
    {
        self.consumer_with(
            HandlerSignature::new()
                .body::<PaymentRequested>("payment")
                .service::<UnitOfWork>("unit_of_work"),
            scope,
            handler,
        )
    }

    fn consumer_with<F>(
        &self,
        signature: HandlerSignature<PaymentRequested>,
        scope: DispatchScope,
        handler: F,
    ) -> QueueConsumer<PaymentRequested, ClosureHandler<F>>
    where
        ClosureHandler<F>: Handler<PaymentRequested>,
    {
        QueueConsumer::new(
            signature,
            ClosureHandler(handler),
            Arc::new(DefaultSerializer::default()),
            self.services.clone(),
            options(scope, false),
        )
        .unwrap()
    }

    async fn deliver(
        &self,
        consumer: &impl Dispatch,
        delivery_tag: u64,
    ) -> Result<(), DispatchError> {
        consumer
            .dispatch(
                "payments",
                inbound(
                    &self.channel,
                    delivery_tag,
                    BasicProperties::default(),
                    json(&PaymentRequested::fake()),
                ),
            )
            .await
            .into_result()
    }
}

#[tokio::test]
async fn the_delivery_scope_is_disposed_after_the_delivery_is_settled() {
    let fixture = Fixture::new();
    let consumer = fixture.consumer(
        DispatchScope::ChildScope,
        |arguments: Arguments<PaymentRequested>| async move {
            arguments.service::<UnitOfWork>(1)?;
            Ok::<_, anyhow::Error>(HandlerOutcome::done())
        },
    );

    fixture.deliver(&consumer, 1).await.unwrap();

    assert_eq!(*fixture.settlements_at_drop.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn the_delivery_scope_is_disposed_after_a_failed_delivery_is_settled() {
    let fixture = Fixture::new();
    let consumer = fixture.consumer(
        DispatchScope::ChildScope,
        |arguments: Arguments<PaymentRequested>| async move {
            arguments.service::<UnitOfWork>(1)?;
            Err::<HandlerOutcome<()>, _>(anyhow::anyhow!("ledger unavailable"))
        },
    );

    let result = fixture.deliver(&consumer, 1).await;

    assert!(matches!(result, Err(DispatchError::Handler(_))));
    assert_eq!(*fixture.settlements_at_drop.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn the_delivery_scope_is_disposed_after_a_binding_failure_is_settled() {
    let fixture = Fixture::new();
    let invoked = Arc::new(AtomicUsize::new(0));
    let consumer = fixture.consumer_with(
        HandlerSignature::new()
            .body::<PaymentRequested>("payment")
            .service::<UnitOfWork>("unit_of_work")
            .header::<String>("tenant", "TenantId"),
        DispatchScope::ChildScope,
        {
            let invoked = invoked.clone();
            move |_: Arguments<PaymentRequested>| {
                invoked.fetch_add(1, Ordering::SeqCst);
                async move { Ok::<_, anyhow::Error>(HandlerOutcome::done()) }
            }
        },
    );

    let result = fixture.deliver(&consumer, 1).await;

    assert!(matches!(
        result,
        Err(DispatchError::Binding(BindError::MissingHeader { .. }))
    ));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);
    assert_eq!(
        fixture.channel.settlements(),
        vec![ChannelCall::Nack {
            delivery_tag: 1,
            requeue: false
        }]
    );
    assert_eq!(*fixture.settlements_at_drop.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn every_delivery_gets_its_own_scoped_services() {
    let fixture = Fixture::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let consumer = fixture.consumer(DispatchScope::ChildScope, {
        let seen = seen.clone();
        move |arguments: Arguments<PaymentRequested>| {
            let seen = seen.clone();
            async move {
                let unit_of_work = arguments.service::<UnitOfWork>(1)?;
                seen.lock().unwrap().push(unit_of_work.id);
                Ok::<_, anyhow::Error>(HandlerOutcome::done())
            }
        }
    });

    fixture.deliver(&consumer, 1).await.unwrap();
    fixture.deliver(&consumer, 2).await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    assert_eq!(*fixture.settlements_at_drop.lock().unwrap(), vec![1, 2]);
}

#[tokio::test]
async fn scoped_services_cannot_be_resolved_from_the_root_provider() {
    let fixture = Fixture::new();
    let consumer = fixture.consumer(
        DispatchScope::RootScope,
        |_: Arguments<PaymentRequested>| async move {
            Ok::<_, anyhow::Error>(HandlerOutcome::done())
        },
    );

    let result = fixture.deliver(&consumer, 1).await;

    assert!(matches!(
        result,
        Err(DispatchError::Binding(BindError::UnresolvedService { .. }))
    ));
    assert!(fixture.settlements_at_drop.lock().unwrap().is_empty());
}
