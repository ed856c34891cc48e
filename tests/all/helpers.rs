use carrot_dispatch::amqp::BasicProperties;
use carrot_dispatch::consumers::{Delivery, DispatchOptions, Inbound};
use carrot_dispatch::services::DispatchScope;
use carrot_dispatch::transport::memory::{MemoryChannel, MemoryConnection};
use fake::{Fake, Faker};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentRequested {
    pub payment_id: String,
    pub amount: u64,
    pub currency: String,
}

impl PaymentRequested {
    pub fn fake() -> Self {
        Self {
            payment_id: Faker.fake(),
            amount: (1..10_000).fake(),
            currency: "GBP".into(),
        }
    }
}

pub fn json<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap()
}

pub fn options(scope: DispatchScope, requeue_on_fault: bool) -> DispatchOptions {
    DispatchOptions::new(scope, requeue_on_fault)
}

pub fn inbound(
    channel: &Arc<MemoryChannel>,
    delivery_tag: u64,
    properties: BasicProperties,
    body: Vec<u8>,
) -> Inbound {
    Inbound {
        delivery: Delivery::new(delivery_tag, properties, body),
        channel: channel.clone(),
        connection: MemoryConnection::new(),
        cancellation: CancellationToken::new(),
    }
}
