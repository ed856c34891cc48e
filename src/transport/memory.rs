//! An in-memory transport recording every call it receives.
//!
//! Useful to exercise consumers and publishers without a running broker.
use super::{BrokerChannel, ChannelFactory};
use lapin::{
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicRejectOptions},
    BasicProperties,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A call received by a [`MemoryChannel`].
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCall {
    Ack {
        delivery_tag: u64,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
    Reject {
        delivery_tag: u64,
        requeue: bool,
    },
    Publish {
        exchange: String,
        routing_key: String,
        properties: BasicProperties,
        payload: Vec<u8>,
    },
}

impl ChannelCall {
    /// `true` for acks, nacks and rejections.
    pub fn is_settlement(&self) -> bool {
        !matches!(self, Self::Publish { .. })
    }
}

/// A channel keeping track of the calls it receives, in order.
#[derive(Default)]
pub struct MemoryChannel {
    calls: Mutex<Vec<ChannelCall>>,
    fail_publishes: AtomicBool,
}

impl MemoryChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every subsequent publish fail.
    pub fn fail_publishes(&self) {
        self.fail_publishes.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<ChannelCall> {
        self.lock().clone()
    }

    /// Published messages, in order.
    pub fn published(&self) -> Vec<ChannelCall> {
        self.calls()
            .into_iter()
            .filter(|call| !call.is_settlement())
            .collect()
    }

    /// Acks, nacks and rejections, in order.
    pub fn settlements(&self) -> Vec<ChannelCall> {
        self.calls()
            .into_iter()
            .filter(ChannelCall::is_settlement)
            .collect()
    }

    fn record(&self, call: ChannelCall) {
        self.lock().push(call);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ChannelCall>> {
        self.calls
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait::async_trait]
impl BrokerChannel for MemoryChannel {
    async fn basic_ack(
        &self,
        delivery_tag: u64,
        _options: BasicAckOptions,
    ) -> Result<(), anyhow::Error> {
        self.record(ChannelCall::Ack { delivery_tag });
        Ok(())
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), anyhow::Error> {
        self.record(ChannelCall::Nack {
            delivery_tag,
            requeue: options.requeue,
        });
        Ok(())
    }

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), anyhow::Error> {
        self.record(ChannelCall::Reject {
            delivery_tag,
            requeue: options.requeue,
        });
        Ok(())
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        _options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        if self.fail_publishes.load(Ordering::SeqCst) {
            anyhow::bail!("Publishing to `{exchange}` with routing key `{routing_key}` failed.");
        }
        self.record(ChannelCall::Publish {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            properties,
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

/// A connection handing out [`MemoryChannel`]s.
///
/// Every channel it opens is kept, so that what was published through it can be inspected.
#[derive(Default)]
pub struct MemoryConnection {
    channels: Mutex<Vec<Arc<MemoryChannel>>>,
    opened: AtomicUsize,
}

impl MemoryConnection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn channels_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Everything published on any channel opened by this connection.
    pub fn published(&self) -> Vec<ChannelCall> {
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .flat_map(|channel| channel.published())
            .collect()
    }
}

#[async_trait::async_trait]
impl ChannelFactory for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, anyhow::Error> {
        let channel = MemoryChannel::new();
        self.channels
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::clone(&channel));
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(channel)
    }
}
