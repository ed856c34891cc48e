//! The operations the dispatch pipeline needs from the broker.
//!
//! [`BrokerChannel`] covers settling deliveries and publishing; [`ChannelFactory`] opens
//! new channels on a shared connection. Both are implemented for `lapin` and, for tests,
//! by the recording transport in [`memory`].
use anyhow::Context;
use lapin::{
    options::{BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicRejectOptions},
    publisher_confirm::Confirmation,
    BasicProperties,
};
use std::sync::Arc;

pub mod memory;

/// A channel to the broker.
#[async_trait::async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn basic_ack(&self, delivery_tag: u64, options: BasicAckOptions)
        -> Result<(), anyhow::Error>;

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), anyhow::Error>;

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), anyhow::Error>;

    /// Publish a message, waiting for the broker confirmation if the channel is in
    /// confirm mode.
    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error>;
}

/// Opens channels on a connection shared by all the deliveries of a consumer group.
#[async_trait::async_trait]
pub trait ChannelFactory: Send + Sync + 'static {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, anyhow::Error>;
}

/// assert they are object safe
type _CHECK = (Box<dyn BrokerChannel>, Box<dyn ChannelFactory>);

#[async_trait::async_trait]
impl BrokerChannel for lapin::Channel {
    async fn basic_ack(
        &self,
        delivery_tag: u64,
        options: BasicAckOptions,
    ) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_ack(self, delivery_tag, options)
            .await
            .context("Failed to ack message.")
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_nack(self, delivery_tag, options)
            .await
            .context("Failed to nack message.")
    }

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), anyhow::Error> {
        lapin::Channel::basic_reject(self, delivery_tag, options)
            .await
            .context("Failed to reject message.")
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        let confirmation =
            lapin::Channel::basic_publish(self, exchange, routing_key, options, payload, properties)
                .await?
                .await?;

        match confirmation {
            Confirmation::Ack(Some(returned)) if returned.reply_code == NO_ROUTE => Err(
                anyhow::anyhow!("The message could not be routed: {:?}", returned),
            ),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(()),
            Confirmation::Nack(returned) => Err(anyhow::anyhow!(
                "The RabbitMq broker nacked the publishing of the message: {:?}",
                returned
            )),
        }
    }
}

/// See https://www.rabbitmq.com/amqp-0-9-1-reference.html
const NO_ROUTE: u16 = 312;

