use super::connection::ConnectionPool;
use crate::transport::{BrokerChannel, ChannelFactory};
use anyhow::Context;
use deadpool::managed::{self, Manager, Object};
use lapin::{
    options::{
        BasicAckOptions, BasicNackOptions, BasicPublishOptions, BasicRejectOptions,
        ConfirmSelectOptions,
    },
    BasicProperties, Channel, ChannelState,
};
use std::sync::Arc;

/// A pool of [`Channel`]s with publisher confirms enabled.
pub type ChannelPool = deadpool::managed::Pool<ChannelManager>;

/// Opens channels on connections taken from a [`ConnectionPool`].
pub struct ChannelManager {
    connection_pool: ConnectionPool,
}

impl ChannelManager {
    pub fn new(connection_pool: ConnectionPool) -> Self {
        Self { connection_pool }
    }
}

#[async_trait::async_trait]
impl Manager for ChannelManager {
    type Type = Channel;
    type Error = super::Error;

    async fn create(&self) -> Result<Channel, super::Error> {
        let connection = self.connection_pool.get().await?;
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?;
        Ok(channel)
    }

    async fn recycle(&self, channel: &mut Channel) -> managed::RecycleResult<super::Error> {
        match channel.status().state() {
            ChannelState::Connected => Ok(()),
            state => {
                tracing::warn!(?state, "Discarding an unhealthy pooled channel.");
                Err(super::unhealthy("Channel", state))
            }
        }
    }
}

/// A channel checked out of a [`ChannelPool`]. It goes back to the pool when dropped.
struct PooledChannel(Object<ChannelManager>);

#[async_trait::async_trait]
impl BrokerChannel for PooledChannel {
    async fn basic_ack(
        &self,
        delivery_tag: u64,
        options: BasicAckOptions,
    ) -> Result<(), anyhow::Error> {
        BrokerChannel::basic_ack(&*self.0, delivery_tag, options).await
    }

    async fn basic_nack(
        &self,
        delivery_tag: u64,
        options: BasicNackOptions,
    ) -> Result<(), anyhow::Error> {
        BrokerChannel::basic_nack(&*self.0, delivery_tag, options).await
    }

    async fn basic_reject(
        &self,
        delivery_tag: u64,
        options: BasicRejectOptions,
    ) -> Result<(), anyhow::Error> {
        BrokerChannel::basic_reject(&*self.0, delivery_tag, options).await
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: BasicPublishOptions,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), anyhow::Error> {
        BrokerChannel::basic_publish(&*self.0, exchange, routing_key, options, payload, properties)
            .await
    }
}

#[async_trait::async_trait]
impl ChannelFactory for ChannelPool {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, anyhow::Error> {
        let channel = self
            .get()
            .await
            .map_err(super::Error::from)
            .context("Failed to acquire a healthy channel from the pool.")?;
        Ok(Arc::new(PooledChannel(channel)))
    }
}
