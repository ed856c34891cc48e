//! [`deadpool`]-managed pools of [`lapin::Connection`]s and [`lapin::Channel`]s.
//!
//! Broken connections and channels are discarded on recycle and recreated on demand;
//! connections are reused across channels.
//!
//! A [`ChannelPool`] is a [`ChannelFactory`](crate::transport::ChannelFactory): consumer
//! groups hand one to every dispatch context so that handlers can publish on a pooled
//! channel instead of opening a connection per message.
//!
//! ```rust
//! use carrot_dispatch::amqp::ConnectionFactory;
//! use carrot_dispatch::pool::{ChannelManager, ChannelPool, ConnectionPool};
//! use carrot_dispatch::settings::RabbitMqSettings;
//!
//! async fn example() -> anyhow::Result<()> {
//!     let settings = RabbitMqSettings::default();
//!     let factory = ConnectionFactory::new_from_config(&settings)?;
//!     let connection_pool = ConnectionPool::builder(factory)
//!         .max_size(4)
//!         .build()?;
//!     let channel_pool = ChannelPool::builder(ChannelManager::new(connection_pool))
//!         .max_size(16)
//!         .build()?;
//!
//!     let channel = channel_pool.get().await?;
//!     # drop(channel);
//!     Ok(())
//! }
//! ```

mod channel;
mod connection;
mod error;

pub use channel::{ChannelManager, ChannelPool};
pub use connection::ConnectionPool;
pub use error::Error;
use error::unhealthy;
