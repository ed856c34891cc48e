//! Helpers for connecting to a RabbitMq broker and working with AMQP properties.

pub mod convenience;
mod factory;
pub use factory::ConnectionFactory;
pub use lapin::{Channel, Connection};

pub use lapin::{options, types, BasicProperties};
