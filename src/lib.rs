//! `carrot-dispatch` dispatches RabbitMQ deliveries to application handlers, built on top
//! of [`lapin`].
//!
//! Handlers declare the arguments they need (the message body, headers, services) with a
//! [`HandlerSignature`](crate::consumers::HandlerSignature). The framework deserializes each
//! delivery, binds the arguments, runs the handler and settles the delivery with the broker.
//! Request/reply handlers get their return value published to the `reply-to` address of
//! the request.
//!
//! [`ConsumerGroup`](crate::consumers::ConsumerGroup) and
//! [`Publisher`](crate::publishers::Publisher) are the best starting points.

pub mod amqp;
pub mod consumers;
pub mod pool;
pub mod publishers;
pub mod serialization;
pub mod services;
pub mod settings;
pub mod telemetry;
pub mod transport;
