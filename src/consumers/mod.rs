//! Facilities to consume messages from a RabbitMq queue. Check out [`ConsumerGroup`] as a
//! starting point.
//!
//! Every delivery goes through the same pipeline: its body is deserialized, the handler
//! arguments are bound from a [`DispatchContext`], the handler runs and the delivery is
//! settled with exactly one [`ResultAction`]. [`QueueConsumer`] and [`RpcConsumer`] implement
//! it for plain queues and for request/reply queues.
pub use binding::{
    Argument, Arguments, BindError, BinderConfigurationError, BinderSet, HandlerSignature,
    TypeDescriptor,
};
pub use builders::{
    ConsumerGroup, ConsumerGroupBuilder, ConsumerGroupConfigurationBuilder, MessageHandler,
    MessageHandlerBuilder,
};
pub use context::{Delivery, DispatchContext, Inbound};
pub use dispatch::{Dispatch, DispatchOptions, QueueConsumer};
pub use error::{DispatchError, ProcessingOutcome};
pub use handler::{ClosureHandler, Handler, HandlerOutcome};
pub use result_action::ResultAction;
pub use rpc::{RpcConsumer, EXCEPTION_HEADER};
pub use topology_hook::TopologyHook;

mod binding;
mod builders;
mod consumer;
mod context;
mod dispatch;
mod error;
mod handler;
pub mod hooks;
mod result_action;
mod rpc;
mod topology_hook;
