use crate::consumers::binding::{BinderConfigurationError, BinderSet, HandlerSignature};
use crate::consumers::dispatch::{Dispatch, DispatchOptions, QueueConsumer};
use crate::consumers::handler::{ClosureHandler, Handler};
use crate::consumers::rpc::RpcConsumer;
use crate::consumers::TopologyHook;
use crate::serialization::{DefaultSerializer, Serializer};
use crate::services::{DispatchScope, ServiceProvider};
use serde::{de::DeserializeOwned, Serialize};
use std::num::{NonZeroU16, NonZeroUsize};
use std::sync::Arc;

/// Creates the dispatcher of a handler once the group configuration is known.
type DispatcherFactory =
    Box<dyn FnOnce(DispatchOptions, Arc<dyn ServiceProvider>) -> Arc<dyn Dispatch> + Send>;

/// A handler processing messages from a RabbitMq queue.
///
/// Use [`MessageHandler::builder`] to start composing a `MessageHandler` using a fluent builder
/// API.
///
/// # `MessageHandler` vs `ConsumerGroup`
///
/// A `MessageHandler` is always part of a [`ConsumerGroup`]: it resolves services from the
/// provider of the group and inherits its settings, unless overridden here.
///
/// [`ConsumerGroup`]: super::ConsumerGroup
pub struct MessageHandler {
    pub(super) queue_name: String,
    pub(super) prefetch_count_override: Option<NonZeroU16>,
    pub(super) dispatch_concurrency_override: Option<NonZeroUsize>,
    pub(super) dispatch_scope_override: Option<DispatchScope>,
    pub(super) requeue_on_fault_override: Option<bool>,
    pub(super) topology_hooks: Vec<Arc<dyn TopologyHook>>,
    pub(super) dispatcher: DispatcherFactory,
}

impl MessageHandler {
    /// Start building a [`MessageHandler`].
    ///
    /// You need to provide the name of the queue you want to consume messages from.
    pub fn builder<T: Into<String>>(queue_name: T) -> MessageHandlerBuilder {
        MessageHandlerBuilder::new(queue_name.into())
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

/// A builder to compose a [`MessageHandler`] with a fluent API.
///
/// Use [`MessageHandler::builder`] as entrypoint.
pub struct MessageHandlerBuilder<S = DefaultSerializer> {
    queue_name: String,
    prefetch_count_override: Option<NonZeroU16>,
    dispatch_concurrency_override: Option<NonZeroUsize>,
    dispatch_scope_override: Option<DispatchScope>,
    requeue_on_fault_override: Option<bool>,
    topology_hooks: Vec<Arc<dyn TopologyHook>>,
    serializer: Arc<S>,
}

impl MessageHandlerBuilder {
    pub(super) fn new(queue_name: String) -> Self {
        Self {
            queue_name,
            prefetch_count_override: None,
            dispatch_concurrency_override: None,
            dispatch_scope_override: None,
            requeue_on_fault_override: None,
            topology_hooks: vec![],
            serializer: Arc::new(DefaultSerializer::default()),
        }
    }
}

impl<S: Serializer> MessageHandlerBuilder<S> {
    /// Configure the prefetch count of the handler.
    /// If not configured, the handler inherits the prefetch count
    /// configured at the consumer group level.
    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: NonZeroU16) -> Self {
        self.prefetch_count_override = Some(prefetch_count);
        self
    }

    /// How many deliveries of this queue are processed concurrently.
    #[must_use]
    pub fn with_dispatch_concurrency(mut self, dispatch_concurrency: NonZeroUsize) -> Self {
        self.dispatch_concurrency_override = Some(dispatch_concurrency);
        self
    }

    #[must_use]
    pub fn with_dispatch_scope(mut self, dispatch_scope: DispatchScope) -> Self {
        self.dispatch_scope_override = Some(dispatch_scope);
        self
    }

    /// Whether deliveries whose processing failed go back to the queue.
    #[must_use]
    pub fn requeue_on_fault(mut self, requeue: bool) -> Self {
        self.requeue_on_fault_override = Some(requeue);
        self
    }

    /// Topology hooks are executed _before_ the consumer starts pulling messages.
    ///
    /// If no hook is specified at the [`MessageHandler`] level, the hooks
    /// specified at the [`ConsumerGroup`] level are executed.
    ///
    /// [`ConsumerGroup`]: super::ConsumerGroup
    #[must_use]
    pub fn with_topology_hook<H: TopologyHook>(mut self, hook: H) -> Self {
        self.topology_hooks.push(Arc::new(hook));
        self
    }

    /// Append multiple topology hooks, see [`MessageHandlerBuilder::with_topology_hook`].
    #[must_use]
    pub fn with_topology_hooks<I>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn TopologyHook>>,
    {
        self.topology_hooks.extend(hooks);
        self
    }

    /// Use another serializer for the messages of this queue (and the replies, for
    /// request/reply handlers).
    pub fn with_serializer<S2: Serializer>(self, serializer: Arc<S2>) -> MessageHandlerBuilder<S2> {
        MessageHandlerBuilder {
            queue_name: self.queue_name,
            prefetch_count_override: self.prefetch_count_override,
            dispatch_concurrency_override: self.dispatch_concurrency_override,
            dispatch_scope_override: self.dispatch_scope_override,
            requeue_on_fault_override: self.requeue_on_fault_override,
            topology_hooks: self.topology_hooks,
            serializer,
        }
    }

    /// The function used to process incoming messages, called with the arguments described
    /// by `signature`.
    ///
    /// Passing in the handler finalises the `MessageHandler` construction. `signature` is
    /// validated right away: a structural mistake (e.g. a header bound to a parameter that
    /// is not a string) is reported here rather than when the first message arrives.
    ///
    /// The handler never sees the channel: the delivery is acknowledged when it returns a
    /// value, negatively acknowledged when it fails, or settled with the
    /// [`ResultAction`](crate::consumers::ResultAction) it returns.
    pub fn handler<M, F>(
        self,
        signature: HandlerSignature<M, S>,
        handler: F,
    ) -> Result<MessageHandler, BinderConfigurationError>
    where
        M: DeserializeOwned + Default + Send + Sync + 'static,
        ClosureHandler<F>: Handler<M>,
    {
        self.raw_handler(signature, ClosureHandler(handler))
    }

    /// Like [`MessageHandlerBuilder::handler`], for [`Handler`] implementations.
    pub fn raw_handler<M, H>(
        self,
        signature: HandlerSignature<M, S>,
        handler: H,
    ) -> Result<MessageHandler, BinderConfigurationError>
    where
        M: DeserializeOwned + Default + Send + Sync + 'static,
        H: Handler<M>,
    {
        let binders = BinderSet::build(&signature)?;
        let serializer = Arc::clone(&self.serializer);
        Ok(self.finish(Box::new(
            move |options: DispatchOptions, services: Arc<dyn ServiceProvider>| {
                Arc::new(QueueConsumer::with_binders(
                    binders, handler, serializer, services, options,
                )) as Arc<dyn Dispatch>
            },
        )))
    }

    /// A request/reply handler: the value it returns is published to the `reply-to` address
    /// of the request.
    ///
    /// See [`RpcConsumer`](crate::consumers::RpcConsumer) for the reply protocol.
    pub fn rpc_handler<M, F>(
        self,
        signature: HandlerSignature<M, S>,
        handler: F,
    ) -> Result<MessageHandler, BinderConfigurationError>
    where
        M: DeserializeOwned + Default + Send + Sync + 'static,
        ClosureHandler<F>: Handler<M>,
        <ClosureHandler<F> as Handler<M>>::Output: Serialize,
    {
        self.raw_rpc_handler(signature, ClosureHandler(handler))
    }

    /// Like [`MessageHandlerBuilder::rpc_handler`], for [`Handler`] implementations.
    pub fn raw_rpc_handler<M, H>(
        self,
        signature: HandlerSignature<M, S>,
        handler: H,
    ) -> Result<MessageHandler, BinderConfigurationError>
    where
        M: DeserializeOwned + Default + Send + Sync + 'static,
        H: Handler<M>,
        H::Output: Serialize,
    {
        let binders = BinderSet::build(&signature)?;
        let serializer = Arc::clone(&self.serializer);
        Ok(self.finish(Box::new(
            move |options: DispatchOptions, services: Arc<dyn ServiceProvider>| {
                Arc::new(RpcConsumer::with_binders(
                    binders, handler, serializer, services, options,
                )) as Arc<dyn Dispatch>
            },
        )))
    }

    fn finish(self, dispatcher: DispatcherFactory) -> MessageHandler {
        let Self {
            queue_name,
            prefetch_count_override,
            dispatch_concurrency_override,
            dispatch_scope_override,
            requeue_on_fault_override,
            topology_hooks,
            serializer: _,
        } = self;
        MessageHandler {
            queue_name,
            prefetch_count_override,
            dispatch_concurrency_override,
            dispatch_scope_override,
            requeue_on_fault_override,
            topology_hooks,
            dispatcher,
        }
    }
}
