use crate::amqp::ConnectionFactory;
use crate::consumers::builders::consumer_group::ConsumerGroupBuilder;
use crate::consumers::builders::message_handler::MessageHandler;
use crate::consumers::TopologyHook;
use crate::services::{DispatchScope, ServiceProvider};
use crate::settings::ConsumerSettings;
use crate::telemetry::TelemetryConfig;
use crate::transport::ChannelFactory;
use std::num::{NonZeroU16, NonZeroUsize};
use std::sync::Arc;

/// Group-level configuration values for a [`ConsumerGroup`](super::ConsumerGroup).
///
/// Use [`ConsumerGroupConfigurationBuilder`] to build an instance of `ConsumerGroupConfiguration`.
pub(super) struct ConsumerGroupConfiguration {
    pub(super) connection_factory: ConnectionFactory,
    pub(super) services: Arc<dyn ServiceProvider>,
    pub(super) settings: ConsumerSettings,
    pub(super) queue_name_prefix: Option<String>,
    pub(super) topology_hooks: Vec<Arc<dyn TopologyHook>>,
    pub(super) exit_after: Option<usize>,
    pub(super) telemetry: TelemetryConfig,
    /// Publishing connection handed to dispatch contexts. A channel pool on top of
    /// `connection_factory` is created at build time if left unset.
    pub(super) connection: Option<Arc<dyn ChannelFactory>>,
}

/// A builder for group-level configuration of a [`ConsumerGroup`](super::ConsumerGroup).
///
/// Use [`ConsumerGroup::builder`](super::ConsumerGroup::builder) as entrypoint.
pub struct ConsumerGroupConfigurationBuilder(ConsumerGroupConfiguration);

impl ConsumerGroupConfigurationBuilder {
    pub(super) fn new(
        connection_factory: ConnectionFactory,
        services: Arc<dyn ServiceProvider>,
        settings: ConsumerSettings,
    ) -> Self {
        Self(ConsumerGroupConfiguration {
            connection_factory,
            services,
            settings,
            queue_name_prefix: None,
            topology_hooks: Vec::new(),
            // By default, the consumer group will continue to consume message indefinitely.
            exit_after: None,
            telemetry: TelemetryConfig::default(),
            connection: None,
        })
    }

    /// Add a prefix to the name of queues used by message handlers in the group.
    ///
    /// E.g. `test` as prefix will give you `test_X` queue names.
    #[must_use]
    pub fn queue_name_prefix<T: Into<String>>(mut self, prefix: T) -> Self {
        self.0.queue_name_prefix = Some(prefix.into());
        self
    }

    /// Override the prefetch count coming from [`ConsumerSettings`].
    #[must_use]
    pub fn with_prefetch_count(mut self, prefetch_count: NonZeroU16) -> Self {
        self.0.settings.prefetch_count = prefetch_count;
        self
    }

    /// Override the number of deliveries each consumer processes concurrently.
    #[must_use]
    pub fn with_dispatch_concurrency(mut self, dispatch_concurrency: NonZeroUsize) -> Self {
        self.0.settings.dispatch_concurrency = dispatch_concurrency;
        self
    }

    /// Resolve services from the root provider, or from a scope created for each delivery.
    #[must_use]
    pub fn with_dispatch_scope(mut self, dispatch_scope: DispatchScope) -> Self {
        self.0.settings.dispatch_scope = dispatch_scope;
        self
    }

    /// Name reported as `source` on the spans of the group.
    #[must_use]
    pub fn with_telemetry(mut self, telemetry: TelemetryConfig) -> Self {
        self.0.telemetry = telemetry;
        self
    }

    /// Publish through `connection` instead of a channel pool opened with the connection
    /// factory of the group.
    #[must_use]
    pub fn with_connection(mut self, connection: Arc<dyn ChannelFactory>) -> Self {
        self.0.connection = Some(connection);
        self
    }

    /// By default, a [`ConsumerGroup`] keeps running indefinitely, consuming messages as soon as
    /// they are available in the queues bound by its [`MessageHandler`]s.
    ///
    /// With `exit_after` each consumer of the group stops after `max_n_messages`
    /// deliveries, once they have all been settled. Mostly useful in tests.
    ///
    /// [`ConsumerGroup`]: super::ConsumerGroup
    #[must_use]
    pub fn exit_after(mut self, max_n_messages: usize) -> Self {
        self.0.exit_after = Some(max_n_messages);
        self
    }

    /// Topology hooks run _before_ consumers start pulling messages, to declare the queues,
    /// exchanges and bindings they rely on.
    ///
    /// Message handlers without hooks of their own run the group-level ones.
    #[must_use]
    pub fn with_topology_hook<H: TopologyHook>(mut self, hook: H) -> Self {
        self.0.topology_hooks.push(Arc::new(hook));
        self
    }

    /// Append multiple topology hooks, see
    /// [`ConsumerGroupConfigurationBuilder::with_topology_hook`].
    #[must_use]
    pub fn with_topology_hooks<I>(mut self, hooks: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn TopologyHook>>,
    {
        self.0.topology_hooks.extend(hooks);
        self
    }

    /// Once you have specified all the group-level configuration you need,
    /// you can start adding [`MessageHandler`]s!
    ///
    /// Check out [`MessageHandler::builder`] to build out a handler.
    ///
    /// After the first handler no group-level configuration can be added: a phased builder
    /// keeps every handler looking at the same group configuration.
    pub fn message_handler(self, message_handler: MessageHandler) -> ConsumerGroupBuilder {
        ConsumerGroupBuilder {
            group_configuration: self.0,
            message_handlers: vec![message_handler],
        }
    }
}
