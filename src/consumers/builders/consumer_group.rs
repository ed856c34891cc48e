use futures_util::{future::try_join_all, stream::FuturesUnordered, StreamExt};
use shutdown_handler::ShutdownHandler;
use tokio_util::sync::CancellationToken;

use crate::{
    amqp::ConnectionFactory,
    consumers::{
        builders::{
            consumer_group_configuration::ConsumerGroupConfiguration,
            message_handler::MessageHandler,
        },
        consumer::Consumer,
        dispatch::DispatchOptions,
        ConsumerGroupConfigurationBuilder,
    },
    pool::{ChannelManager, ChannelPool, ConnectionPool},
    services::ServiceProvider,
    settings::ConsumerSettings,
    transport::ChannelFactory,
};
use std::sync::Arc;

/// A collection of RabbitMq consumers sharing the same services, settings and connection
/// settings.
///
/// `ConsumerGroup` is the main entrypoint if you want to pull and process messages from queues.
/// Each consumer pulls messages on its own connection; replies and other messages published
/// while processing go through a channel pool shared by the whole group.
///
/// # How do I build a `ConsumerGroup`?
///
/// The starting point is [`ConsumerGroup::builder`]. Once you are done with group-level
/// configuration, you can start adding message handlers using
/// [`ConsumerGroupConfigurationBuilder::message_handler`].
///
/// ```rust,no_run
/// use carrot_dispatch::amqp::ConnectionFactory;
/// use carrot_dispatch::consumers::{
///     Arguments, ConsumerGroup, HandlerOutcome, HandlerSignature, MessageHandler,
/// };
/// use carrot_dispatch::consumers::hooks::topology::DeclareDurableQueue;
/// use carrot_dispatch::services::ServiceCollection;
/// use carrot_dispatch::settings::{ConsumerSettings, RabbitMqSettings};
///
/// #[derive(Default, serde::Deserialize)]
/// struct Refund {
///     amount: u64,
/// }
///
/// # async fn example() -> Result<(), anyhow::Error> {
/// let factory = ConnectionFactory::new_from_config(&RabbitMqSettings::default())?;
/// let services = ServiceCollection::new().build();
///
/// let group = ConsumerGroup::builder(factory, services, ConsumerSettings::new(false))
///     .queue_name_prefix("billing")
///     .message_handler(
///         MessageHandler::builder("refunds")
///             .with_topology_hook(DeclareDurableQueue)
///             .handler(
///                 HandlerSignature::new().body::<Refund>("refund"),
///                 |arguments: Arguments<Refund>| async move {
///                     let refund = arguments.body(0)?;
///                     tracing::info!("Refunding {}", refund.amount);
///                     Ok::<_, anyhow::Error>(HandlerOutcome::done())
///                 },
///             )?,
///     )
///     .build()
///     .await?;
///
/// group.run_until_sigterm().await
/// # }
/// ```
///
/// # Layered configuration
///
/// Certain configuration values can only be set at the group level (connection factory,
/// services, queue name prefix) while others come from [`ConsumerSettings`] and can be
/// overridden for each [`MessageHandler`].
pub struct ConsumerGroup {
    consumers: Vec<Consumer>,
}

impl ConsumerGroup {
    /// Start building a [`ConsumerGroup`].
    ///
    /// Handlers resolve their services from `services`: from the root provider, or from a
    /// scope created for every delivery, depending on
    /// [`ConsumerSettings::dispatch_scope`].
    pub fn builder(
        connection_factory: ConnectionFactory,
        services: Arc<dyn ServiceProvider>,
        settings: ConsumerSettings,
    ) -> ConsumerGroupConfigurationBuilder {
        ConsumerGroupConfigurationBuilder::new(connection_factory, services, settings)
    }

    /// You can call `run_until_sigterm` to start consuming messages from the queues you bound.
    /// As the name implies, `run_until_sigterm` returns control to the caller only if:
    /// - one the message handlers crashes (e.g. disconnection);
    /// - the application is stopped via SIGTERM.
    pub async fn run_until_sigterm(self) -> Result<(), anyhow::Error> {
        self.run_until_shutdown(ShutdownHandler::sigterm()?).await
    }

    /// You can call `run_until_shutdown` to start consuming messages from the queues you bound.
    /// As the name implies, `run_until_shutdown` returns control to the caller only if:
    /// - one the message handlers crashes (e.g. disconnection);
    /// - the application is stopped via the shutdown handler.
    ///
    /// On shutdown, consumers stop pulling messages and wait for in-flight deliveries to be
    /// settled. Deliveries whose handler has not started yet are requeued.
    #[tracing::instrument(skip_all, name = "consumer_group_run")]
    pub async fn run_until_shutdown(
        self,
        shutdown: Arc<ShutdownHandler>,
    ) -> Result<(), anyhow::Error> {
        let cancellation = CancellationToken::new();
        let signal = {
            let shutdown = shutdown.clone();
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                shutdown.wait_for_signal().await;
                cancellation.cancel();
            })
        };

        let mut consumers = FuturesUnordered::from_iter(
            self.consumers
                .into_iter()
                .map(|c| c.run_until_shutdown(cancellation.clone()))
                .map(tokio::spawn),
        );

        // wait for all consumers to shutdown
        while let Some(res) = consumers.next().await {
            match res {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!("Consumer failed: {:?}", e),
                Err(e) => tracing::error!("Consumer task failed: {}", e),
            }
            // one consumer going down takes the whole group with it
            shutdown.shutdown();
        }
        signal.abort();
        Ok(())
    }
}

/// A builder to register message handlers once the group-level configuration of a
/// [`ConsumerGroup`](super::ConsumerGroup) has been finalised.
///
/// Use [`ConsumerGroup::builder`](super::ConsumerGroup::builder) as entrypoint.
pub struct ConsumerGroupBuilder {
    pub(super) group_configuration: ConsumerGroupConfiguration,
    pub(super) message_handlers: Vec<MessageHandler>,
}

impl ConsumerGroupBuilder {
    /// Add another [`MessageHandler`] to the [`ConsumerGroup`].
    ///
    /// Check out [`MessageHandler::builder`] to build out a handler.
    #[must_use]
    pub fn message_handler(mut self, message_handler: MessageHandler) -> Self {
        self.message_handlers.push(message_handler);
        self
    }

    /// Merge the message handler-level and the group-level configuration to build the underlying
    /// [`Consumer`] instance.
    async fn build_consumer(
        group_configuration: &ConsumerGroupConfiguration,
        connection: Arc<dyn ChannelFactory>,
        message_handler: MessageHandler,
    ) -> Result<Consumer, anyhow::Error> {
        let settings = &group_configuration.settings;

        let queue_name = match group_configuration.queue_name_prefix.as_ref() {
            Some(prefix) => format!("{0}_{1}", prefix, message_handler.queue_name),
            None => message_handler.queue_name.clone(),
        };

        // Use the message handler topology hooks, if provided.
        // Rely on the group-level ones otherwise.
        let topology_hooks = if !message_handler.topology_hooks.is_empty() {
            message_handler.topology_hooks
        } else {
            group_configuration.topology_hooks.clone()
        };

        let options = DispatchOptions::new(
            message_handler
                .dispatch_scope_override
                .unwrap_or(settings.dispatch_scope),
            message_handler
                .requeue_on_fault_override
                .unwrap_or(settings.requeue_on_handler_fault),
        )
        .with_telemetry(group_configuration.telemetry.clone());
        let dispatcher = (message_handler.dispatcher)(
            options,
            Arc::clone(&group_configuration.services),
        );

        Consumer::new(
            &group_configuration.connection_factory,
            &queue_name,
            message_handler
                .prefetch_count_override
                .unwrap_or(settings.prefetch_count),
            message_handler
                .dispatch_concurrency_override
                .unwrap_or(settings.dispatch_concurrency),
            group_configuration.exit_after,
            dispatcher,
            connection,
            topology_hooks,
        )
        .await
    }

    /// Once you have added all your [`MessageHandler`]s to the [`ConsumerGroup`], you can
    /// finalise the group by calling `build`.
    ///
    /// When you `.await` `build`, a connection is established with the message broker and all
    /// topology hooks are executed.
    ///
    /// `build` does NOT trigger consumptions of messages!
    /// Check out [`ConsumerGroup::run_until_sigterm`].
    pub async fn build(self) -> Result<ConsumerGroup, anyhow::Error> {
        let Self {
            group_configuration,
            message_handlers,
        } = self;

        let connection = match group_configuration.connection.clone() {
            Some(connection) => connection,
            None => publishing_pool(&group_configuration.connection_factory)?,
        };

        let consumers = message_handlers.into_iter().map(|m| {
            Self::build_consumer(&group_configuration, Arc::clone(&connection), m)
        });

        Ok(ConsumerGroup {
            consumers: try_join_all(consumers).await?,
        })
    }
}

/// Channels are opened lazily, on the first publish.
fn publishing_pool(
    connection_factory: &ConnectionFactory,
) -> Result<Arc<dyn ChannelFactory>, anyhow::Error> {
    let connection_pool = ConnectionPool::builder(connection_factory.clone())
        .max_size(1)
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build the connection pool: {}", e))?;
    let channel_pool = ChannelPool::builder(ChannelManager::new(connection_pool))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build the channel pool: {}", e))?;
    Ok(Arc::new(channel_pool))
}
