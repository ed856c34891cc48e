#![allow(clippy::too_many_arguments)]
use super::context::{Delivery, Inbound};
use super::dispatch::Dispatch;
use super::error::ProcessingOutcome;
use super::TopologyHook;
use crate::amqp::ConnectionFactory;
use crate::transport::{BrokerChannel, ChannelFactory};
use amq_protocol_types::FieldTable;
use futures_util::{stream::FuturesUnordered, Stream, StreamExt};
use lapin::{
    options::{BasicCancelOptions, BasicConsumeOptions, BasicQosOptions},
    Channel,
};
use std::num::{NonZeroU16, NonZeroUsize};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// The actual implementation of a RabbitMq consumer.
///
/// [`ConsumerGroup`] instantiates a `Consumer` for each [`MessageHandler`].
///
/// [`ConsumerGroup`]: super::ConsumerGroup
/// [`MessageHandler`]: super::MessageHandler
pub(super) struct Consumer {
    /// Dedicated to this consumer: deliveries are pulled and settled on it.
    channel: Channel,
    queue_name: String,
    /// Stop after this many deliveries. `None` consumes indefinitely.
    exit_after: Option<usize>,
    dispatch_concurrency: NonZeroUsize,
    dispatcher: Arc<dyn Dispatch>,
    /// Shared by all the consumers of a group, for publishing.
    connection: Arc<dyn ChannelFactory>,
}

impl Consumer {
    /// Open a channel, set its prefetch count and run the topology hooks against it.
    ///
    /// Use [`Consumer::run_until_shutdown`] to start consuming messages.
    #[tracing::instrument(
        skip(connection_factory, dispatcher, connection, topology_hooks),
        name = "consumer_new"
    )]
    pub(super) async fn new(
        connection_factory: &ConnectionFactory,
        queue_name: &str,
        prefetch_count: NonZeroU16,
        dispatch_concurrency: NonZeroUsize,
        exit_after: Option<usize>,
        dispatcher: Arc<dyn Dispatch>,
        connection: Arc<dyn ChannelFactory>,
        topology_hooks: Vec<Arc<dyn TopologyHook>>,
    ) -> Result<Consumer, anyhow::Error> {
        let channel = connection_factory.new_channel().await?;
        channel
            .basic_qos(prefetch_count.get(), BasicQosOptions { global: false })
            .await?;

        for hook in topology_hooks {
            hook.run(&channel, queue_name, FieldTable::default())
                .await?;
        }

        Ok(Consumer {
            channel,
            queue_name: queue_name.into(),
            exit_after,
            dispatch_concurrency,
            dispatcher,
            connection,
        })
    }

    /// Ask RabbitMq to start pushing messages and dispatch them until `shutdown` is
    /// cancelled, the broker consumer goes away or the channel fails.
    #[tracing::instrument(skip_all, name = "consumer_run", fields(queue_name = %self.queue_name))]
    pub(super) async fn run_until_shutdown(
        self,
        shutdown: CancellationToken,
    ) -> Result<(), anyhow::Error> {
        let consumer = self
            .channel
            .basic_consume(
                &self.queue_name,
                &Uuid::new_v4().to_string(),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        let consumer_tag = consumer.tag();

        let deliveries =
            consumer.map(|event| event.map(Delivery::from).map_err(anyhow::Error::from));
        let result = DispatchLoop {
            queue_name: self.queue_name.as_str().into(),
            dispatcher: self.dispatcher,
            channel: Arc::new(self.channel.clone()),
            connection: self.connection,
            dispatch_concurrency: self.dispatch_concurrency,
            exit_after: self.exit_after,
        }
        .run(deliveries, shutdown.clone())
        .await;

        if shutdown.is_cancelled() {
            if let Err(e) = self
                .channel
                .basic_cancel(consumer_tag.as_str(), BasicCancelOptions::default())
                .await
            {
                tracing::warn!("Failed to cancel the consumer: {}", e);
            }
        }
        result
    }
}

/// Pulls deliveries and spawns a task to dispatch each of them.
///
/// At most `dispatch_concurrency` deliveries are in flight: a permit is acquired before
/// the next delivery is pulled and released once it has been settled.
pub(super) struct DispatchLoop {
    pub(super) queue_name: Arc<str>,
    pub(super) dispatcher: Arc<dyn Dispatch>,
    pub(super) channel: Arc<dyn BrokerChannel>,
    pub(super) connection: Arc<dyn ChannelFactory>,
    pub(super) dispatch_concurrency: NonZeroUsize,
    pub(super) exit_after: Option<usize>,
}

impl DispatchLoop {
    pub(super) async fn run<St>(
        self,
        deliveries: St,
        shutdown: CancellationToken,
    ) -> Result<(), anyhow::Error>
    where
        St: Stream<Item = Result<Delivery, anyhow::Error>>,
    {
        let permits = Arc::new(Semaphore::new(self.dispatch_concurrency.get()));
        let mut in_flight: FuturesUnordered<JoinHandle<ProcessingOutcome>> =
            FuturesUnordered::new();
        let mut counter = 0;
        tokio::pin!(deliveries);

        let result = 'event_loop: loop {
            // have we consumed all the events we want?
            if self.exit_after == Some(counter) {
                break 'event_loop Ok(());
            }

            // Shutdowns win over everything else, then finished tasks are cleared out.
            let permit = tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("Consumer received a shutdown signal.");
                    break 'event_loop Ok(());
                }

                Some(joined) = in_flight.next(), if !in_flight.is_empty() => {
                    log_task_failure(joined);
                    continue 'event_loop;
                }

                permit = Arc::clone(&permits).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(e) => break 'event_loop Err(e.into()),
                },
            };

            let delivery = loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        tracing::info!("Consumer received a shutdown signal.");
                        break 'event_loop Ok(());
                    }

                    Some(joined) = in_flight.next(), if !in_flight.is_empty() => {
                        log_task_failure(joined);
                    }

                    event = deliveries.next() => match event {
                        // the broker consumer was cancelled
                        None => break 'event_loop Ok(()),
                        Some(Err(e)) => {
                            tracing::error!("Consumer error: {}", e);
                            break 'event_loop Err(e);
                        }
                        Some(Ok(delivery)) => break delivery,
                    },
                }
            };

            // Each delivery runs in its own task: a panic while processing one message
            // does not tear the whole consumer down.
            let inbound = Inbound {
                delivery,
                channel: Arc::clone(&self.channel),
                connection: Arc::clone(&self.connection),
                cancellation: shutdown.clone(),
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            let queue_name = Arc::clone(&self.queue_name);
            in_flight.push(tokio::spawn(async move {
                let outcome = dispatcher.dispatch(&queue_name, inbound).await;
                drop(permit);
                outcome
            }));
            counter += 1;
        };

        // Make sure all tasks in flight complete before returning.
        while let Some(joined) = in_flight.next().await {
            log_task_failure(joined);
        }

        result
    }
}

fn log_task_failure(joined: Result<ProcessingOutcome, JoinError>) {
    if let Err(e) = joined {
        tracing::error!("Message processing task failed: {}", e);
    }
}
