use amq_protocol_types::FieldTable;
use lapin::Channel;

#[async_trait::async_trait]
/// Declares the broker objects a [`MessageHandler`] relies on, before it starts consuming.
///
/// Hooks run once, when the [`ConsumerGroup`] is built, against the channel the consumer
/// will pull messages from. `queue_args` are the arguments the queue must be declared
/// with: wrapping hooks (e.g. dead lettering or priorities) add to them before delegating.
///
/// Ready-made hooks live in [`hooks::topology`].
///
/// [`MessageHandler`]: crate::consumers::MessageHandler
/// [`ConsumerGroup`]: crate::consumers::ConsumerGroup
/// [`hooks::topology`]: crate::consumers::hooks::topology
pub trait TopologyHook: Send + Sync + 'static {
    async fn run(
        &self,
        channel: &Channel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error>;
}

/// assert it's object safe
type _CHECK = Box<dyn TopologyHook>;
