//! Topology hooks declaring queues, exchanges and bindings.
//!
//! ```
//! use carrot_dispatch::consumers::hooks::topology::{
//!     Bind, Binding, DeclareDurableQueue, Exchange, ExchangeKind, WithDeadLetterQueue,
//!     WithPriority,
//! };
//!
//! // A durable topic exchange, bound with two routing keys to a durable queue whose
//! // rejected messages end up in `<queue>.deadletter`.
//! let hook = Bind {
//!     exchange: Exchange::durable("billing", ExchangeKind::Topic),
//!     queue: WithDeadLetterQueue(DeclareDurableQueue),
//!     binding: Binding::routing_keys(["invoice.issued", "invoice.paid"]),
//! };
//! # drop(hook);
//!
//! // Requests published straight to the queue, up to priority 5.
//! let hook = WithPriority {
//!     queue: DeclareDurableQueue,
//!     priority: 5,
//! };
//! # drop(hook);
//!
//! // Only messages whose headers all match.
//! let hook = Bind {
//!     exchange: Exchange::existing("payments"),
//!     queue: DeclareDurableQueue,
//!     binding: Binding::all_headers([("currency", "EUR"), ("country", "FR")]),
//! };
//! # drop(hook);
//! ```
use crate::consumers::TopologyHook;
use amq_protocol_types::{AMQPValue, FieldTable, LongString};
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::Channel;
pub use lapin::ExchangeKind;

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const MAX_PRIORITY_ARG: &str = "x-max-priority";

/// The exchange a queue gets bound to.
#[derive(Debug, Clone)]
pub enum Exchange {
    /// Declared, durable, if it does not exist yet.
    Durable { name: String, kind: ExchangeKind },
    /// Assumed to exist already: nothing is declared.
    Existing { name: String },
}

impl Exchange {
    pub fn durable(name: impl Into<String>, kind: ExchangeKind) -> Self {
        Self::Durable {
            name: name.into(),
            kind,
        }
    }

    pub fn existing(name: impl Into<String>) -> Self {
        Self::Existing { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Durable { name, .. } | Self::Existing { name } => name,
        }
    }

    async fn declare(&self, channel: &Channel) -> Result<(), anyhow::Error> {
        if let Self::Durable { name, kind } = self {
            channel
                .exchange_declare(
                    name,
                    kind.clone(),
                    ExchangeDeclareOptions {
                        durable: true,
                        ..ExchangeDeclareOptions::default()
                    },
                    FieldTable::default(),
                )
                .await?;
        }
        Ok(())
    }
}

/// Which of the bound headers must match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderMatch {
    All,
    Any,
}

/// How a queue is bound to an exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Binding {
    /// One binding per routing key.
    RoutingKeys(Vec<String>),
    /// A single binding on a [headers exchange](https://www.rabbitmq.com/tutorials/amqp-concepts.html#exchange-headers).
    Headers {
        matching: HeaderMatch,
        headers: Vec<(String, String)>,
    },
}

impl Binding {
    pub fn routing_key(key: impl Into<String>) -> Self {
        Self::RoutingKeys(vec![key.into()])
    }

    pub fn routing_keys<I, K>(keys: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self::RoutingKeys(keys.into_iter().map(Into::into).collect())
    }

    pub fn all_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::headers(HeaderMatch::All, headers)
    }

    pub fn any_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::headers(HeaderMatch::Any, headers)
    }

    fn headers<I, K, V>(matching: HeaderMatch, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self::Headers {
            matching,
            headers: headers
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        }
    }

    /// `(routing key, arguments)` of every `queue.bind` to issue.
    fn bindings(&self) -> Vec<(&str, FieldTable)> {
        match self {
            Self::RoutingKeys(keys) => keys
                .iter()
                .map(|key| (key.as_str(), FieldTable::default()))
                .collect(),
            Self::Headers { matching, headers } => {
                let mut args = FieldTable::default();
                for (key, value) in headers {
                    args.insert(
                        key.as_str().into(),
                        AMQPValue::LongString(LongString::from(value.as_str())),
                    );
                }
                let matching = match matching {
                    HeaderMatch::All => "all",
                    HeaderMatch::Any => "any",
                };
                args.insert("x-match".into(), AMQPValue::LongString(matching.into()));
                vec![("", args)]
            }
        }
    }

    async fn bind(
        &self,
        channel: &Channel,
        exchange_name: &str,
        queue_name: &str,
    ) -> Result<(), anyhow::Error> {
        for (routing_key, args) in self.bindings() {
            channel
                .queue_bind(
                    queue_name,
                    exchange_name,
                    routing_key,
                    QueueBindOptions::default(),
                    args,
                )
                .await?;
        }
        Ok(())
    }
}

/// Declare the exchange, then the queue through `queue`, then bind them.
pub struct Bind<Q: TopologyHook> {
    pub exchange: Exchange,
    pub queue: Q,
    pub binding: Binding,
}

#[async_trait::async_trait]
impl<Q: TopologyHook> TopologyHook for Bind<Q> {
    async fn run(
        &self,
        channel: &Channel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.exchange.declare(channel).await?;
        self.queue.run(channel, queue_name, queue_args).await?;
        self.binding
            .bind(channel, self.exchange.name(), queue_name)
            .await
    }
}

/// Declare the queue as durable.
#[derive(Debug, Clone, Copy)]
pub struct DeclareDurableQueue;

#[async_trait::async_trait]
impl TopologyHook for DeclareDurableQueue {
    async fn run(
        &self,
        channel: &Channel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                queue_args,
            )
            .await?;
        Ok(())
    }
}

/// Give the queue declared by the wrapped hook a [dead letter exchange](https://www.rabbitmq.com/dlx.html).
///
/// A durable fanout exchange and a durable queue, both named `<queue_name>.deadletter`, are
/// declared and bound together. Queue arguments are immutable: adding dead lettering to an
/// existing queue requires a new queue.
pub struct WithDeadLetterQueue<Q: TopologyHook>(pub Q);

#[async_trait::async_trait]
impl<Q: TopologyHook> TopologyHook for WithDeadLetterQueue<Q> {
    async fn run(
        &self,
        channel: &Channel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        let dead_letter = dead_letter_name(queue_name);
        Bind {
            exchange: Exchange::durable(dead_letter.as_str(), ExchangeKind::Fanout),
            queue: DeclareDurableQueue,
            binding: Binding::routing_key(""),
        }
        .run(channel, &dead_letter, FieldTable::default())
        .await?;

        self.0
            .run(channel, queue_name, with_dead_letter_exchange(queue_args, &dead_letter))
            .await
    }
}

/// Turn the queue declared by the wrapped hook into a [priority queue](https://www.rabbitmq.com/priority.html).
///
/// Queue arguments are immutable: changing the maximum priority requires a new queue.
pub struct WithPriority<Q: TopologyHook> {
    pub queue: Q,
    /// Between 1 and 255. Every level has a memory and CPU cost.
    pub priority: u8,
}

#[async_trait::async_trait]
impl<Q: TopologyHook> TopologyHook for WithPriority<Q> {
    async fn run(
        &self,
        channel: &Channel,
        queue_name: &str,
        queue_args: FieldTable,
    ) -> Result<(), anyhow::Error> {
        self.queue
            .run(channel, queue_name, with_max_priority(queue_args, self.priority))
            .await
    }
}

fn dead_letter_name(queue_name: &str) -> String {
    format!("{queue_name}.deadletter")
}

fn with_dead_letter_exchange(mut args: FieldTable, exchange: &str) -> FieldTable {
    args.insert(
        DEAD_LETTER_EXCHANGE_ARG.into(),
        AMQPValue::LongString(exchange.into()),
    );
    args
}

fn with_max_priority(mut args: FieldTable, priority: u8) -> FieldTable {
    args.insert(MAX_PRIORITY_ARG.into(), AMQPValue::ShortShortUInt(priority));
    args
}
