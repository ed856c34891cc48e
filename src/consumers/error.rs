use super::binding::BindError;
use super::result_action::ResultAction;
use crate::publishers::PublisherError;
use crate::serialization::SerializationError;

/// Why the processing of a delivery did not succeed.
#[derive(thiserror::Error, Debug)]
pub enum DispatchError {
    #[error("Failed to deserialize the message.")]
    Deserialization(#[from] SerializationError),
    #[error("Failed to bind the handler arguments.")]
    Binding(#[from] BindError),
    #[error("Failed to create the service scope of the message.")]
    Scope(#[source] anyhow::Error),
    #[error("The message handler failed.")]
    Handler(#[source] anyhow::Error),
    #[error("Processing was cancelled before the handler was invoked.")]
    Cancelled,
    #[error("The request has no reply-to address.")]
    MissingReplyTo,
    #[error("Failed to publish the reply.")]
    Reply(#[source] PublisherError),
    #[error("Failed to settle the message with the broker.")]
    ResultAction(#[source] anyhow::Error),
}

/// The outcome of processing a delivery: how it went, and how it was settled.
///
/// There is no public constructor: only the consumers produce outcomes.
#[derive(Debug)]
pub struct ProcessingOutcome {
    action: ResultAction,
    outcome: Result<(), DispatchError>,
}

impl ProcessingOutcome {
    pub(crate) fn new(action: ResultAction, outcome: Result<(), DispatchError>) -> Self {
        Self { action, outcome }
    }

    /// The action executed against the channel.
    ///
    /// It is reported even if the broker call itself failed.
    pub fn action(&self) -> ResultAction {
        self.action
    }

    pub fn result(&self) -> &Result<(), DispatchError> {
        &self.outcome
    }

    pub fn into_result(self) -> Result<(), DispatchError> {
        self.outcome
    }

    pub fn was_requeued(&self) -> bool {
        self.action.requeues()
    }
}

/// `error: cause: root cause`, for log lines.
pub(crate) fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }
    chain
}
