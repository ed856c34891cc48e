use super::binding::Arguments;
use super::result_action::ResultAction;
use std::future::Future;

/// What a handler produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome<T> {
    /// Processing succeeded. For request/reply handlers, `T` is the response.
    Value(T),
    /// Settle the delivery exactly like this. No reply is sent.
    Action(ResultAction),
}

impl HandlerOutcome<()> {
    /// Processing succeeded and there is nothing to return.
    pub fn done() -> Self {
        Self::Value(())
    }
}

impl<T> From<ResultAction> for HandlerOutcome<T> {
    fn from(action: ResultAction) -> Self {
        Self::Action(action)
    }
}

/// Implementers of the `Handler` trait process the messages of a queue.
///
/// Handlers never see the channel: the consumer settles the delivery according to the
/// returned [`HandlerOutcome`], or the error. Most of the time you will register an async
/// closure, wrapped in a [`ClosureHandler`] by the builders.
#[async_trait::async_trait]
pub trait Handler<M: Send + Sync + 'static>: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn handle(
        &self,
        arguments: Arguments<M>,
    ) -> Result<HandlerOutcome<Self::Output>, anyhow::Error>;
}

/// A [`Handler`] out of an async function taking the bound [`Arguments`].
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<M, F, Fut, T, E> Handler<M> for ClosureHandler<F>
where
    M: Send + Sync + 'static,
    F: Fn(Arguments<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<HandlerOutcome<T>, E>> + Send + 'static,
    T: Send + 'static,
    E: Into<anyhow::Error> + 'static,
{
    type Output = T;

    async fn handle(&self, arguments: Arguments<M>) -> Result<HandlerOutcome<T>, anyhow::Error> {
        (self.0)(arguments).await.map_err(Into::into)
    }
}
