use deadpool::managed::{PoolError, RecycleError};
use std::fmt::Debug;

/// Failure to open or check out a pooled connection or channel.
#[derive(thiserror::Error, Debug)]
#[error(transparent)]
pub struct Error(#[from] anyhow::Error);

impl From<lapin::Error> for Error {
    fn from(err: lapin::Error) -> Self {
        Self(err.into())
    }
}

impl From<PoolError<Error>> for Error {
    fn from(err: PoolError<Error>) -> Self {
        match err {
            PoolError::Backend(e) => e,
            PoolError::Timeout(kind) => {
                Self(anyhow::anyhow!("Timed out waiting for the pool ({kind:?})."))
            }
            err => Self(anyhow::anyhow!("The pool failed to hand out an object: {err}")),
        }
    }
}

/// Pooled objects are discarded unless connected.
pub(super) fn unhealthy(kind: &str, state: impl Debug) -> RecycleError<Error> {
    RecycleError::Message(format!("{kind} is not in a healthy state: {state:?}"))
}
