use crate::amqp::ConnectionFactory;
use deadpool::managed::{self, Manager};
use lapin::{Connection, ConnectionState};

/// A pool of [`Connection`]s, opened by a [`ConnectionFactory`].
///
/// Consumer groups publish replies through a pool of size one: every channel of the group
/// is multiplexed on the same connection.
pub type ConnectionPool = deadpool::managed::Pool<ConnectionFactory>;

#[async_trait::async_trait]
impl Manager for ConnectionFactory {
    type Type = Connection;
    type Error = super::Error;

    async fn create(&self) -> Result<Connection, super::Error> {
        let connection = self.new_connection().await?;
        tracing::debug!("Opened a pooled connection to {}", self.host());
        Ok(connection)
    }

    async fn recycle(&self, connection: &mut Connection) -> managed::RecycleResult<super::Error> {
        match connection.status().state() {
            ConnectionState::Connected => Ok(()),
            state => {
                tracing::warn!(?state, "Discarding an unhealthy pooled connection.");
                Err(super::unhealthy("Connection", state))
            }
        }
    }
}
