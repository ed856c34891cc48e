use crate::settings::RabbitMqSettings;
use anyhow::Context;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

const DEFAULT_CONNECTION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Clone)]
/// Everything required to open connections to a RabbitMq broker.
///
/// A `ConnectionFactory` is cheap to clone: consumer groups hand a copy to each consumer
/// and to the connection pool used for outbound publishing.
pub struct ConnectionFactory {
    uri: AMQPUri,
    connection_timeout: std::time::Duration,
    /// `None` means the connection is established in plain text.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// The connection timeout defaults to 10 seconds when left unspecified.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = match settings.tls.as_ref() {
            None => None,
            Some(tls_settings) => {
                let domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.amqp_uri().authority.host);

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }
                let connector = connector_builder
                    .build()
                    .context("Failed to build the TLS connector for RabbitMq.")?;

                Some(Arc::new(Tls {
                    connector,
                    domain_name,
                }))
            }
        };

        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            tls,
        })
    }

    /// The broker host, for diagnostics. Credentials stay out of it.
    pub fn host(&self) -> &str {
        &self.uri.authority.host
    }

    /// Replace the TLS connector, expecting the broker host as certificate domain.
    pub fn set_tls_connector(&mut self, connector: NativeTlsConnector) {
        let domain_name = self.uri.authority.host.clone();
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// Open a new connection to the RabbitMq broker.
    ///
    /// It establishes an encrypted connection if TLS settings were provided.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(&self) -> Result<lapin::Connection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connect = async {
            match &self.tls {
                None => lapin::Connection::connect_uri(self.uri.clone(), properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        };
        let connection = timeout(self.connection_timeout, connect)
            .await
            .context("Timed out while trying to connect to RabbitMq.")?
            .context("Failed to connect to RabbitMq.")?;

        connection.on_error(|e| {
            warn!("RabbitMq broken connection: {:?}", e);
        });
        Ok(connection)
    }

    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // Plain TCP first, then the TLS handshake with our own connector so that
                // the expected certificate domain can differ from the broker host.
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    .and_then(|tcp| tcp.into_native_tls(&tls.connector, &tls.domain_name))
            }),
            properties,
        )
        .await
    }

    /// Open a dedicated connection and a channel on top of it.
    ///
    /// Consumers own their channel for their whole lifetime.
    pub(crate) async fn new_channel(&self) -> Result<lapin::Channel, anyhow::Error> {
        Ok(self.new_connection().await?.create_channel().await?)
    }
}
