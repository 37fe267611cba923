use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::rabbit_mq::RabbitMqConnection;
use crate::amqp::transport::Transport;
use anyhow::Context;
use lapin::tcp::{AMQPUriTcpExt, NativeTlsConnector};
use lapin::uri::{AMQPScheme, AMQPUri};
use lapin::ConnectionProperties;
use std::sync::Arc;
use std::time::Duration;

/// Used when the settings do not specify a connection timeout.
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(10);

/// `ConnectionFactory` dials RabbitMq brokers: it is the [`Transport`] backed by `lapin`.
///
/// It holds everything needed to open a connection apart from the address, which comes from
/// the [`BrokerEndpoint`](crate::amqp::BrokerEndpoint) of the caller.
/// Cloning a factory is cheap.
#[derive(Clone)]
pub struct ConnectionFactory {
    connection_timeout: Duration,
    /// Plain TCP if `None`.
    tls: Option<Arc<TlsParameters>>,
}

struct TlsParameters {
    connector: NativeTlsConnector,
    /// Expected on the server certificate. The broker host is used if `None`.
    domain: Option<String>,
}

impl ConnectionFactory {
    /// Build a factory out of the connection settings.
    ///
    /// Fails if the CA certificate chain in the TLS settings cannot be parsed.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let mut factory = Self {
            connection_timeout: settings
                .connection_timeout()
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT),
            tls: None,
        };
        if let Some(tls_settings) = &settings.tls {
            let mut builder = NativeTlsConnector::builder();
            if let Some(ca_chain) = tls_settings.ca_certificate_chain()? {
                builder.add_root_certificate(ca_chain);
            }
            let connector = builder
                .build()
                .context("Failed to build the TLS connector for RabbitMq.")?;
            factory.set_tls_connector_with_domain(connector, tls_settings.domain.clone());
        }
        Ok(factory)
    }

    /// Encrypt connections with `connector`, expecting `domain` on the server certificate
    /// (or the broker host, if `None`).
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain: Option<String>,
    ) {
        self.tls = Some(Arc::new(TlsParameters { connector, domain }));
    }

    async fn dial(&self, uri: AMQPUri) -> Result<lapin::Connection, lapin::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let Some(tls) = self.tls.clone() else {
            return lapin::Connection::connect_uri(uri, properties).await;
        };

        let domain = tls
            .domain
            .clone()
            .unwrap_or_else(|| uri.authority.host.clone());
        let connect = move |uri: &AMQPUri| {
            // TCP first, then the TLS handshake against the expected domain
            let mut plain = uri.clone();
            plain.scheme = AMQPScheme::AMQP;
            plain
                .connect()
                .and_then(|stream| stream.into_native_tls(&tls.connector, &domain))
        };
        lapin::Connection::connector(uri, Box::new(connect), properties).await
    }
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    type Connection = RabbitMqConnection;

    #[tracing::instrument(
        name = "rabbitmq_connect",
        skip_all,
        fields(
            host = %uri.authority.host,
            port = uri.authority.port,
            vhost = %uri.vhost,
            tls = self.tls.is_some()
        )
    )]
    async fn connect(&self, uri: &AMQPUri) -> Result<RabbitMqConnection, anyhow::Error> {
        let connection = tokio::time::timeout(self.connection_timeout, self.dial(uri.clone()))
            .await
            .with_context(|| {
                format!(
                    "Gave up connecting to RabbitMq after {:?}.",
                    self.connection_timeout
                )
            })?
            .context("Failed to connect to RabbitMq.")?;
        Ok(RabbitMqConnection::new(connection))
    }
}
