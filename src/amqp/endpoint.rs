use crate::amqp::configuration::Settings;
use lapin::uri::AMQPUri;
use lapin::ExchangeKind;

/// The resolved connection target plus the routing topology of a consumer or a publisher.
///
/// A `BrokerEndpoint` is built once, from [`Settings`], and it is shared read-only (usually
/// behind an `Arc`) by every component working against the same broker.
#[derive(Debug, Clone)]
pub struct BrokerEndpoint {
    pub uri: AMQPUri,
    pub exchange: String,
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    /// Empty if the consumer tag should be generated when the consumer starts.
    pub consumer_tag: String,
    /// Whether published messages must be confirmed by the broker.
    pub reliable: bool,
}

impl BrokerEndpoint {
    pub fn from_settings(settings: &Settings) -> Self {
        let topology = &settings.topology;
        Self {
            uri: settings.rabbitmq.amqp_uri(),
            exchange: topology.exchange.clone(),
            exchange_kind: topology.exchange_kind(),
            queue: topology.queue.clone(),
            routing_key: topology.routing_key.clone(),
            consumer_tag: topology.consumer_tag.clone(),
            reliable: topology.reliable,
        }
    }

    /// `host:port/vhost`, without credentials. Safe to log.
    pub fn address(&self) -> String {
        format!(
            "{}:{}/{}",
            self.uri.authority.host, self.uri.authority.port, self.uri.vhost
        )
    }
}
