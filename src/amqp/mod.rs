//! Helpers for connecting to a rabbitmq broker

pub mod configuration;
mod endpoint;
mod factory;
mod rabbit_mq;
pub mod transport;

pub use endpoint::BrokerEndpoint;
pub use factory::ConnectionFactory;
pub use rabbit_mq::{RabbitMqChannel, RabbitMqConnection};

pub use lapin::{options, types, BasicProperties, ExchangeKind};
