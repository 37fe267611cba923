//! `amqp-tools` helps services talk to RabbitMQ without babysitting the connection,
//! built on top of [`lapin`].
//!
//! [`Consumer`](crate::consumers::Consumer) keeps consuming from a queue across connection and
//! channel failures, reconnecting until it is shut down.
//! [`Publisher`](crate::publishers::Publisher) publishes messages to an exchange, optionally
//! waiting for the broker to confirm them.
//!
//! Both are configured from a [`BrokerEndpoint`](crate::amqp::BrokerEndpoint), usually loaded
//! from a TOML file (see [`Settings`](crate::amqp::configuration::Settings)).

pub mod consumers;
pub mod publishers;

pub mod amqp;
