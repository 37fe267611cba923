//! Facilities to consume messages from a RabbitMq queue. Check out [`Consumer`] as a
//! starting point.
pub use connection_manager::{ChannelOf, ConnectionManager, DeliveryOf, SessionHandle};
pub use consumer::{Consumer, ConsumerBuilder};
pub use dispatcher::{BrokerAction, DeliveryDispatcher};
pub use error::{ConnectionError, HandlerError, SessionPhase};
pub use handler::{AsyncClosure, ClosureHandler, Handler};
pub use incoming_message::{Delivery, Incoming};
pub use supervisor::{ReconnectSupervisor, SupervisorState, DEFAULT_RECONNECT_DELAY};

mod connection_manager;
mod consumer;
mod dispatcher;
mod error;
mod handler;
pub mod hooks;
mod incoming_message;
mod supervisor;
