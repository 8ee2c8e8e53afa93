//! Broker core: routing, topology, message storage and consumer selection.
//!
//! Nothing in here touches the network. The `broker` module drives these
//! types from client sessions.

pub mod args;
pub mod binding;
pub mod consumer;
pub mod error;
pub mod exchange;
pub mod message;
pub mod queue;
pub mod routing;
pub mod store;
pub mod vhost;

pub use args::Arguments;
pub use binding::Binding;
pub use consumer::{Consumer, Deliver};
pub use error::BrokerError;
pub use exchange::Exchange;
pub use message::{BasicProperties, DeliveryMode, Message};
pub use queue::QueueDef;
pub use routing::ExchangeType;
pub use vhost::VirtualHost;
