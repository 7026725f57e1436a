//! # Calendar MQ
//! Broker plumbing for notifications: a self-healing link over a pluggable
//! transport, the producer the scheduler publishes through, and the
//! consumer behind the `sender` role.

pub mod amqp;
pub mod consumer;
pub mod link;
pub mod memory;
pub mod producer;
pub mod transport;

pub use amqp::AmqpConnector;
pub use consumer::{Consumer, LogHandler, NotificationHandler};
pub use link::{Link, LinkSession, LinkState, Topology};
pub use memory::MemoryBroker;
pub use producer::Producer;
pub use transport::{BrokerConnector, BrokerSession, Confirmation, Delivery};
