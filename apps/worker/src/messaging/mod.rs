pub mod connection;
pub mod consumer;
pub mod handler;
pub mod memory;
pub mod rabbitmq;
pub mod transport;

pub use connection::{ConnectionError, RabbitMqConnection};
pub use consumer::{ConsumerLoop, ConsumerSettings};
pub use handler::{handler_fn, FnHandler, HandlerError, MessageHandler};
pub use memory::{DeadLetter, InMemoryQueue};
pub use rabbitmq::RabbitMqTransport;
pub use transport::{LeaseRenewal, LeasedMessage, QueueTransport, TransportError};
