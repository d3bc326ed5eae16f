//! services/api/src/broker/mod.rs
//!
//! The resilient message-broker client and its transports.

pub mod amqp;
pub mod client;
pub mod error;
pub mod memory;
pub mod transport;

pub use amqp::AmqpTransport;
pub use client::{BrokerClient, BrokerState};
pub use error::{BrokerError, BrokerResult};
pub use memory::{MemoryBroker, MemoryStats};
pub use transport::{Confirmation, Transport, TransportChannel, TransportConnection};
