//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` and `Connector` traits. Broker client libraries stay behind
//! feature flags and are exposed only through their connector types.
//!
//! Domain code must not depend on transport-specific types.

mod memory;

#[cfg(feature = "transport_lapin")]
mod amqp;

pub use memory::{global_memory_broker, MemoryBroker, MemoryConnector};

#[cfg(feature = "transport_lapin")]
pub use amqp::AmqpConnector;
