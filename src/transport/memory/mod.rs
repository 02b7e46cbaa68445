// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! A pure in-process broker implementing the domain-level `Transport` and
//! `Connector` traits. It backs the test suite and `memory://` URIs, and it
//! is the reference for the broker semantics the RPC core depends on:
//!
//! - Routing keys address queues of the same name; messages published to a
//!   queue nobody declared are dropped.
//! - Consumers on one queue compete; ready messages go round-robin to
//!   consumers that have room in their prefetch window.
//! - Manual deliveries stay unacked until `ack()`; `nack(true)` puts the
//!   message back at the head of the queue.
//! - Closing a connection requeues its unacked deliveries and deletes the
//!   exclusive queues it declared.
//!
//! ## Non-Goals
//!
//! Persistence, exchanges other than the default one, TTLs and dead
//! lettering are not modelled.

mod broker;
mod transport;

pub use broker::MemoryBroker;
pub use transport::{global_memory_broker, MemoryConnector};
