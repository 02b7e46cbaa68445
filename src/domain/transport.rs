// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker-facing interface used by the RPC client
//! and the consumer dispatch loop. It models the small subset of an
//! AMQP-style broker that request/reply bridging needs:
//!
//! - named queues reachable through a default exchange (routing key = queue name),
//! - private, exclusive, server-named reply queues,
//! - per-message `reply_to` and `correlation_id` metadata,
//! - consumers with a prefetch window and explicit acknowledgement.
//!
//! It intentionally avoids any reference to concrete client libraries.
//! Concrete implementations live under `src/transport/`.
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::{CorrelationId, Result};

/// Content type stamped on every JSON body published by this crate.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// A queue name or routing key.
///
/// With the default exchange a routing key addresses the queue of the same
/// name, so both roles share one type. Cheap to clone and safe to share.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Borrow the address as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<T> From<T> for Address
where
    T: Into<Arc<str>>,
{
    fn from(value: T) -> Self {
        Address(value.into())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit exchanged over the broker.
///
/// `reply_to` is set only on requests. Replies carry just the echoed
/// `correlation_id`; one-way commands carry neither.
///
/// # Examples
///
/// ```
/// # use broker_rpc::{Address, CorrelationId, Envelope};
/// # use bytes::Bytes;
/// let request = Envelope::request(
///     Address::from("suppliers.get_products"),
///     Bytes::from_static(br#"{"product_ids":null}"#),
///     CorrelationId::generate(),
///     Address::from("amq.gen-reply"),
/// );
/// assert!(request.reply_to.is_some());
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    /// Target queue of the message.
    pub routing_key: Address,

    /// Opaque body, conventionally UTF-8 JSON.
    pub body: Bytes,

    /// Token linking a request to its reply.
    pub correlation_id: Option<CorrelationId>,

    /// Private queue the reply must be published to.
    pub reply_to: Option<Address>,

    /// Informational content type of `body`.
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    /// Create a request expecting a reply on `reply_to`.
    pub fn request(
        routing_key: Address,
        body: Bytes,
        correlation_id: CorrelationId,
        reply_to: Address,
    ) -> Self {
        Self {
            routing_key,
            body,
            correlation_id: Some(correlation_id),
            reply_to: Some(reply_to),
            content_type: Some(Arc::from(CONTENT_TYPE_JSON)),
        }
    }

    /// Create a reply addressed to a request's `reply_to` queue.
    pub fn reply(reply_to: Address, body: Bytes, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            routing_key: reply_to,
            body,
            correlation_id,
            reply_to: None,
            content_type: Some(Arc::from(CONTENT_TYPE_JSON)),
        }
    }

    /// Create a fire-and-forget command; no reply will be produced.
    pub fn command(routing_key: Address, body: Bytes) -> Self {
        Self {
            routing_key,
            body,
            correlation_id: None,
            reply_to: None,
            content_type: Some(Arc::from(CONTENT_TYPE_JSON)),
        }
    }
}

/// How a consumer pulls from a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Maximum number of unacknowledged deliveries held at once.
    /// `None` means unbounded.
    pub prefetch: Option<u16>,

    /// Deliveries count as acknowledged as soon as they are handed out.
    pub auto_ack: bool,
}

impl ConsumeOptions {
    /// One message at a time, acknowledged explicitly after the reply.
    pub fn work_queue() -> Self {
        Self {
            prefetch: Some(1),
            auto_ack: false,
        }
    }

    /// Unbounded, auto-acknowledged; used for private reply queues.
    pub fn reply_queue() -> Self {
        Self {
            prefetch: None,
            auto_ack: true,
        }
    }
}

/// Settles one delivery with the broker.
#[async_trait::async_trait]
pub trait Acknowledger: Send + Sync {
    /// Positive acknowledgement; the broker forgets the message.
    async fn ack(&self) -> Result<()>;

    /// Negative acknowledgement; with `requeue` the broker redelivers it.
    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// An inbound envelope together with its acknowledgement handle.
pub struct Delivery {
    /// The received message.
    pub envelope: Envelope,
    acker: Option<Box<dyn Acknowledger>>,
}

impl Delivery {
    /// Wrap an envelope that must be settled through `acker`.
    pub fn new(envelope: Envelope, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            envelope,
            acker: Some(acker),
        }
    }

    /// Wrap an envelope from an auto-ack consumer.
    pub fn auto_acked(envelope: Envelope) -> Self {
        Self {
            envelope,
            acker: None,
        }
    }

    /// Acknowledge the delivery. A no-op for auto-acked deliveries.
    pub async fn ack(self) -> Result<()> {
        match self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    /// Reject the delivery. A no-op for auto-acked deliveries.
    pub async fn nack(self, requeue: bool) -> Result<()> {
        match self.acker {
            Some(acker) => acker.nack(requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .field("manual_ack", &self.acker.is_some())
            .finish()
    }
}

/// Handle returned from a successful `consume()`.
///
/// The consumer stays registered until the owning connection is closed.
/// The inbox yields `None` once the broker side goes away.
pub struct SubscriptionHandle {
    /// Receiver for deliveries from the consumed queue.
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Shared base state for all transport implementations.
pub struct TransportBase {
    /// Name of the connection, used in logs and consumer tags.
    pub connection_name: String,
}

impl TransportBase {
    /// Create a new TransportBase.
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self {
            connection_name: connection_name.into(),
        }
    }
}

/// One open broker connection with a single channel.
///
/// Implementations must ensure that:
/// - publishing to a queue nobody declared drops the message silently,
/// - a queue returned by `declare_reply_queue()` is private to this
///   connection and deleted when it closes,
/// - deliveries left unacknowledged at `close()` go back to their queue.
///
/// The in-memory transport is the reference implementation of these rules.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Name this connection was opened with.
    fn connection_name(&self) -> &str {
        &self.base().connection_name
    }

    /// Publish an envelope to `env.routing_key` on the default exchange.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Declare a shared named queue. Idempotent.
    async fn declare_queue(&self, queue: &Address) -> Result<()>;

    /// Declare an exclusive, server-named queue and return its name.
    async fn declare_reply_queue(&self) -> Result<Address>;

    /// Start consuming from a previously declared queue.
    async fn consume(&self, queue: &Address, opts: ConsumeOptions) -> Result<SubscriptionHandle>;

    /// Close the connection and release its queues and consumers.
    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
pub type TransportPtr = Arc<dyn Transport>;

/// Opens broker connections.
///
/// The client acquires one connection per call through this factory; each
/// consumer holds one for its lifetime.
#[async_trait::async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection. Unreachable brokers yield `RpcError::Connection`.
    async fn connect(&self, connection_name: &str) -> Result<TransportPtr>;
}

/// Shared connector pointer.
pub type ConnectorPtr = Arc<dyn Connector>;
