// src/client/mod.rs
//! RPC client implementation.
//!
//! This module contains the core [`RpcClient`] type which publishes requests
//! to operation queues and waits for the matching reply, plus the typed
//! wrappers built on top of it.
//!
//! # Architecture
//!
//! A client owns one broker connection and an exclusive, server-named reply
//! queue declared at construction. A background receive task forwards every
//! delivery on that queue to the single pending slot, which accepts it only
//! if the correlation id matches the call in flight.
//!
//! Each call generates a fresh correlation id and registers a oneshot channel
//! in the slot. The caller awaits that channel under `tokio::time::timeout`;
//! nothing polls.
//!
//! # Scoped calls
//!
//! Most call sites want "connect, call once, close". The free functions
//! [`call`] and [`send`] do exactly that and release the connection on every
//! exit path, including when the calling future is dropped.

mod pending;
mod suppliers;
mod users;

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use pending::PendingReply;

pub use suppliers::{ProductRecord, SuppliersClient};
pub use users::{NewSeller, SellerRecord, UsersClient};

use crate::{
    // ---
    codec,
    log_debug,
    log_warn,
    Address,
    Connector,
    ConsumeOptions,
    CorrelationId,
    Envelope,
    Result,
    RpcError,
    TransportPtr,
};

/// Connection name used by clients opened through [`call`] and [`send`].
const CLIENT_CONNECTION_NAME: &str = "rpc-client";

/// Request/reply client bound to one broker connection.
///
/// Calls take `&mut self`, so one client never has more than one request in
/// flight. Concurrent callers use separate clients; each has its own reply
/// queue, so their replies cannot cross.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use broker_rpc::{MemoryConnector, RpcClient};
/// use serde_json::json;
///
/// # async fn example() -> broker_rpc::Result<()> {
/// let connector = MemoryConnector::global();
/// let mut client = RpcClient::connect(&connector, "sales").await?;
///
/// let reply = client
///     .call("users.get_sellers", &json!({ "seller_ids": null }), Duration::from_secs(5))
///     .await;
///
/// client.close().await?;
/// let _sellers = reply?;
/// # Ok(())
/// # }
/// ```
pub struct RpcClient {
    // ---
    transport: TransportPtr,
    reply_queue: Address,
    pending: Arc<PendingReply>,
    rx_task: JoinHandle<()>,
}

impl RpcClient {
    /// Open a connection and declare a private reply queue.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Connection` if the broker is unreachable, or a
    /// transport error if the reply queue cannot be set up. The connection
    /// is closed again in the latter case.
    pub async fn connect(connector: &dyn Connector, connection_name: &str) -> Result<Self> {
        // ---
        let transport = connector.connect(connection_name).await?;

        match Self::attach(transport.clone()).await {
            Ok(client) => Ok(client),
            Err(err) => {
                let _ = transport.close().await;
                Err(err)
            }
        }
    }

    async fn attach(transport: TransportPtr) -> Result<Self> {
        // ---
        let reply_queue = transport.declare_reply_queue().await?;
        let mut handle = transport
            .consume(&reply_queue, ConsumeOptions::reply_queue())
            .await?;

        let pending = Arc::new(PendingReply::new());
        let slot = pending.clone();
        let queue = reply_queue.clone();

        let rx_task = tokio::spawn(async move {
            // ---
            while let Some(delivery) = handle.inbox.recv().await {
                let env = delivery.envelope;
                if !slot.complete(env.correlation_id.as_ref(), env.body) {
                    log_debug!(
                        "{queue}: dropped reply with unexpected correlation_id {:?}",
                        env.correlation_id
                    );
                }
            }

            // Reply stream ended; wake the call in flight.
            log_debug!("{queue}: reply stream ended");
            slot.clear();
        });

        log_debug!("{}: reply queue {reply_queue} ready", transport.connection_name());

        Ok(Self {
            transport,
            reply_queue,
            pending,
            rx_task,
        })
    }

    /// Name of this client's private reply queue.
    pub fn reply_queue(&self) -> &Address {
        &self.reply_queue
    }

    /// Publish `payload` to `routing_key` and wait up to `timeout` for the reply.
    ///
    /// # Returns
    ///
    /// The decoded reply body. Error replies (`{"error": ...}`) are returned
    /// as-is; typed wrappers turn them into `RpcError::Remote`.
    ///
    /// # Errors
    ///
    /// - `RpcError::InvalidPayload` / `RpcError::Serialization` for a bad payload.
    /// - `RpcError::Timeout` if no matching reply arrives in time. The request
    ///   may still be processed remotely; its reply is discarded.
    /// - `RpcError::Decode` if the reply body is not JSON.
    /// - `RpcError::Connection` if the connection drops while waiting.
    pub async fn call<T>(&mut self, routing_key: &str, payload: &T, timeout: Duration) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        // ---
        let body = codec::encode_payload(payload)?;
        let correlation_id = CorrelationId::generate();
        let rx = self.pending.register(correlation_id.clone());

        let env = Envelope::request(
            Address::from(routing_key),
            body,
            correlation_id.clone(),
            self.reply_queue.clone(),
        );

        let started = Instant::now();

        if let Err(err) = self.transport.publish(env).await {
            self.pending.clear();
            return Err(err);
        }

        log_debug!("{routing_key}: request {correlation_id} published, waiting up to {timeout:?}");

        let reply = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => body,
            Ok(Err(_)) => {
                log_warn!("{routing_key}: reply stream closed while waiting for {correlation_id}");
                return Err(RpcError::Connection(format!(
                    "reply queue {} closed while waiting for '{routing_key}'",
                    self.reply_queue
                )));
            }
            Err(_) => {
                self.pending.clear();
                let elapsed = started.elapsed();
                log_warn!("{routing_key}: no reply to {correlation_id} after {elapsed:?}");
                return Err(RpcError::Timeout {
                    routing_key: routing_key.to_string(),
                    elapsed,
                });
            }
        };

        codec::decode_reply(&reply)
    }

    /// Publish a one-way command on this client's connection.
    pub async fn send<T>(&self, routing_key: &str, payload: &T) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let body = codec::encode_payload(payload)?;
        self.transport
            .publish(Envelope::command(Address::from(routing_key), body))
            .await
    }

    /// Close the connection; the reply queue is deleted with it.
    pub async fn close(self) -> Result<()> {
        self.transport.close().await
    }
}

impl Drop for RpcClient {
    fn drop(&mut self) {
        self.rx_task.abort();
    }
}

/// Connect, make one call, and close again.
///
/// The connection is released on success, on error and on cancellation.
///
/// # Errors
///
/// Any error of [`RpcClient::connect`] or [`RpcClient::call`]. A failure to
/// close after the call is logged, not returned.
pub async fn call<T>(connector: &dyn Connector, routing_key: &str, payload: &T, timeout: Duration) -> Result<Value>
where
    T: Serialize + ?Sized,
{
    call_as(connector, CLIENT_CONNECTION_NAME, routing_key, payload, timeout).await
}

/// [`call`] on a connection named `connection_name`.
pub(crate) async fn call_as<T>(
    connector: &dyn Connector,
    connection_name: &str,
    routing_key: &str,
    payload: &T,
    timeout: Duration,
) -> Result<Value>
where
    T: Serialize + ?Sized,
{
    // ---
    let mut client = RpcClient::connect(connector, connection_name).await?;
    let result = client.call(routing_key, payload, timeout).await;

    if let Err(err) = client.close().await {
        log_warn!("{routing_key}: closing client connection failed: {err}");
    }

    result
}

/// Connect, publish a one-way command, and close again.
///
/// No reply queue is declared and nothing is awaited beyond the publish.
pub async fn send<T>(connector: &dyn Connector, routing_key: &str, payload: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    send_as(connector, CLIENT_CONNECTION_NAME, routing_key, payload).await
}

/// [`send`] on a connection named `connection_name`.
pub(crate) async fn send_as<T>(connector: &dyn Connector, connection_name: &str, routing_key: &str, payload: &T) -> Result<()>
where
    T: Serialize + ?Sized,
{
    // ---
    let body = codec::encode_payload(payload)?;
    let transport = connector.connect(connection_name).await?;

    let result = transport
        .publish(Envelope::command(Address::from(routing_key), body))
        .await;

    if let Err(err) = transport.close().await {
        log_warn!("{routing_key}: closing command connection failed: {err}");
    }

    result
}
