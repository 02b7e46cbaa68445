//! Synchronous request/reply RPC over an AMQP-style message broker.
//!
//! Services call each other through broker queues as if they were local
//! functions: the caller blocks (asynchronously) until the reply bearing its
//! correlation id arrives or the timeout expires, while a consumer on the
//! other side pulls one request at a time, hands it to a processor and
//! publishes the result back to the caller's private reply queue.
//!
//! ```no_run
//! use std::time::Duration;
//! use broker_rpc::{create_connector, RpcConfig};
//! use serde_json::json;
//!
//! # async fn example() -> broker_rpc::Result<()> {
//! let config = RpcConfig::from_env("sales")?;
//! let connector = create_connector(&config)?;
//!
//! let reply = broker_rpc::call(
//!     connector.as_ref(),
//!     "suppliers.get_products",
//!     &json!({ "product_ids": null }),
//!     Duration::from_secs(5),
//! )
//! .await?;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

use std::sync::{Mutex, MutexGuard};

// Import all sub modules once...
mod macros;

mod client;
mod codec;
mod consumer;
mod correlation;
mod domain;
mod error;
mod retry;
mod rpc_config;
mod supervisor;
mod transport;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// --- public re-exports
pub use client::{
    // ---
    call,
    send,
    NewSeller,
    ProductRecord,
    RpcClient,
    SellerRecord,
    SuppliersClient,
    UsersClient,
};

pub use consumer::{
    // ---
    processor_fn,
    BulkLookup,
    ConsumerHandle,
    ConsumerState,
    FieldError,
    ProcessError,
    Processor,
    ProcessorPtr,
    ProcessorRegistry,
    Reply,
    RpcConsumer,
    TypedProcessor,
};

pub use codec::{decode_reply, encode_payload, reject_error_reply, take_records, ERROR_KEY};
pub use correlation::CorrelationId;
pub use error::{Result, RpcError};
pub use retry::RetryConfig;
pub use rpc_config::{QueueNames, RpcConfig, DEFAULT_BROKER_URI, DEFAULT_REQUEST_TIMEOUT};
pub use supervisor::{SupervisedConsumers, Supervisor};

pub(crate) use retry::retry_with_backoff;

pub use transport::{global_memory_broker, MemoryBroker, MemoryConnector};

#[cfg(feature = "transport_lapin")]
pub use transport::AmqpConnector;

pub use domain::{
    // ---
    Acknowledger,
    Address,
    Connector,
    ConnectorPtr,
    ConsumeOptions,
    Delivery,
    Envelope,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportPtr,
    CONTENT_TYPE_JSON,
};

/// Acquire mutex guard, ignoring poisoning.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Build the connector selected by the broker URI scheme.
///
/// | Scheme | Connector |
/// |---|---|
/// | `memory://` | process-global [`MemoryBroker`] |
/// | `amqp://`, `amqps://` | [`AmqpConnector`] (feature `transport_lapin`) |
///
/// # Errors
///
/// Returns `RpcError::InvalidConfig` for an unknown scheme, or for an AMQP
/// URI when the crate was built without `transport_lapin`.
pub fn create_connector(config: &RpcConfig) -> Result<ConnectorPtr> {
    // ---
    let uri = config.broker_uri.trim();
    let (scheme, _) = uri
        .split_once("://")
        .ok_or_else(|| RpcError::InvalidConfig(format!("broker URI '{uri}' has no scheme")))?;

    match scheme {
        "memory" => Ok(std::sync::Arc::new(MemoryConnector::global())),

        #[cfg(feature = "transport_lapin")]
        "amqp" | "amqps" => Ok(std::sync::Arc::new(AmqpConnector::new(uri))),

        #[cfg(not(feature = "transport_lapin"))]
        "amqp" | "amqps" => Err(RpcError::InvalidConfig(
            "AMQP broker URIs require the `transport_lapin` feature".into(),
        )),

        other => Err(RpcError::InvalidConfig(format!(
            "unsupported broker scheme '{other}'"
        ))),
    }
}
