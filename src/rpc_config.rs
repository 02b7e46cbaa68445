//! Process-level configuration.
//!
//! Loaded once at service start, from the environment or built in code.
//! Everything broker-specific is expressed through the broker URI; the
//! scheme selects the transport (see [`create_connector`](crate::create_connector)).

use std::time::Duration;

use crate::{Result, RetryConfig, RpcError};

/// Default broker URI when neither `BROKER_URI` nor `BROKER_HOST` is set.
pub const DEFAULT_BROKER_URI: &str = "amqp://localhost:5672/%2f";

/// Default bound on a single synchronous call.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Queue and topic names for the operations bridged over the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueNames {
    /// Bulk product lookup served by the suppliers service.
    pub get_products: String,

    /// Bulk seller lookup served by the users service.
    pub get_sellers: String,

    /// Seller creation command consumed by the users service.
    pub create_seller: String,

    /// Delivery creation command consumed by the inventory service.
    pub create_delivery: String,
}

impl Default for QueueNames {
    fn default() -> Self {
        Self {
            get_products: "suppliers.get_products".into(),
            get_sellers: "users.get_sellers".into(),
            create_seller: "rpc_create_seller".into(),
            create_delivery: "rpc_create_delivery".into(),
        }
    }
}

/// Broker connection and call settings.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Broker URI, e.g. `amqp://localhost:5672/%2f` or `memory://`.
    pub broker_uri: String,

    /// Name of this service on the broker.
    ///
    /// Typed clients connect under this name; supervised consumers under
    /// `<connection_name>:<operation>`.
    pub connection_name: String,

    /// Default bound on the synchronous wait of one call.
    pub request_timeout: Duration,

    /// Operation queue names.
    pub queues: QueueNames,

    /// Restart policy for consumers whose start fails.
    pub consumer_restart: RetryConfig,
}

impl RpcConfig {
    /// Create a config for the given broker with default settings.
    pub fn with_broker(broker_uri: impl Into<String>, connection_name: impl Into<String>) -> Self {
        Self {
            broker_uri: broker_uri.into(),
            connection_name: connection_name.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            queues: QueueNames::default(),
            consumer_restart: RetryConfig::default(),
        }
    }

    /// Create a config backed by the process-global in-memory broker.
    pub fn memory(connection_name: impl Into<String>) -> Self {
        Self::with_broker("memory://", connection_name)
    }

    /// Load settings from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `BROKER_URI` | built from `BROKER_HOST`, else `amqp://localhost:5672/%2f` |
    /// | `BROKER_HOST` | `localhost` |
    /// | `RPC_TIMEOUT_SECS` | `30` |
    /// | `GET_PRODUCTS_QUEUE` | `suppliers.get_products` |
    /// | `GET_SELLERS_QUEUE` | `users.get_sellers` |
    /// | `CREATE_SELLER_TOPIC` | `rpc_create_seller` |
    /// | `CREATE_DELIVERY_TOPIC` | `rpc_create_delivery` |
    /// | `CONSUMER_RESTART_ATTEMPTS` | `3` |
    ///
    /// # Errors
    ///
    /// Returns `RpcError::InvalidConfig` if a numeric variable does not parse.
    pub fn from_env(connection_name: impl Into<String>) -> Result<Self> {
        Self::from_lookup(connection_name, |key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary variable source.
    pub fn from_lookup<F>(connection_name: impl Into<String>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker_uri = match lookup("BROKER_URI") {
            Some(uri) => uri,
            None => match lookup("BROKER_HOST") {
                Some(host) => format!("amqp://{host}:5672/%2f"),
                None => DEFAULT_BROKER_URI.to_string(),
            },
        };

        let mut config = Self::with_broker(broker_uri, connection_name);

        if let Some(secs) = lookup("RPC_TIMEOUT_SECS") {
            let secs: u64 = parse_var("RPC_TIMEOUT_SECS", &secs)?;
            config.request_timeout = Duration::from_secs(secs);
        }

        if let Some(attempts) = lookup("CONSUMER_RESTART_ATTEMPTS") {
            config.consumer_restart.max_attempts = parse_var("CONSUMER_RESTART_ATTEMPTS", &attempts)?;
        }

        let queues = &mut config.queues;
        for (var, slot) in [
            ("GET_PRODUCTS_QUEUE", &mut queues.get_products),
            ("GET_SELLERS_QUEUE", &mut queues.get_sellers),
            ("CREATE_SELLER_TOPIC", &mut queues.create_seller),
            ("CREATE_DELIVERY_TOPIC", &mut queues.create_delivery),
        ] {
            if let Some(name) = lookup(var) {
                *slot = name;
            }
        }

        Ok(config)
    }

    /// Set the default request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Replace the operation queue names.
    pub fn with_queues(mut self, queues: QueueNames) -> Self {
        self.queues = queues;
        self
    }

    /// Replace the consumer restart policy.
    pub fn with_consumer_restart(mut self, policy: RetryConfig) -> Self {
        self.consumer_restart = policy;
        self
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| RpcError::InvalidConfig(format!("{name}={raw:?} is not a valid number")))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_environment_is_empty() {
        // ---
        let config = RpcConfig::from_lookup("sales", lookup_from(&[])).unwrap();

        assert_eq!(config.broker_uri, DEFAULT_BROKER_URI);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.queues, QueueNames::default());
        assert_eq!(config.consumer_restart.max_attempts, 3);
    }

    #[test]
    fn test_broker_host_builds_amqp_uri() {
        // ---
        let config = RpcConfig::from_lookup("sales", lookup_from(&[("BROKER_HOST", "rabbitmq")])).unwrap();
        assert_eq!(config.broker_uri, "amqp://rabbitmq:5672/%2f");

        let config = RpcConfig::from_lookup(
            "sales",
            lookup_from(&[("BROKER_HOST", "rabbitmq"), ("BROKER_URI", "memory://")]),
        )
        .unwrap();
        assert_eq!(config.broker_uri, "memory://");
    }

    #[test]
    fn test_overrides_are_applied() {
        // ---
        let config = RpcConfig::from_lookup(
            "users",
            lookup_from(&[
                ("RPC_TIMEOUT_SECS", "5"),
                ("CREATE_SELLER_TOPIC", "users.create_seller"),
                ("CONSUMER_RESTART_ATTEMPTS", "1"),
            ]),
        )
        .unwrap();

        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.queues.create_seller, "users.create_seller");
        assert_eq!(config.queues.get_products, "suppliers.get_products");
        assert_eq!(config.consumer_restart.max_attempts, 1);
    }

    #[test]
    fn test_bad_number_is_rejected() {
        // ---
        let err = RpcConfig::from_lookup("x", lookup_from(&[("RPC_TIMEOUT_SECS", "soon")])).unwrap_err();
        assert!(matches!(err, RpcError::InvalidConfig(_)));
    }
}
