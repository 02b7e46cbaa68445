//! Consumer bootstrap with a bounded restart budget.
//!
//! At service start every registered operation gets its own consumer task.
//! A start that fails because the broker is unreachable is retried with
//! backoff; once the budget is spent the operation stays unavailable until
//! the process restarts, while the other consumers keep running.

use futures::future::join_all;

use crate::{
    // ---
    log_error,
    log_info,
    retry_with_backoff,
    ConnectorPtr,
    ConsumerHandle,
    ProcessorPtr,
    ProcessorRegistry,
    Result,
    RetryConfig,
    RpcConfig,
    RpcConsumer,
    RpcError,
};

/// Starts consumers and applies the restart policy.
#[derive(Clone)]
pub struct Supervisor {
    // ---
    connector: ConnectorPtr,
    policy: RetryConfig,
    service_name: Option<String>,
}

impl Supervisor {
    /// Supervisor using an explicit restart policy.
    pub fn new(connector: ConnectorPtr, policy: RetryConfig) -> Self {
        Self {
            connector,
            policy,
            service_name: None,
        }
    }

    /// Supervisor using `config.consumer_restart`.
    ///
    /// Consumers connect as `<config.connection_name>:<operation>`.
    pub fn from_config(connector: ConnectorPtr, config: &RpcConfig) -> Self {
        Self {
            service_name: Some(config.connection_name.clone()),
            ..Self::new(connector, config.consumer_restart.clone())
        }
    }

    /// Start a consumer for `operation`, retrying connection failures.
    ///
    /// # Errors
    ///
    /// The last start error once the budget is spent, or the first
    /// non-retryable one.
    pub async fn start_one(&self, operation: &str, processor: ProcessorPtr) -> Result<ConsumerHandle> {
        // ---
        retry_with_backoff(&self.policy, operation, || {
            let consumer = RpcConsumer::new(self.connector.clone(), operation, processor.clone());
            let consumer = match &self.service_name {
                Some(service) => consumer.with_connection_name(format!("{service}:{operation}")),
                None => consumer,
            };
            consumer.start()
        })
        .await
    }

    /// Start one consumer per registry entry, concurrently.
    ///
    /// Never fails as a whole: operations that could not be started are
    /// logged and listed in [`SupervisedConsumers::failed`].
    pub async fn start_all(&self, registry: &ProcessorRegistry) -> SupervisedConsumers {
        // ---
        let starts = registry.iter().map(|(operation, processor)| {
            let processor = processor.clone();
            async move { (operation.to_string(), self.start_one(operation, processor).await) }
        });

        let mut running = Vec::new();
        let mut failed = Vec::new();

        for (operation, result) in join_all(starts).await {
            match result {
                Ok(handle) => running.push(handle),
                Err(err) => {
                    log_error!("{operation}: consumer could not be started, operation unavailable: {err}");
                    failed.push((operation, err));
                }
            }
        }

        log_info!(
            "supervisor: {} consumer(s) running, {} failed",
            running.len(),
            failed.len()
        );

        SupervisedConsumers { running, failed }
    }
}

/// Result of [`Supervisor::start_all`].
pub struct SupervisedConsumers {
    // ---
    running: Vec<ConsumerHandle>,
    failed: Vec<(String, RpcError)>,
}

impl SupervisedConsumers {
    /// Handles of the consumers that started.
    pub fn running(&self) -> &[ConsumerHandle] {
        &self.running
    }

    /// Operations that could not be started, with the final error.
    pub fn failed(&self) -> &[(String, RpcError)] {
        &self.failed
    }

    /// Whether a consumer for `operation` is running.
    pub fn is_running(&self, operation: &str) -> bool {
        self.running
            .iter()
            .any(|handle| handle.queue().as_str() == operation && handle.is_running())
    }

    /// Shut every running consumer down gracefully.
    ///
    /// # Errors
    ///
    /// The first shutdown error; the remaining consumers are still stopped.
    pub async fn shutdown(self) -> Result<()> {
        // ---
        let results = join_all(self.running.into_iter().map(ConsumerHandle::shutdown)).await;
        results.into_iter().collect()
    }
}
