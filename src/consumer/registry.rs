use std::collections::BTreeMap;
use std::sync::Arc;

use super::processor::{Processor, ProcessorPtr};

/// Operation name to processor.
///
/// The operation name doubles as the queue the processor is served on. New
/// operations are added by registering an entry; the supervisor starts one
/// consumer per entry, in name order.
#[derive(Clone, Default)]
pub struct ProcessorRegistry {
    // ---
    entries: BTreeMap<String, ProcessorPtr>,
}

impl ProcessorRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` for `operation`, replacing any previous entry.
    pub fn register<P>(&mut self, operation: impl Into<String>, processor: P) -> &mut Self
    where
        P: Processor + 'static,
    {
        self.register_ptr(operation, Arc::new(processor))
    }

    /// Register an already shared processor.
    pub fn register_ptr(&mut self, operation: impl Into<String>, processor: ProcessorPtr) -> &mut Self {
        let operation = operation.into();
        if self.entries.insert(operation.clone(), processor).is_some() {
            crate::log_warn!("processor for '{operation}' replaced");
        }
        self
    }

    /// Processor registered for `operation`.
    pub fn get(&self, operation: &str) -> Option<ProcessorPtr> {
        self.entries.get(operation).cloned()
    }

    /// Registered operation names, in order.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// All entries, in operation order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ProcessorPtr)> {
        self.entries.iter().map(|(name, processor)| (name.as_str(), processor))
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no operation is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{processor_fn, Reply};
    use serde_json::json;

    #[tokio::test]
    async fn test_register_and_lookup() {
        // ---
        let mut registry = ProcessorRegistry::new();
        registry
            .register_ptr("users.get_sellers", processor_fn(|_| async { Reply::Json(json!({"sellers": []})) }))
            .register_ptr("suppliers.get_products", processor_fn(|_| async { Reply::Json(json!({"products": []})) }));

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.operations().collect::<Vec<_>>(),
            vec!["suppliers.get_products", "users.get_sellers"]
        );

        let processor = registry.get("users.get_sellers").unwrap();
        assert_eq!(processor.process(json!({})).await, Reply::Json(json!({"sellers": []})));
        assert!(registry.get("inventory.get_stock").is_none());
    }

    #[test]
    fn test_later_registration_wins() {
        // ---
        let mut registry = ProcessorRegistry::new();
        registry.register_ptr("echo", processor_fn(|p| async move { Reply::Json(p) }));
        registry.register_ptr("echo", processor_fn(|_| async { Reply::Text("{}".into()) }));

        assert_eq!(registry.len(), 1);
    }
}
