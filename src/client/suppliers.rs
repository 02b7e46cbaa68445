//! Typed client for the suppliers service.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::call_as;
use crate::{codec, ConnectorPtr, Result, RpcConfig, RpcError};

/// Product as returned by `suppliers.get_products`.
///
/// Extra fields in the reply (such as the nested manufacturer) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: Uuid,
    pub images: Vec<String>,
    pub product_code: String,
    pub name: String,

    /// Unit price. Accepts a JSON number or a decimal string.
    #[serde(deserialize_with = "price_from_number_or_string")]
    pub price: f64,
}

fn price_from_number_or_string<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Price {
        Number(f64),
        Text(String),
    }

    match Price::deserialize(deserializer)? {
        Price::Number(value) => Ok(value),
        Price::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid price '{text}'"))),
    }
}

/// Bulk product lookups against the suppliers service.
#[derive(Clone)]
pub struct SuppliersClient {
    // ---
    connector: ConnectorPtr,
    connection_name: String,
    routing_key: String,
    timeout: Duration,
}

impl SuppliersClient {
    /// Client using the queue name and timeout from `config`.
    pub fn new(connector: ConnectorPtr, config: &RpcConfig) -> Self {
        Self {
            connector,
            connection_name: config.connection_name.clone(),
            routing_key: config.queues.get_products.clone(),
            timeout: config.request_timeout,
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch products by id.
    ///
    /// `None` asks for every product; `Some(&[])` asks for none. Records come
    /// back in the order of `product_ids`.
    ///
    /// # Errors
    ///
    /// - `RpcError::Remote` if the service answered with an error object.
    /// - `RpcError::Decode` if any record does not match [`ProductRecord`].
    /// - Any error of [`call`](crate::call).
    pub async fn get_products(&self, product_ids: Option<&[Uuid]>) -> Result<Vec<ProductRecord>> {
        // ---
        let payload = json!({ "product_ids": product_ids });
        let reply = call_as(
            self.connector.as_ref(),
            &self.connection_name,
            &self.routing_key,
            &payload,
            self.timeout,
        )
        .await?;
        codec::take_records(reply, "products")
    }

    /// Fetch a single product.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::NotFound` if the service knows no such product.
    pub async fn get_product(&self, product_id: Uuid) -> Result<ProductRecord> {
        // ---
        self.get_products(Some(&[product_id]))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::NotFound(format!("product {product_id}")))
    }
}
