//! Typed client for the users service.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::{call_as, send_as};
use crate::{codec, ConnectorPtr, Result, RpcConfig};

/// Seller as returned by `users.get_sellers`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SellerRecord {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
    pub username: String,
    pub phone: String,
    pub id_type: Option<String>,
    pub identification: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Payload of the seller creation command.
#[derive(Clone, Serialize, Deserialize)]
pub struct NewSeller {
    pub username: String,
    pub full_name: String,
    pub email: String,
    pub phone_number: Option<String>,
    pub password: String,
}

impl fmt::Debug for NewSeller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewSeller")
            .field("username", &self.username)
            .field("full_name", &self.full_name)
            .field("email", &self.email)
            .field("phone_number", &self.phone_number)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Seller lookups and commands against the users service.
#[derive(Clone)]
pub struct UsersClient {
    // ---
    connector: ConnectorPtr,
    connection_name: String,
    get_sellers_key: String,
    create_seller_topic: String,
    timeout: Duration,
}

impl UsersClient {
    /// Client using the queue names and timeout from `config`.
    pub fn new(connector: ConnectorPtr, config: &RpcConfig) -> Self {
        Self {
            connector,
            connection_name: config.connection_name.clone(),
            get_sellers_key: config.queues.get_sellers.clone(),
            create_seller_topic: config.queues.create_seller.clone(),
            timeout: config.request_timeout,
        }
    }

    /// Override the per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Fetch sellers by id; `None` asks for every seller.
    ///
    /// # Errors
    ///
    /// - `RpcError::Remote` if the service answered with an error object.
    /// - `RpcError::Decode` if any record does not match [`SellerRecord`].
    /// - Any error of [`call`](crate::call).
    pub async fn get_sellers(&self, seller_ids: Option<&[Uuid]>) -> Result<Vec<SellerRecord>> {
        // ---
        let payload = json!({ "seller_ids": seller_ids });
        let reply = call_as(
            self.connector.as_ref(),
            &self.connection_name,
            &self.get_sellers_key,
            &payload,
            self.timeout,
        )
        .await?;
        codec::take_records(reply, "sellers")
    }

    /// Ask the users service to create a seller.
    ///
    /// Fire-and-forget: success means the command reached the broker, not
    /// that the seller exists.
    pub async fn create_seller(&self, seller: &NewSeller) -> Result<()> {
        send_as(self.connector.as_ref(), &self.connection_name, &self.create_seller_topic, seller).await
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Connector, MemoryBroker, MemoryConnector, RpcError, TransportPtr};
    use std::sync::{Arc, Mutex};

    /// Memory connector that remembers the connection names it was asked for.
    struct NamingConnector {
        inner: MemoryConnector,
        names: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl Connector for NamingConnector {
        async fn connect(&self, connection_name: &str) -> Result<TransportPtr> {
            self.names.lock().unwrap().push(connection_name.to_string());
            self.inner.connect(connection_name).await
        }
    }

    #[tokio::test]
    async fn test_connections_use_configured_name() {
        // ---
        let connector = Arc::new(NamingConnector {
            inner: MemoryConnector::new(MemoryBroker::new()),
            names: Mutex::new(Vec::new()),
        });
        let config = RpcConfig::memory("sales");
        let users = UsersClient::new(connector.clone(), &config).with_timeout(Duration::from_millis(20));

        let err = users.get_sellers(None).await.unwrap_err();
        assert!(matches!(err, RpcError::Timeout { .. }));

        users
            .create_seller(&NewSeller {
                username: "ana".into(),
                full_name: "Ana Diaz".into(),
                email: "ana@example.com".into(),
                phone_number: None,
                password: "pw".into(),
            })
            .await
            .unwrap();

        assert_eq!(*connector.names.lock().unwrap(), vec!["sales", "sales"]);
    }

    #[test]
    fn test_seller_record_accepts_missing_optionals() {
        // ---
        let record: SellerRecord = serde_json::from_value(json!({
            "id": "22222222-2222-2222-2222-222222222222",
            "full_name": "Ana Diaz",
            "email": "ana@example.com",
            "username": "ana",
            "phone": "555-0100",
            "created_at": "2024-03-01T10:00:00Z"
        }))
        .unwrap();

        assert_eq!(record.id_type, None);
        assert_eq!(record.updated_at, None);
    }

    #[test]
    fn test_new_seller_debug_hides_password() {
        // ---
        let seller = NewSeller {
            username: "ana".into(),
            full_name: "Ana Diaz".into(),
            email: "ana@example.com".into(),
            phone_number: None,
            password: "s3cret!pass".into(),
        };

        let printed = format!("{seller:?}");
        assert!(!printed.contains("s3cret"));
        assert!(printed.contains("<redacted>"));
    }
}
