// src/transport/memory/transport.rs

//! In-memory transport implementation.
//!
//! One `MemoryTransport` stands for one broker connection. Dropping it
//! without calling `close()` still releases its exclusive queues and
//! returns its unacknowledged deliveries, so a cancelled call cannot leak
//! a reply queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use super::MemoryBroker;
use crate::{
    // ---
    log_debug,
    Address,
    Connector,
    ConsumeOptions,
    Envelope,
    Result,
    RpcError,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportPtr,
};

/// Process-global broker used for `memory://` URIs.
static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

/// The broker shared by every `memory://` connector in this process.
pub fn global_memory_broker() -> Arc<MemoryBroker> {
    GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
}

/// A connection to a [`MemoryBroker`].
struct MemoryTransport {
    // ---
    base: TransportBase,
    broker: Arc<MemoryBroker>,
    connection: u64,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(RpcError::Connection(format!(
                "connection '{}' is closed",
                self.connection_name()
            )))
        } else {
            Ok(())
        }
    }

    fn release(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log_debug!("{}: closing memory connection", self.connection_name());
            self.broker.close_connection(self.connection);
        }
    }
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn publish(&self, env: Envelope) -> Result<()> {
        self.ensure_open()?;
        self.broker.publish(env)
    }

    async fn declare_queue(&self, queue: &Address) -> Result<()> {
        self.ensure_open()?;
        self.broker.declare_queue(self.connection, queue.as_str(), false)
    }

    async fn declare_reply_queue(&self) -> Result<Address> {
        self.ensure_open()?;
        let name = self.broker.declare_server_named(self.connection)?;
        Ok(Address(name))
    }

    async fn consume(&self, queue: &Address, opts: ConsumeOptions) -> Result<SubscriptionHandle> {
        self.ensure_open()?;
        self.broker.consume(self.connection, queue.as_str(), opts)
    }

    async fn close(&self) -> Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.release();
    }
}

/// Opens connections to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
}

impl MemoryConnector {
    /// Connector for an explicitly constructed broker.
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self { broker }
    }

    /// Connector for the process-global broker.
    pub fn global() -> Self {
        Self::new(global_memory_broker())
    }

    /// The broker this connector talks to.
    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }
}

#[async_trait::async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, connection_name: &str) -> Result<TransportPtr> {
        // ---
        let connection = self.broker.open_connection()?;
        log_debug!("{connection_name}: opened memory connection #{connection}");

        Ok(Arc::new(MemoryTransport {
            base: TransportBase::new(connection_name),
            broker: self.broker.clone(),
            connection,
            closed: AtomicBool::new(false),
        }))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::time::timeout;

    use crate::CorrelationId;

    fn body(text: &'static str) -> Bytes {
        Bytes::from_static(text.as_bytes())
    }

    #[tokio::test]
    async fn test_declared_queue_delivers_published_message() {
        // ---
        let connector = MemoryConnector::new(MemoryBroker::new());
        let conn = connector.connect("t").await.unwrap();

        let queue = Address::from("work");
        conn.declare_queue(&queue).await.unwrap();
        let mut sub = conn.consume(&queue, ConsumeOptions::reply_queue()).await.unwrap();

        conn.publish(Envelope::command(queue.clone(), body("{}"))).await.unwrap();

        let delivery = timeout(Duration::from_millis(100), sub.inbox.recv())
            .await
            .expect("timed out waiting for message")
            .expect("inbox closed");

        assert_eq!(delivery.envelope.body, body("{}"));
        assert_eq!(delivery.envelope.routing_key, queue);
    }

    #[tokio::test]
    async fn test_unroutable_message_is_dropped() {
        // ---
        let broker = MemoryBroker::new();
        let conn = MemoryConnector::new(broker.clone()).connect("t").await.unwrap();

        conn.publish(Envelope::command(Address::from("nobody"), body("{}")))
            .await
            .unwrap();

        assert!(!broker.queue_exists("nobody"));
    }

    #[tokio::test]
    async fn test_prefetch_one_holds_back_second_message() {
        // ---
        let broker = MemoryBroker::new();
        let conn = MemoryConnector::new(broker.clone()).connect("t").await.unwrap();
        let queue = Address::from("work");
        conn.declare_queue(&queue).await.unwrap();

        for _ in 0..2 {
            conn.publish(Envelope::command(queue.clone(), body("{}"))).await.unwrap();
        }

        let mut sub = conn.consume(&queue, ConsumeOptions::work_queue()).await.unwrap();
        let first = sub.inbox.recv().await.unwrap();

        assert!(sub.inbox.try_recv().is_err());
        assert_eq!(broker.ready_count("work"), 1);
        assert_eq!(broker.unacked_count("work"), 1);

        first.ack().await.unwrap();
        let second = timeout(Duration::from_millis(100), sub.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        second.ack().await.unwrap();
        assert_eq!(broker.unacked_count("work"), 0);
    }

    #[tokio::test]
    async fn test_nack_with_requeue_redelivers() {
        // ---
        let connector = MemoryConnector::new(MemoryBroker::new());
        let conn = connector.connect("t").await.unwrap();
        let queue = Address::from("work");
        conn.declare_queue(&queue).await.unwrap();
        let mut sub = conn.consume(&queue, ConsumeOptions::work_queue()).await.unwrap();

        conn.publish(Envelope::command(queue.clone(), body("once"))).await.unwrap();

        let first = sub.inbox.recv().await.unwrap();
        first.nack(true).await.unwrap();

        let again = timeout(Duration::from_millis(100), sub.inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.envelope.body, body("once"));
    }

    #[tokio::test]
    async fn test_close_requeues_unacked_and_deletes_exclusive_queue() {
        // ---
        let broker = MemoryBroker::new();
        let connector = MemoryConnector::new(broker.clone());

        let worker = connector.connect("worker").await.unwrap();
        let queue = Address::from("work");
        worker.declare_queue(&queue).await.unwrap();
        let reply_queue = worker.declare_reply_queue().await.unwrap();
        let mut sub = worker.consume(&queue, ConsumeOptions::work_queue()).await.unwrap();

        worker
            .publish(Envelope::request(
                queue.clone(),
                body("{}"),
                CorrelationId::generate(),
                reply_queue.clone(),
            ))
            .await
            .unwrap();
        let _held = sub.inbox.recv().await.unwrap();
        assert_eq!(broker.unacked_count("work"), 1);

        worker.close().await.unwrap();

        assert_eq!(broker.ready_count("work"), 1);
        assert!(!broker.queue_exists(reply_queue.as_str()));
        assert!(worker.publish(Envelope::command(queue, body("{}"))).await.is_err());
    }

    #[tokio::test]
    async fn test_reply_queue_is_private() {
        // ---
        let connector = MemoryConnector::new(MemoryBroker::new());
        let owner = connector.connect("owner").await.unwrap();
        let other = connector.connect("other").await.unwrap();

        let reply_queue = owner.declare_reply_queue().await.unwrap();
        assert!(reply_queue.as_str().starts_with("amq.gen-"));

        let err = other
            .consume(&reply_queue, ConsumeOptions::reply_queue())
            .await
            .err()
            .expect("foreign consumer must be refused");
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_unavailable_broker_refuses_connections() {
        // ---
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let err = MemoryConnector::new(broker.clone())
            .connect("t")
            .await
            .err()
            .expect("connect must fail");
        assert!(matches!(err, RpcError::Connection(_)));

        broker.set_available(true);
        assert!(MemoryConnector::new(broker).connect("t").await.is_ok());
    }
}
