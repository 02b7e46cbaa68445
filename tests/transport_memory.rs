// tests/transport_memory.rs

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};

use broker_rpc::{
    // ---
    call,
    decode_reply,
    processor_fn,
    Address,
    Connector,
    ConnectorPtr,
    ConsumeOptions,
    CorrelationId,
    Envelope,
    MemoryBroker,
    MemoryConnector,
    ProcessorRegistry,
    Reply,
    RetryConfig,
    RpcClient,
    RpcConsumer,
    Supervisor,
};

fn fast_policy(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        multiplier: 2.0,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(80),
    }
}

#[tokio::test]
async fn reply_publish_failure_requeues_request() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    let connector: ConnectorPtr = Arc::new(MemoryConnector::new(broker.clone()));
    let calls = Arc::new(AtomicUsize::new(0));

    // First run takes the broker offline so the reply cannot be published;
    // the redelivered run brings it back.
    let processor = {
        let broker = broker.clone();
        let calls = calls.clone();
        processor_fn(move |payload| {
            let broker = broker.clone();
            let calls = calls.clone();
            async move {
                let run = calls.fetch_add(1, Ordering::SeqCst) + 1;
                broker.set_available(run > 1);
                Reply::Json(json!({"run": run, "echo": payload}))
            }
        })
    };

    let consumer = RpcConsumer::new(connector.clone(), "flaky", processor)
        .start()
        .await
        .expect("consumer failed to start");

    // ---
    // Act
    // ---
    let reply = call(connector.as_ref(), "flaky", &json!({"x": 1}), Duration::from_secs(1))
        .await
        .expect("call failed");

    // ---
    // Assert
    // ---
    assert_eq!(reply, json!({"run": 2, "echo": {"x": 1}}));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(broker.unacked_count("flaky"), 0);

    consumer.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn undecodable_body_gets_error_reply() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    let connector: ConnectorPtr = Arc::new(MemoryConnector::new(broker.clone()));

    let consumer = RpcConsumer::new(
        connector.clone(),
        "echo",
        processor_fn(|payload| async move { Reply::Json(payload) }),
    )
    .start()
    .await
    .expect("consumer failed to start");

    let caller = connector.connect("raw-caller").await.expect("connect failed");
    let reply_queue = caller.declare_reply_queue().await.expect("declare failed");
    let mut replies = caller
        .consume(&reply_queue, ConsumeOptions::reply_queue())
        .await
        .expect("consume failed");

    let correlation_id = CorrelationId::generate();

    // ---
    // Act
    // ---
    caller
        .publish(Envelope::request(
            Address::from("echo"),
            Bytes::from_static(b"<not json>"),
            correlation_id.clone(),
            reply_queue.clone(),
        ))
        .await
        .expect("publish failed");

    // ---
    // Assert
    // ---
    let delivery = timeout(Duration::from_millis(500), replies.inbox.recv())
        .await
        .expect("timed out waiting for reply")
        .expect("reply channel closed");

    assert_eq!(delivery.envelope.correlation_id, Some(correlation_id));
    let body = decode_reply(&delivery.envelope.body).expect("reply is not JSON");
    assert!(body["error"].as_str().unwrap_or_default().starts_with("invalid JSON payload"));

    assert_eq!(broker.unacked_count("echo"), 0);
    assert!(consumer.is_running());

    caller.close().await.expect("close failed");
    consumer.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn stale_reply_with_foreign_correlation_id_is_dropped() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    let connector = MemoryConnector::new(broker.clone());

    // A hand-rolled worker that answers every request twice: first with a
    // recycled correlation id, then with the right one.
    let worker = connector.connect("worker").await.expect("connect failed");
    let queue = Address::from("stale");
    worker.declare_queue(&queue).await.expect("declare failed");
    let mut requests = worker
        .consume(&queue, ConsumeOptions::work_queue())
        .await
        .expect("consume failed");

    let responder = {
        let worker = worker.clone();
        tokio::spawn(async move {
            let Some(delivery) = requests.inbox.recv().await else {
                return;
            };
            let env = delivery.envelope.clone();
            let reply_to = env.reply_to.clone().expect("request without reply_to");

            let stale = Envelope::reply(
                reply_to.clone(),
                Bytes::from_static(br#"{"stale":true}"#),
                Some(CorrelationId::generate()),
            );
            let fresh = Envelope::reply(reply_to, Bytes::from_static(br#"{"stale":false}"#), env.correlation_id);

            worker.publish(stale).await.expect("publish failed");
            worker.publish(fresh).await.expect("publish failed");
            delivery.ack().await.expect("ack failed");
        })
    };

    // ---
    // Act
    // ---
    let mut client = RpcClient::connect(&connector, "client").await.expect("connect failed");
    let reply: Value = client
        .call("stale", &json!({}), Duration::from_secs(1))
        .await
        .expect("call failed");

    // ---
    // Assert
    // ---
    assert_eq!(reply, json!({"stale": false}));

    responder.await.expect("responder panicked");
    client.close().await.expect("close failed");
    worker.close().await.expect("close failed");
}

#[tokio::test]
async fn supervisor_retries_until_broker_is_back() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    broker.set_available(false);

    let connector: ConnectorPtr = Arc::new(MemoryConnector::new(broker.clone()));
    let supervisor = Supervisor::new(connector.clone(), fast_policy(3));

    let mut registry = ProcessorRegistry::new();
    registry.register_ptr("echo", processor_fn(|payload| async move { Reply::Json(payload) }));

    let revive = {
        let broker = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            broker.set_available(true);
        })
    };

    // ---
    // Act
    // ---
    let consumers = supervisor.start_all(&registry).await;
    revive.await.expect("revive task panicked");

    // ---
    // Assert
    // ---
    assert!(consumers.failed().is_empty());
    assert!(consumers.is_running("echo"));

    let reply = call(connector.as_ref(), "echo", &json!({"back": true}), Duration::from_secs(1))
        .await
        .expect("call failed");
    assert_eq!(reply, json!({"back": true}));

    consumers.shutdown().await.expect("shutdown failed");
}

#[tokio::test]
async fn consumer_connection_loss_requeues_unacked_request() {
    // ---
    // Arrange
    // ---
    let broker = MemoryBroker::new();
    let connector = MemoryConnector::new(broker.clone());

    let worker = connector.connect("doomed").await.expect("connect failed");
    let queue = Address::from("work");
    worker.declare_queue(&queue).await.expect("declare failed");
    let mut sub = worker
        .consume(&queue, ConsumeOptions::work_queue())
        .await
        .expect("consume failed");

    worker
        .publish(Envelope::command(queue.clone(), Bytes::from_static(b"{}")))
        .await
        .expect("publish failed");
    let _held = sub.inbox.recv().await.expect("no delivery");

    // ---
    // Act
    // ---
    drop(sub);
    worker.close().await.expect("close failed");

    // ---
    // Assert
    // ---
    assert_eq!(broker.ready_count("work"), 1);

    let survivor = connector.connect("survivor").await.expect("connect failed");
    let mut sub = survivor
        .consume(&queue, ConsumeOptions::work_queue())
        .await
        .expect("consume failed");
    let redelivered = timeout(Duration::from_millis(100), sub.inbox.recv())
        .await
        .expect("timed out waiting for redelivery")
        .expect("inbox closed");

    assert_eq!(redelivered.envelope.body, Bytes::from_static(b"{}"));
    redelivered.ack().await.expect("ack failed");
    survivor.close().await.expect("close failed");
}
