use std::sync::Arc;
use std::time::Duration;

use broker_rpc::{
    // ---
    call,
    reject_error_reply,
    ConnectorPtr,
    MemoryBroker,
    MemoryConnector,
    ProcessError,
    ProcessorRegistry,
    Result,
    RpcConfig,
    Supervisor,
    TypedProcessor,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Serialize, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct AddResponse {
    sum: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    env_logger::init();

    let config = RpcConfig::memory("math-demo");
    let connector: ConnectorPtr = Arc::new(MemoryConnector::new(MemoryBroker::new()));

    let mut registry = ProcessorRegistry::new();
    registry.register(
        "math.add",
        TypedProcessor::new(|req: AddRequest| async move {
            // ---
            req.a
                .checked_add(req.b)
                .map(|sum| AddResponse { sum })
                .ok_or_else(|| ProcessError::business("sum overflows"))
        }),
    );

    let consumers = Supervisor::from_config(connector.clone(), &config)
        .start_all(&registry)
        .await;

    let timeout = Duration::from_secs(2);

    let reply = call(connector.as_ref(), "math.add", &json!({"a": 20, "b": 3}), timeout).await?;
    let resp: AddResponse = serde_json::from_value(reply)?;
    println!("20 + 3 = {}", resp.sum);

    let reply = call(connector.as_ref(), "math.add", &json!({"a": 20}), timeout).await?;
    match reject_error_reply(reply) {
        Ok(value) => println!("unexpected success: {value}"),
        Err(err) => println!("rejected as expected: {err}"),
    }

    consumers.shutdown().await?;
    Ok(())
}
