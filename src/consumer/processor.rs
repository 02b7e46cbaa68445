//! Processor capability invoked by the dispatch loop.
//!
//! A processor turns one decoded request payload into one reply. It never
//! fails in the `Result` sense: validation and business failures are encoded
//! into the reply body as `{"error": ...}` so the caller sees them and the
//! consumer keeps serving.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::ERROR_KEY;

/// What a processor answers with.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// A JSON value, serialized by the dispatch loop.
    Json(Value),

    /// A body that is already serialized JSON; sent verbatim.
    Text(String),
}

impl Reply {
    /// Message body for this reply.
    pub fn into_body(self) -> Bytes {
        match self {
            Reply::Json(value) => Bytes::from(value.to_string()),
            Reply::Text(text) => Bytes::from(text),
        }
    }
}

impl From<Value> for Reply {
    fn from(value: Value) -> Self {
        Reply::Json(value)
    }
}

/// One schema violation in a request payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Path to the offending value, outermost first (`["product_ids", "0"]`).
    pub loc: Vec<String>,

    /// Human-readable description.
    pub msg: String,

    /// Short error class, e.g. `missing` or `invalid`.
    #[serde(rename = "type")]
    pub kind: String,
}

impl FieldError {
    /// A required field is absent.
    pub fn missing(field: &str) -> Self {
        Self {
            loc: vec![field.to_string()],
            msg: "Field required".into(),
            kind: "missing".into(),
        }
    }

    /// A value is present but not acceptable.
    pub fn invalid(loc: Vec<String>, msg: impl Into<String>) -> Self {
        Self {
            loc,
            msg: msg.into(),
            kind: "invalid".into(),
        }
    }
}

/// Failure reported back to the caller inside the reply body.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProcessError {
    /// The payload does not match the expected schema.
    #[error("payload validation failed ({} error(s))", .0.len())]
    Validation(Vec<FieldError>),

    /// The request was well-formed but could not be served.
    #[error("{0}")]
    Business(String),
}

impl ProcessError {
    /// Shorthand for a business error.
    pub fn business(msg: impl Into<String>) -> Self {
        ProcessError::Business(msg.into())
    }

    /// The `{"error": ...}` object sent to the caller.
    pub fn to_value(&self) -> Value {
        match self {
            ProcessError::Validation(errors) => json!({ ERROR_KEY: errors }),
            ProcessError::Business(msg) => json!({ ERROR_KEY: msg }),
        }
    }

    fn from_path_error(err: serde_path_to_error::Error<serde_json::Error>) -> Self {
        // ---
        let mut loc: Vec<String> = err
            .path()
            .iter()
            .map(|segment| match segment {
                serde_path_to_error::Segment::Seq { index } => index.to_string(),
                serde_path_to_error::Segment::Map { key } => key.clone(),
                serde_path_to_error::Segment::Enum { variant } => variant.clone(),
                _ => "?".to_string(),
            })
            .collect();

        let msg = err.inner().to_string();

        // serde reports a missing field at the enclosing object.
        if let Some(field) = missing_field_name(&msg) {
            loc.push(field.to_string());
            return ProcessError::Validation(vec![FieldError {
                loc,
                msg: "Field required".into(),
                kind: "missing".into(),
            }]);
        }

        ProcessError::Validation(vec![FieldError::invalid(loc, msg)])
    }
}

impl From<ProcessError> for Reply {
    fn from(err: ProcessError) -> Self {
        Reply::Json(err.to_value())
    }
}

fn missing_field_name(msg: &str) -> Option<&str> {
    let rest = msg.strip_prefix("missing field `")?;
    rest.split('`').next()
}

/// Decode a payload into `T`, reporting the failing field path.
pub fn decode_payload<T>(payload: Value) -> Result<T, ProcessError>
where
    T: DeserializeOwned,
{
    serde_path_to_error::deserialize(payload).map_err(ProcessError::from_path_error)
}

/// Business logic serving one operation.
///
/// # Example
///
/// ```
/// use broker_rpc::{Processor, Reply};
/// use serde_json::Value;
///
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl Processor for Echo {
///     async fn process(&self, payload: Value) -> Reply {
///         Reply::Json(payload)
///     }
/// }
/// ```
#[async_trait::async_trait]
pub trait Processor: Send + Sync {
    /// Compute the reply for one decoded request payload.
    async fn process(&self, payload: Value) -> Reply;
}

/// Shared processor pointer.
pub type ProcessorPtr = Arc<dyn Processor>;

/// Processor built from an untyped async closure.
struct FnProcessor<F> {
    func: F,
}

#[async_trait::async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Reply> + Send,
{
    async fn process(&self, payload: Value) -> Reply {
        (self.func)(payload).await
    }
}

/// Wrap `func` as a [`Processor`].
pub fn processor_fn<F, Fut>(func: F) -> ProcessorPtr
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Reply> + Send + 'static,
{
    Arc::new(FnProcessor { func })
}

/// Processor over a typed async function.
///
/// The payload is decoded into `Req` first; a mismatch becomes a
/// validation error naming the offending field. The function's `Resp` is
/// serialized as the reply and its `ProcessError` as an error reply.
pub struct TypedProcessor<F, Fut, Req, Resp> {
    // ---
    func: F,
    _phantom: PhantomData<fn(Req) -> (Resp, Fut)>,
}

impl<F, Fut, Req, Resp> TypedProcessor<F, Fut, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, ProcessError>> + Send,
    Req: DeserializeOwned + Send,
    Resp: Serialize + Send,
{
    /// Wrap a typed function.
    pub fn new(func: F) -> Self {
        Self {
            func,
            _phantom: PhantomData,
        }
    }
}

#[async_trait::async_trait]
impl<F, Fut, Req, Resp> Processor for TypedProcessor<F, Fut, Req, Resp>
where
    F: Fn(Req) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Resp, ProcessError>> + Send,
    Req: DeserializeOwned + Send,
    Resp: Serialize + Send,
{
    async fn process(&self, payload: Value) -> Reply {
        // ---
        let req: Req = match decode_payload(payload) {
            Ok(req) => req,
            Err(err) => return err.into(),
        };

        match (self.func)(req).await {
            Ok(resp) => match serde_json::to_value(resp) {
                Ok(value) => Reply::Json(value),
                Err(e) => ProcessError::business(format!("failed to encode reply: {e}")).into(),
            },
            Err(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[derive(Debug, Deserialize)]
    struct CreateSeller {
        username: String,
        age: u8,
    }

    fn create_seller() -> TypedProcessor<
        impl Fn(CreateSeller) -> std::future::Ready<Result<Value, ProcessError>> + Send + Sync,
        std::future::Ready<Result<Value, ProcessError>>,
        CreateSeller,
        Value,
    > {
        TypedProcessor::new(|req: CreateSeller| {
            std::future::ready(if req.username == "taken" {
                Err(ProcessError::business("username already exists"))
            } else {
                Ok(json!({ "username": req.username, "age": req.age }))
            })
        })
    }

    #[tokio::test]
    async fn test_typed_processor_success() {
        // ---
        let reply = create_seller().process(json!({"username": "ana", "age": 30})).await;
        assert_eq!(reply, Reply::Json(json!({"username": "ana", "age": 30})));
    }

    #[tokio::test]
    async fn test_missing_field_names_the_field() {
        // ---
        let reply = create_seller().process(json!({"age": 30})).await;

        let Reply::Json(body) = reply else {
            panic!("expected a JSON reply");
        };
        assert_eq!(body["error"][0]["loc"], json!(["username"]));
        assert_eq!(body["error"][0]["type"], json!("missing"));
    }

    #[tokio::test]
    async fn test_wrong_type_reports_path() {
        // ---
        let reply = create_seller().process(json!({"username": "ana", "age": "old"})).await;

        let Reply::Json(body) = reply else {
            panic!("expected a JSON reply");
        };
        assert_eq!(body["error"][0]["loc"], json!(["age"]));
        assert_eq!(body["error"][0]["type"], json!("invalid"));
    }

    #[tokio::test]
    async fn test_business_error_is_a_string() {
        // ---
        let reply = create_seller().process(json!({"username": "taken", "age": 30})).await;
        assert_eq!(reply, Reply::Json(json!({"error": "username already exists"})));
    }

    #[tokio::test]
    async fn test_processor_fn_passes_payload_through() {
        // ---
        let echo = processor_fn(|payload| async move { Reply::Json(payload) });
        assert_eq!(echo.process(json!({"x": 1})).await, Reply::Json(json!({"x": 1})));
    }

    #[test]
    fn test_text_reply_is_sent_verbatim() {
        // ---
        let body = Reply::Text(r#"{"products":[]}"#.into()).into_body();
        assert_eq!(body, Bytes::from_static(br#"{"products":[]}"#));
    }
}
