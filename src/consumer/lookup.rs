//! "Get <nouns> by ids" processor.
//!
//! Request: `{"<id_field>": ["<uuid>", ...] | null}`.
//! Reply: `{"<records_field>": [ {...}, ... ]}`.
//!
//! A `null` id list asks for every record; an empty list asks for none. The
//! distinction is kept all the way down to the lookup function, which
//! receives `None` and `Some(vec![])` respectively.

use std::future::Future;
use std::marker::PhantomData;

use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;

use super::processor::{FieldError, ProcessError, Processor, Reply};
use crate::codec::kind_of;

/// Bulk lookup processor.
///
/// # Example
///
/// ```
/// use broker_rpc::{BulkLookup, ProcessError};
/// use serde_json::{json, Value};
/// use uuid::Uuid;
///
/// let products = BulkLookup::new("product_ids", "products", |ids: Option<Vec<Uuid>>| async move {
///     // query storage here
///     Ok::<Vec<Value>, ProcessError>(Vec::new())
/// });
/// # let _ = products;
/// ```
pub struct BulkLookup<F, Fut, T> {
    // ---
    id_field: String,
    records_field: String,
    lookup: F,
    _phantom: PhantomData<fn() -> (T, Fut)>,
}

impl<F, Fut, T> BulkLookup<F, Fut, T>
where
    F: Fn(Option<Vec<Uuid>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<T>, ProcessError>> + Send,
    T: Serialize + Send,
{
    /// Lookup reading ids from `id_field` and answering under `records_field`.
    pub fn new(id_field: impl Into<String>, records_field: impl Into<String>, lookup: F) -> Self {
        Self {
            id_field: id_field.into(),
            records_field: records_field.into(),
            lookup,
            _phantom: PhantomData,
        }
    }
}

/// Read the id list from `payload[field]`.
///
/// Every problem is reported, not just the first one.
pub(crate) fn parse_ids(payload: &Value, field: &str) -> Result<Option<Vec<Uuid>>, ProcessError> {
    // ---
    let Some(object) = payload.as_object() else {
        return Err(ProcessError::Validation(vec![FieldError::invalid(
            Vec::new(),
            format!("expected an object, got {}", kind_of(payload)),
        )]));
    };

    let items = match object.get(field) {
        None => return Err(ProcessError::Validation(vec![FieldError::missing(field)])),
        Some(Value::Null) => return Ok(None),
        Some(Value::Array(items)) => items,
        Some(other) => {
            return Err(ProcessError::Validation(vec![FieldError::invalid(
                vec![field.to_string()],
                format!("expected a list of ids, got {}", kind_of(other)),
            )]))
        }
    };

    let mut ids = Vec::with_capacity(items.len());
    let mut errors = Vec::new();

    for (index, item) in items.iter().enumerate() {
        match item.as_str().map(Uuid::parse_str) {
            Some(Ok(id)) => ids.push(id),
            _ => errors.push(FieldError::invalid(
                vec![field.to_string(), index.to_string()],
                "Input should be a valid UUID",
            )),
        }
    }

    if errors.is_empty() {
        Ok(Some(ids))
    } else {
        Err(ProcessError::Validation(errors))
    }
}

/// Order records by the position of their `id` in `requested`.
///
/// Records without a requested id keep their relative order at the end.
pub(crate) fn sort_by_requested(records: &mut [Value], requested: &[Uuid]) {
    // ---
    let position = |record: &Value| {
        record
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok())
            .and_then(|id| requested.iter().position(|wanted| *wanted == id))
            .unwrap_or(usize::MAX)
    };

    records.sort_by_key(position);
}

#[async_trait::async_trait]
impl<F, Fut, T> Processor for BulkLookup<F, Fut, T>
where
    F: Fn(Option<Vec<Uuid>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<T>, ProcessError>> + Send,
    T: Serialize + Send,
{
    async fn process(&self, payload: Value) -> Reply {
        // ---
        let requested = match parse_ids(&payload, &self.id_field) {
            Ok(ids) => ids,
            Err(err) => return err.into(),
        };

        let records = match (self.lookup)(requested.clone()).await {
            Ok(records) => records,
            Err(err) => return err.into(),
        };

        let mut values = match records
            .into_iter()
            .map(serde_json::to_value)
            .collect::<Result<Vec<_>, _>>()
        {
            Ok(values) => values,
            Err(e) => return ProcessError::business(format!("failed to encode records: {e}")).into(),
        };

        if let Some(ids) = &requested {
            sort_by_requested(&mut values, ids);
        }

        let mut body = Map::new();
        body.insert(self.records_field.clone(), Value::Array(values));
        Reply::Json(Value::Object(body))
    }
}
