use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};
use crate::query::{Filter, Query};

/// Closure handed to [`DocumentStore::update_with`]. It may borrow from the
/// caller's stack for `'a`.
pub type ApplyFn<'a> = dyn for<'v> FnMut(&'v mut Value) -> Result<()> + Send + 'a;

/// Generic keyed-document repository.
///
/// All mutating methods advance `updated_at`. `create` stamps `id`, `created_at`
/// and `updated_at` in the same write as the insert. The store owns those three
/// fields; values supplied by callers are overwritten.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Missing ids are skipped. Order follows `ids`.
    async fn get_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Value>>;

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Value>>;

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64>;

    /// Insert a new document. A `None` id mints a UUID. Fails with
    /// `AlreadyExists` if the id is taken, which makes this the atomic claim
    /// primitive for uniqueness keys.
    async fn create(&self, collection: &str, id: Option<&str>, data: Value) -> Result<Value>;

    /// Serialized read-modify-write. `apply` sees the current document and runs
    /// while the store holds the document exclusively, so concurrent callers
    /// never lose each other's changes. Returning an error leaves the document
    /// untouched.
    async fn update_with(
        &self,
        collection: &str,
        id: &str,
        apply: &mut ApplyFn<'_>,
    ) -> Result<Value>;

    /// Returns whether a document was removed.
    async fn delete(&self, collection: &str, id: &str) -> Result<bool>;

    /// Shallow merge of `partial`'s top-level fields into the document.
    async fn update(&self, collection: &str, id: &str, partial: Value) -> Result<Value> {
        let Value::Object(fields) = partial else {
            return Err(StoreError::InvalidDocument(
                "partial update must be a JSON object".into(),
            ));
        };
        let mut apply = |doc: &mut Value| -> Result<()> {
            let target = as_object_mut(doc)?;
            for (key, value) in &fields {
                target.insert(key.clone(), value.clone());
            }
            Ok(())
        };
        self.update_with(collection, id, &mut apply).await
    }

    /// Apply independent operations in order. One failing op does not stop or
    /// roll back the others.
    async fn batch(&self, collection: &str, ops: Vec<BatchOp>) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(ops.len());
        for op in ops {
            let outcome = match op {
                BatchOp::Create { id, data } => {
                    let result = self.create(collection, id.as_deref(), data).await;
                    BatchOutcome::from_result(id.unwrap_or_default(), result.map(Some))
                }
                BatchOp::Update { id, partial } => {
                    let result = self.update(collection, &id, partial).await;
                    BatchOutcome::from_result(id, result.map(Some))
                }
                BatchOp::Delete { id } => {
                    let result = self.delete(collection, &id).await.and_then(|removed| {
                        if removed {
                            Ok(None)
                        } else {
                            Err(StoreError::not_found(collection, &id))
                        }
                    });
                    BatchOutcome::from_result(id, result)
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

#[derive(Debug, Clone)]
pub enum BatchOp {
    Create { id: Option<String>, data: Value },
    Update { id: String, partial: Value },
    Delete { id: String },
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub id: String,
    pub result: Result<Option<Value>>,
}

impl BatchOutcome {
    fn from_result(id: String, result: Result<Option<Value>>) -> Self {
        let id = match &result {
            Ok(Some(doc)) => doc
                .get("id")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(id),
            _ => id,
        };
        Self { id, result }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

// ---------------------------------------------------------------------------
// Helpers shared by store implementations
// ---------------------------------------------------------------------------

/// Fixed-width RFC 3339 so stored timestamps also sort lexicographically.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn as_object_mut(doc: &mut Value) -> Result<&mut Map<String, Value>> {
    doc.as_object_mut()
        .ok_or_else(|| StoreError::InvalidDocument("document must be a JSON object".into()))
}

pub(crate) fn stamp_created(doc: &mut Value, id: &str, now: &DateTime<Utc>) -> Result<()> {
    let obj = as_object_mut(doc)?;
    let ts = Value::String(format_timestamp(now));
    obj.insert("id".into(), Value::String(id.to_string()));
    obj.insert("created_at".into(), ts.clone());
    obj.insert("updated_at".into(), ts);
    Ok(())
}

/// Re-assert the store-owned fields after a caller mutation and advance `updated_at`.
pub(crate) fn stamp_updated(
    doc: &mut Value,
    original: &Value,
    now: &DateTime<Utc>,
) -> Result<()> {
    let id = original.get("id").cloned().unwrap_or(Value::Null);
    let created_at = original.get("created_at").cloned().unwrap_or(Value::Null);
    let obj = as_object_mut(doc)?;
    obj.insert("id".into(), id);
    obj.insert("created_at".into(), created_at);
    obj.insert("updated_at".into(), Value::String(format_timestamp(now)));
    Ok(())
}
