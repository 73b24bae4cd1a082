use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::query::{Filter, Query};
use crate::store::{stamp_created, stamp_updated, ApplyFn, DocumentStore};

/// In-process document store for single-instance deployments and tests.
///
/// One mutex guards every collection. Closures passed to `update_with` run under
/// that lock, which is what makes concurrent counter updates exact.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents across all collections.
    pub fn len(&self) -> usize {
        self.lock().values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, BTreeMap<String, Value>>> {
        // A panic inside an update closure poisons the lock; the map itself is
        // never left half-written because closures operate on a clone.
        self.collections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        Ok(self
            .lock()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn get_by_ids(&self, collection: &str, ids: &[String]) -> Result<Vec<Value>> {
        let guard = self.lock();
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(ids.iter().filter_map(|id| docs.get(id).cloned()).collect())
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Value>> {
        let guard = self.lock();
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };
        let mut matched: Vec<Value> = docs.values().filter(|d| query.matches(d)).cloned().collect();
        drop(guard);

        matched.sort_by(|a, b| query.compare(a, b));
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn count(&self, collection: &str, filters: &[Filter]) -> Result<u64> {
        let guard = self.lock();
        let Some(docs) = guard.get(collection) else {
            return Ok(0);
        };
        Ok(docs
            .values()
            .filter(|d| filters.iter().all(|f| f.matches(d)))
            .count() as u64)
    }

    async fn create(&self, collection: &str, id: Option<&str>, mut data: Value) -> Result<Value> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        stamp_created(&mut data, &id, &Utc::now())?;

        let mut guard = self.lock();
        let docs = guard.entry(collection.to_string()).or_default();
        if docs.contains_key(&id) {
            return Err(StoreError::already_exists(collection, &id));
        }
        docs.insert(id, data.clone());
        Ok(data)
    }

    async fn update_with(
        &self,
        collection: &str,
        id: &str,
        apply: &mut ApplyFn<'_>,
    ) -> Result<Value> {
        let mut guard = self.lock();
        let current = guard
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or_else(|| StoreError::not_found(collection, id))?;

        let mut next = current.clone();
        apply(&mut next)?;
        stamp_updated(&mut next, current, &Utc::now())?;
        *current = next.clone();
        Ok(next)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self
            .lock()
            .get_mut(collection)
            .map(|docs| docs.remove(id).is_some())
            .unwrap_or(false))
    }
}
