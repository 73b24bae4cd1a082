use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::query::{Filter, Query};
use crate::store::{BatchOp, BatchOutcome, DocumentStore};

/// Typed view over one collection of a `DocumentStore`.
pub struct Collection<T> {
    store: Arc<dyn DocumentStore>,
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            name: self.name,
            _marker: PhantomData,
        }
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    pub fn new(store: Arc<dyn DocumentStore>, name: &'static str) -> Self {
        Self {
            store,
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn get(&self, id: &str) -> Result<Option<T>> {
        self.store
            .get(self.name, id)
            .await?
            .map(decode)
            .transpose()
    }

    /// Like `get`, but a missing document is an error.
    pub async fn require(&self, id: &str) -> Result<T> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::not_found(self.name, id))
    }

    pub async fn get_by_ids(&self, ids: &[String]) -> Result<Vec<T>> {
        self.store
            .get_by_ids(self.name, ids)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn query(&self, query: &Query) -> Result<Vec<T>> {
        self.store
            .query(self.name, query)
            .await?
            .into_iter()
            .map(decode)
            .collect()
    }

    pub async fn all(&self) -> Result<Vec<T>> {
        self.query(&Query::new()).await
    }

    pub async fn count(&self, filters: &[Filter]) -> Result<u64> {
        self.store.count(self.name, filters).await
    }

    pub async fn insert(&self, id: Option<&str>, item: &T) -> Result<T> {
        let data = serde_json::to_value(item)?;
        decode(self.store.create(self.name, id, data).await?)
    }

    pub async fn update(&self, id: &str, partial: Value) -> Result<T> {
        decode(self.store.update(self.name, id, partial).await?)
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.store.delete(self.name, id).await
    }

    pub async fn batch(&self, ops: Vec<BatchOp>) -> Vec<BatchOutcome> {
        self.store.batch(self.name, ops).await
    }

    /// Serialized typed read-modify-write.
    ///
    /// `f` runs with exclusive access to the document. If it returns `Err`, nothing
    /// is written and that error is returned unchanged. On success the stored
    /// document and `f`'s value are returned.
    pub async fn mutate<R, E, F>(&self, id: &str, mut f: F) -> std::result::Result<(T, R), E>
    where
        F: FnMut(&mut T) -> std::result::Result<R, E> + Send,
        E: From<StoreError> + Send,
        R: Send,
    {
        let mut outcome: Option<std::result::Result<R, E>> = None;
        let mut apply = |doc: &mut Value| -> Result<()> {
            let mut item: T = serde_json::from_value(doc.clone())?;
            match f(&mut item) {
                Ok(value) => {
                    *doc = serde_json::to_value(&item)?;
                    outcome = Some(Ok(value));
                    Ok(())
                }
                Err(e) => {
                    outcome = Some(Err(e));
                    Err(StoreError::Aborted)
                }
            }
        };

        let stored = self.store.update_with(self.name, id, &mut apply).await;
        match (stored, outcome) {
            (_, Some(Err(e))) => Err(e),
            (Ok(doc), Some(Ok(value))) => Ok((decode(doc)?, value)),
            (Err(e), _) => Err(e.into()),
            (Ok(_), None) => Err(StoreError::Aborted.into()),
        }
    }
}

fn decode<T: DeserializeOwned>(doc: Value) -> Result<T> {
    Ok(serde_json::from_value(doc)?)
}
