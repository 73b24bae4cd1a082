use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use forage_common::{StagedEntity, Strategy};
use forage_pipeline::{CandidateSource, DiscoveryTarget, ProductionCatalog, SearchResponse};
use forage_store::DocumentStore;

/// Source used when no search provider is wired in. Every search comes back
/// empty, so runs complete and record `no_results` feedback.
pub struct NoopSource;

#[async_trait]
impl CandidateSource for NoopSource {
    async fn search(&self, strategy: &Strategy, target: &DiscoveryTarget) -> Result<SearchResponse> {
        debug!(
            strategy_id = %strategy.id,
            platform = %target.platform,
            query = %target.query,
            "No candidate source configured"
        );
        Ok(SearchResponse::default())
    }
}

/// Production catalog kept in the document store, one `catalog_<type>`
/// collection per entity type. The production id is the catalog document's id.
pub struct StoreCatalog {
    store: Arc<dyn DocumentStore>,
}

impl StoreCatalog {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    pub fn collection(entity: &StagedEntity) -> String {
        format!("catalog_{}", entity.entity_type())
    }
}

#[async_trait]
impl ProductionCatalog for StoreCatalog {
    async fn publish(&self, entity: &StagedEntity) -> Result<String> {
        let collection = Self::collection(entity);
        let doc = self
            .store
            .create(
                &collection,
                None,
                json!({
                    "staged_id": entity.id,
                    "payload": entity.payload,
                    "partner_id": entity.partner_id,
                    "chain_id": entity.chain_id(),
                    "published_at": Utc::now(),
                }),
            )
            .await
            .with_context(|| format!("publishing {} {}", entity.entity_type(), entity.id))?;
        let id = doc["id"]
            .as_str()
            .context("catalog document has no id")?
            .to_string();
        info!(staged_id = %entity.id, production_id = %id, %collection, "Published to catalog");
        Ok(id)
    }
}
