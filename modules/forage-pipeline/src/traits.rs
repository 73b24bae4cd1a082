// Trait seams for the pipeline's external collaborators.
//
// CandidateSource: whatever turns a strategy + target into candidate entities
//   (search APIs, scrapers, LLM extraction). The worker never sees HTML.
// ProductionCatalog: the system of record that approved entities are
//   promoted into. Returns the production id.
//
// Both are mocked in `testing.rs` so the whole pipeline runs without network.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use forage_common::{Factor, NewStagedEntity, StagedEntity, Strategy};

/// One unit of discovery work: a query against a platform, optionally aimed at a
/// chain and a market.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryTarget {
    pub platform: String,
    pub chain_id: Option<String>,
    pub market: Option<String>,
    pub query: String,
}

/// A candidate entity plus the scoring inputs the source could observe.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entity: NewStagedEntity,
    pub factors: Vec<Factor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiUsage {
    pub provider: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchResponse {
    pub candidates: Vec<Candidate>,
    /// Model calls made while producing the candidates, billed to the run.
    pub ai_usage: Vec<AiUsage>,
}

#[async_trait]
pub trait CandidateSource: Send + Sync {
    async fn search(&self, strategy: &Strategy, target: &DiscoveryTarget) -> Result<SearchResponse>;
}

#[async_trait]
pub trait ProductionCatalog: Send + Sync {
    /// Write an approved entity to production. Returns its production id.
    async fn publish(&self, entity: &StagedEntity) -> Result<String>;
}
