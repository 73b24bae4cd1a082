//! In-memory stand-ins for the pipeline's external collaborators, plus payload
//! fixtures. Compiled for unit tests and behind the `test-support` feature.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use forage_common::{
    ConfidenceResult, DishPayload, NewStagedEntity, Price, StagedEntity, StagedPayload, Strategy,
    VenuePayload,
};

use crate::traits::{
    AiUsage, Candidate, CandidateSource, DiscoveryTarget, ProductionCatalog, SearchResponse,
};

pub fn confidence(score: u8) -> ConfidenceResult {
    ConfidenceResult {
        score,
        breakdown: Vec::new(),
    }
}

pub fn venue_payload(name: &str) -> VenuePayload {
    VenuePayload {
        name: name.to_string(),
        address: "1 Main St".to_string(),
        city: "Austin".to_string(),
        country: "US".to_string(),
        latitude: Some(30.27),
        longitude: Some(-97.74),
        chain_id: None,
        platform: Some("google_maps".to_string()),
        source_url: None,
        website: None,
        phone: None,
    }
}

pub fn new_venue(name: &str, partner_id: Option<&str>, external_id: &str) -> NewStagedEntity {
    let mut entity = NewStagedEntity::new(StagedPayload::Venue(venue_payload(name)));
    entity.partner_id = partner_id.map(str::to_string);
    entity.external_id = Some(external_id.to_string());
    entity
}

pub fn new_dish(name: &str, staged_venue_id: &str, external_id: &str) -> NewStagedEntity {
    let mut entity = NewStagedEntity::new(StagedPayload::Dish(DishPayload {
        name: name.to_string(),
        description: None,
        price: Some(Price {
            amount: 9.5,
            currency: "USD".to_string(),
        }),
        product_sku: None,
        platform: Some("google_maps".to_string()),
        source_url: None,
    }));
    entity.staged_venue_id = Some(staged_venue_id.to_string());
    entity.external_id = Some(external_id.to_string());
    entity
}

/// A scraped venue candidate with no scoring inputs of its own.
pub fn venue_candidate(name: &str, external_id: &str) -> Candidate {
    Candidate {
        entity: new_venue(name, None, external_id),
        factors: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// MockCandidateSource
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Scripted {
    Candidates(Vec<Candidate>, Vec<AiUsage>),
    Failure(String),
}

/// Returns scripted responses keyed by query text. Unknown queries return no
/// candidates.
#[derive(Clone, Default)]
pub struct MockCandidateSource {
    responses: Arc<Mutex<HashMap<String, Scripted>>>,
    calls: Arc<Mutex<Vec<DiscoveryTarget>>>,
}

impl MockCandidateSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_query(self, query: &str, candidates: Vec<Candidate>) -> Self {
        self.script(query, Scripted::Candidates(candidates, Vec::new()))
    }

    pub fn on_query_with_ai(self, query: &str, candidates: Vec<Candidate>, usage: AiUsage) -> Self {
        self.script(query, Scripted::Candidates(candidates, vec![usage]))
    }

    pub fn failing(self, query: &str, message: &str) -> Self {
        self.script(query, Scripted::Failure(message.to_string()))
    }

    fn script(self, query: &str, response: Scripted) -> Self {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(query.to_string(), response);
        self
    }

    pub fn calls(&self) -> Vec<DiscoveryTarget> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl CandidateSource for MockCandidateSource {
    async fn search(&self, _strategy: &Strategy, target: &DiscoveryTarget) -> Result<SearchResponse> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(target.clone());
        let scripted = self
            .responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&target.query)
            .cloned();
        match scripted {
            Some(Scripted::Candidates(candidates, ai_usage)) => Ok(SearchResponse {
                candidates,
                ai_usage,
            }),
            Some(Scripted::Failure(message)) => Err(anyhow!(message)),
            None => Ok(SearchResponse::default()),
        }
    }
}

// ---------------------------------------------------------------------------
// MockCatalog
// ---------------------------------------------------------------------------

/// Records published entities and hands out sequential production ids.
#[derive(Clone, Default)]
pub struct MockCatalog {
    published: Arc<Mutex<Vec<String>>>,
}

impl MockCatalog {
    /// Staged ids in publish order.
    pub fn published(&self) -> Vec<String> {
        self.published.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl ProductionCatalog for MockCatalog {
    async fn publish(&self, entity: &StagedEntity) -> Result<String> {
        let mut published = self.published.lock().unwrap_or_else(|e| e.into_inner());
        published.push(entity.id.clone());
        Ok(format!("prod-{}-{}", entity.entity_type(), published.len()))
    }
}
