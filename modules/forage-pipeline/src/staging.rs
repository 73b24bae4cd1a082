//! Staging store.
//!
//! Four collections of staged entities (one per payload type) plus a
//! `staging_keys` index that makes resubmissions idempotent. A key document's id
//! is the logical identity of a submission; creating it is the atomic claim. While
//! the record it points at is open, duplicates merge into that record. Records
//! that leave the open set release their key (`entity_id = None`) so the next
//! submission starts a new record.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use forage_common::config::StagingConfig;
use forage_common::{
    ConfidenceResult, EntityType, ForageError, NewStagedEntity, PartnerConfig, Result,
    ReviewDecision, StagedEntity, StagedPayload, StagingStatus, SYSTEM_REVIEWER,
};
use forage_store::{cache_key, Cache, Collection, DocumentStore, Filter, InvalidationRules, Query};

use crate::learning::{DecisionEvent, LearningHooks};
use crate::traits::ProductionCatalog;

pub const KEYS_COLLECTION: &str = "staging_keys";

const REVIEW_QUEUE_PREFIX: &str = "review_queue:";
const REVIEW_QUEUE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_PAGE_SIZE: usize = 50;
const MAX_PAGE_SIZE: usize = 200;

const CLAIM_ATTEMPTS: usize = 5;
const CLAIM_BACKOFF: Duration = Duration::from_millis(20);

/// Dedup index entry. `entity_id` is None once the record has been decided.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagingKey {
    #[serde(default)]
    pub id: String,
    pub entity_type: EntityType,
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageOutcome {
    pub entity: StagedEntity,
    /// True when the submission was folded into an existing open record.
    pub merged: bool,
}

/// Thresholds used by `auto_route`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePolicy {
    pub auto_approve_threshold: u8,
    pub auto_reject_below: u8,
    pub manual_review: bool,
}

impl RoutePolicy {
    /// Policy for producers without a partner record.
    pub fn from_config(config: &StagingConfig) -> Self {
        Self {
            auto_approve_threshold: config.default_auto_approve_threshold,
            auto_reject_below: config.auto_reject_below,
            manual_review: false,
        }
    }

    pub fn for_partner(partner: &PartnerConfig, config: &StagingConfig) -> Self {
        Self {
            auto_approve_threshold: partner.auto_approve_threshold,
            auto_reject_below: config.auto_reject_below,
            manual_review: partner.manual_review_required,
        }
    }

    /// None means a human has to look at it.
    pub fn route(&self, entity: &StagedEntity) -> Option<ReviewDecision> {
        let score = entity.confidence_score;
        if entity.flags.is_empty() && !self.manual_review && score >= self.auto_approve_threshold {
            Some(ReviewDecision::Approved)
        } else if score < self.auto_reject_below {
            Some(ReviewDecision::Rejected)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueueFilter {
    pub entity_type: Option<EntityType>,
    /// Defaults to the open statuses.
    pub status: Option<StagingStatus>,
    pub country: Option<String>,
    pub min_confidence: Option<u8>,
    pub max_confidence: Option<u8>,
    pub search: Option<String>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewQueuePage {
    pub items: Vec<StagedEntity>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkItemStatus {
    Success,
    NotFound,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkItem {
    pub id: String,
    pub status: BulkItemStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkResult {
    pub successful: usize,
    pub not_found: usize,
    pub failed: usize,
    pub items: Vec<BulkItem>,
}

impl BulkResult {
    fn push(&mut self, id: &str, result: Result<StagedEntity>) {
        let (status, error) = match result {
            Ok(_) => {
                self.successful += 1;
                (BulkItemStatus::Success, None)
            }
            Err(e) if e.is_not_found() => {
                self.not_found += 1;
                (BulkItemStatus::NotFound, None)
            }
            Err(e) => {
                self.failed += 1;
                (BulkItemStatus::Failed, Some(e.to_string()))
            }
        };
        self.items.push(BulkItem {
            id: id.to_string(),
            status,
            error,
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialApproval {
    pub venue: StagedEntity,
    pub approved: Vec<StagedEntity>,
    pub rejected: Vec<StagedEntity>,
    /// Dishes whose decision failed. The rest of the batch still went through.
    pub failed: Vec<BulkItem>,
}

#[derive(Clone)]
pub struct StagingStore {
    venues: Collection<StagedEntity>,
    dishes: Collection<StagedEntity>,
    promotions: Collection<StagedEntity>,
    availability: Collection<StagedEntity>,
    keys: Collection<StagingKey>,
    cache: Arc<dyn Cache>,
    invalidation: InvalidationRules,
    config: StagingConfig,
    learning: Option<LearningHooks>,
}

impl StagingStore {
    pub fn new(store: Arc<dyn DocumentStore>, cache: Arc<dyn Cache>, config: StagingConfig) -> Self {
        let invalidation = EntityType::ALL
            .iter()
            .fold(InvalidationRules::new(), |rules, t| {
                rules.on(t.collection(), REVIEW_QUEUE_PREFIX)
            });
        Self {
            venues: Collection::new(store.clone(), EntityType::Venue.collection()),
            dishes: Collection::new(store.clone(), EntityType::Dish.collection()),
            promotions: Collection::new(store.clone(), EntityType::Promotion.collection()),
            availability: Collection::new(store.clone(), EntityType::Availability.collection()),
            keys: Collection::new(store, KEYS_COLLECTION),
            cache,
            invalidation,
            config,
            learning: None,
        }
    }

    pub fn with_learning(mut self, hooks: LearningHooks) -> Self {
        self.learning = Some(hooks);
        self
    }

    pub fn config(&self) -> &StagingConfig {
        &self.config
    }

    pub fn default_policy(&self) -> RoutePolicy {
        RoutePolicy::from_config(&self.config)
    }

    fn collection(&self, entity_type: EntityType) -> &Collection<StagedEntity> {
        match entity_type {
            EntityType::Venue => &self.venues,
            EntityType::Dish => &self.dishes,
            EntityType::Promotion => &self.promotions,
            EntityType::Availability => &self.availability,
        }
    }

    // -----------------------------------------------------------------------
    // Intake
    // -----------------------------------------------------------------------

    /// Persist a submission as `pending`, or merge it into the open record that
    /// already holds its dedup key.
    pub async fn stage(
        &self,
        new: NewStagedEntity,
        confidence: ConfidenceResult,
    ) -> Result<StageOutcome> {
        new.validate()?;
        let entity_type = new.entity_type();

        let Some(key) = new.dedup_key() else {
            let entity = self
                .collection(entity_type)
                .insert(None, &StagedEntity::from_new(new, confidence))
                .await?;
            self.invalidate(entity_type).await;
            return Ok(StageOutcome {
                entity,
                merged: false,
            });
        };

        for attempt in 0..CLAIM_ATTEMPTS {
            let entity_id = Uuid::new_v4().to_string();
            let claim = StagingKey {
                id: String::new(),
                entity_type,
                entity_id: Some(entity_id.clone()),
            };
            match self.keys.insert(Some(&key), &claim).await {
                Ok(_) => {
                    let entity = self
                        .insert_claimed(&key, &entity_id, new.clone(), confidence.clone())
                        .await?;
                    return Ok(StageOutcome {
                        entity,
                        merged: false,
                    });
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }

            // Someone holds the key.
            let Some(held) = self.keys.get(&key).await? else {
                continue;
            };
            let target = match &held.entity_id {
                Some(id) => self.collection(entity_type).get(id).await?,
                None => None,
            };

            match target {
                Some(existing) if existing.is_open() => {
                    if let Some(entity) = self
                        .merge_into(entity_type, &existing.id, &new, &confidence)
                        .await?
                    {
                        debug!(key = %key, id = %entity.id, count = entity.submission_count, "Merged resubmission");
                        return Ok(StageOutcome {
                            entity,
                            merged: true,
                        });
                    }
                }
                // The holder may still be inserting its record.
                None if held.entity_id.is_some() && attempt + 1 < CLAIM_ATTEMPTS => {
                    tokio::time::sleep(CLAIM_BACKOFF).await;
                }
                _ => {
                    if self.reclaim(&key, held.entity_id.as_deref(), &entity_id).await? {
                        let entity = self
                            .insert_claimed(&key, &entity_id, new.clone(), confidence.clone())
                            .await?;
                        return Ok(StageOutcome {
                            entity,
                            merged: false,
                        });
                    }
                }
            }
        }

        Err(ForageError::Duplicate {
            kind: entity_type.to_string(),
            key,
        })
    }

    /// Stage, then route by score under `policy`.
    pub async fn submit(
        &self,
        new: NewStagedEntity,
        confidence: ConfidenceResult,
        policy: RoutePolicy,
    ) -> Result<StageOutcome> {
        let outcome = self.stage(new, confidence).await?;
        let entity = self
            .auto_route(outcome.entity.entity_type(), &outcome.entity.id, policy)
            .await?;
        Ok(StageOutcome {
            entity,
            merged: outcome.merged,
        })
    }

    async fn insert_claimed(
        &self,
        key: &str,
        entity_id: &str,
        new: NewStagedEntity,
        confidence: ConfidenceResult,
    ) -> Result<StagedEntity> {
        let entity_type = new.entity_type();
        let fresh = StagedEntity::from_new(new, confidence);
        match self.collection(entity_type).insert(Some(entity_id), &fresh).await {
            Ok(entity) => {
                self.invalidate(entity_type).await;
                Ok(entity)
            }
            Err(e) => {
                self.release_key(key, entity_id).await;
                Err(e.into())
            }
        }
    }

    /// None if the record closed before the merge landed.
    async fn merge_into(
        &self,
        entity_type: EntityType,
        id: &str,
        new: &NewStagedEntity,
        confidence: &ConfidenceResult,
    ) -> Result<Option<StagedEntity>> {
        let merged = self
            .collection(entity_type)
            .mutate(id, |e| {
                if !e.is_open() {
                    return Ok(false);
                }
                e.merge_resubmission(new.clone(), confidence.clone());
                Ok::<_, ForageError>(true)
            })
            .await;
        match merged {
            Ok((entity, true)) => {
                self.invalidate(entity_type).await;
                Ok(Some(entity))
            }
            Ok((_, false)) => Ok(None),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Point a stale key at `entity_id`, provided nobody re-pointed it first.
    async fn reclaim(&self, key: &str, stale: Option<&str>, entity_id: &str) -> Result<bool> {
        let result = self
            .keys
            .mutate(key, |k| {
                if k.entity_id.as_deref() != stale {
                    return Ok(false);
                }
                k.entity_id = Some(entity_id.to_string());
                Ok::<_, ForageError>(true)
            })
            .await;
        match result {
            Ok((_, claimed)) => Ok(claimed),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn release_key(&self, key: &str, entity_id: &str) {
        let result = self
            .keys
            .mutate(key, |k| {
                if k.entity_id.as_deref() == Some(entity_id) {
                    k.entity_id = None;
                }
                Ok::<_, ForageError>(())
            })
            .await;
        if let Err(e) = result {
            if !e.is_not_found() {
                warn!(key, entity_id, error = %e, "Failed to release staging key");
            }
        }
    }

    /// Re-index a record that came back into the open set, unless another open
    /// record has taken its key meanwhile.
    async fn restore_key(&self, entity: &StagedEntity) {
        let Some(key) = &entity.dedup_key else {
            return;
        };
        let claim = StagingKey {
            id: String::new(),
            entity_type: entity.entity_type(),
            entity_id: Some(entity.id.clone()),
        };
        let result = match self.keys.insert(Some(key), &claim).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_already_exists() => self.reclaim(key, None, &entity.id).await,
            Err(e) => Err(e.into()),
        };
        match result {
            Ok(true) => debug!(key = %key, id = %entity.id, "Restored staging key"),
            Ok(false) => debug!(key = %key, id = %entity.id, "Staging key held by another record"),
            Err(e) => warn!(key = %key, id = %entity.id, error = %e, "Failed to restore staging key"),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub async fn get(&self, entity_type: EntityType, id: &str) -> Result<StagedEntity> {
        Ok(self.collection(entity_type).require(id).await?)
    }

    /// Oldest first across the selected collections. Pages are cached until the
    /// next mutation of a staged collection.
    pub async fn review_queue(&self, filter: &ReviewQueueFilter) -> Result<ReviewQueuePage> {
        let cache_key = cache_key(REVIEW_QUEUE_PREFIX, filter);
        if let Some(hit) = self.cache.get(&cache_key).await {
            match serde_json::from_value::<ReviewQueuePage>(hit) {
                Ok(page) => return Ok(page),
                Err(e) => debug!(error = %e, "Discarding unreadable review queue entry"),
            }
        }

        let query = queue_query(filter);
        let types: Vec<EntityType> = match filter.entity_type {
            Some(t) => vec![t],
            None => EntityType::ALL.to_vec(),
        };
        let mut matching = Vec::new();
        for t in types {
            matching.extend(self.collection(t).query(&query).await?);
        }
        matching.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));

        let limit = filter.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let page = ReviewQueuePage {
            total: matching.len(),
            items: matching.into_iter().skip(filter.offset).take(limit).collect(),
            offset: filter.offset,
            limit,
        };

        if let Ok(value) = serde_json::to_value(&page) {
            self.cache.set(&cache_key, value, REVIEW_QUEUE_TTL).await;
        }
        Ok(page)
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    pub async fn begin_validation(&self, entity_type: EntityType, id: &str) -> Result<StagedEntity> {
        self.apply(entity_type, id, |e| e.transition(StagingStatus::Validating))
            .await
    }

    /// Replace the score of an open record.
    pub async fn update_confidence(
        &self,
        entity_type: EntityType,
        id: &str,
        confidence: ConfidenceResult,
    ) -> Result<StagedEntity> {
        self.apply(entity_type, id, |e| {
            if !e.is_open() {
                return Err(ForageError::Validation(format!(
                    "confidence of a {} record is frozen",
                    e.status
                )));
            }
            e.set_confidence(confidence.clone());
            Ok(())
        })
        .await
    }

    /// Approve, reject or queue an open record for review. Closed records are
    /// returned unchanged.
    pub async fn auto_route(
        &self,
        entity_type: EntityType,
        id: &str,
        policy: RoutePolicy,
    ) -> Result<StagedEntity> {
        let now = Utc::now();
        // Some(first) when a decision was made.
        let (entity, decided) = self
            .collection(entity_type)
            .mutate(id, |e| {
                if !e.is_open() {
                    return Ok(None);
                }
                match policy.route(e) {
                    Some(decision) => {
                        e.decide(decision, SYSTEM_REVIEWER, None, now)?;
                        Ok(Some(e.claim_learning()))
                    }
                    None => {
                        if e.status != StagingStatus::NeedsReview {
                            e.transition(StagingStatus::NeedsReview)?;
                        }
                        Ok::<_, ForageError>(None)
                    }
                }
            })
            .await?;

        self.invalidate(entity_type).await;
        if let Some(first) = decided {
            debug!(id, %entity_type, status = %entity.status, score = entity.confidence_score, "Auto-routed");
            self.after_decision(&entity, first).await;
        }
        Ok(entity)
    }

    /// Flag a record for review. Flags on promoted records are ignored.
    pub async fn add_flag(
        &self,
        entity_type: EntityType,
        id: &str,
        flag: &str,
    ) -> Result<StagedEntity> {
        if flag.trim().is_empty() {
            return Err(ForageError::Validation("flag must not be blank".into()));
        }
        let (entity, reopened) = self
            .collection(entity_type)
            .mutate(id, |e| {
                let was_open = e.is_open();
                e.add_flag(flag);
                Ok::<_, ForageError>(!was_open && e.is_open())
            })
            .await?;
        self.invalidate(entity_type).await;
        if reopened {
            self.restore_key(&entity).await;
        }
        info!(id, %entity_type, flag, status = %entity.status, "Flag added");
        Ok(entity)
    }

    pub async fn approve(
        &self,
        entity_type: EntityType,
        id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<StagedEntity> {
        self.decide(entity_type, id, ReviewDecision::Approved, reviewer, notes)
            .await
    }

    pub async fn reject(
        &self,
        entity_type: EntityType,
        id: &str,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<StagedEntity> {
        self.decide(entity_type, id, ReviewDecision::Rejected, reviewer, notes)
            .await
    }

    async fn decide(
        &self,
        entity_type: EntityType,
        id: &str,
        decision: ReviewDecision,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<StagedEntity> {
        if reviewer.trim().is_empty() {
            return Err(ForageError::Validation("reviewer is required".into()));
        }
        let now = Utc::now();
        let (entity, first) = self
            .collection(entity_type)
            .mutate(id, |e| {
                e.decide(decision, reviewer, notes.clone(), now)?;
                Ok::<_, ForageError>(e.claim_learning())
            })
            .await?;
        self.invalidate(entity_type).await;
        info!(id, %entity_type, reviewer, status = %entity.status, "Review decision");
        self.after_decision(&entity, first).await;
        Ok(entity)
    }

    /// Approve a venue and the chosen dishes linked to it; every other open dish
    /// linked to the venue is rejected.
    pub async fn partial_approve(
        &self,
        venue_id: &str,
        dish_ids: &[String],
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<PartialApproval> {
        let linked = self
            .dishes
            .query(&Query::new().filter(Filter::eq("staged_venue_id", venue_id)))
            .await?;
        if let Some(stray) = dish_ids
            .iter()
            .find(|id| !linked.iter().any(|d| &d.id == *id))
        {
            return Err(ForageError::Validation(format!(
                "dish {stray} is not linked to venue {venue_id}"
            )));
        }

        let venue = self
            .approve(EntityType::Venue, venue_id, reviewer, notes.clone())
            .await?;

        let mut approved = Vec::new();
        let mut rejected = Vec::new();
        let mut failed = Vec::new();
        for dish in linked {
            let selected = dish_ids.contains(&dish.id);
            if !selected && !dish.is_open() {
                continue;
            }
            let outcome = if selected {
                self.approve(EntityType::Dish, &dish.id, reviewer, notes.clone())
                    .await
            } else {
                self.reject(
                    EntityType::Dish,
                    &dish.id,
                    reviewer,
                    Some("not selected in partial approval".into()),
                )
                .await
            };
            match outcome {
                Ok(decided) if selected => approved.push(decided),
                Ok(decided) => rejected.push(decided),
                Err(e) => {
                    warn!(venue_id, dish_id = %dish.id, error = %e, "Dish decision failed");
                    failed.push(BulkItem {
                        id: dish.id.clone(),
                        status: if e.is_not_found() {
                            BulkItemStatus::NotFound
                        } else {
                            BulkItemStatus::Failed
                        },
                        error: Some(e.to_string()),
                    });
                }
            }
        }
        info!(
            venue_id,
            approved = approved.len(),
            rejected = rejected.len(),
            failed = failed.len(),
            "Partial approval"
        );
        Ok(PartialApproval {
            venue,
            approved,
            rejected,
            failed,
        })
    }

    pub async fn mark_promoted(
        &self,
        entity_type: EntityType,
        id: &str,
        production_id: &str,
    ) -> Result<StagedEntity> {
        let entity = self
            .apply(entity_type, id, |e| e.mark_promoted(production_id))
            .await?;
        info!(id, %entity_type, production_id, "Promoted");
        Ok(entity)
    }

    /// Publish an approved record to the production catalog and link it.
    pub async fn promote(
        &self,
        entity_type: EntityType,
        id: &str,
        catalog: &dyn ProductionCatalog,
    ) -> Result<StagedEntity> {
        let entity = self.get(entity_type, id).await?;
        if entity.status != StagingStatus::Approved {
            return Err(ForageError::invalid_transition(
                entity.status,
                StagingStatus::Promoted,
            ));
        }
        let production_id = catalog.publish(&entity).await?;
        self.mark_promoted(entity_type, id, &production_id).await
    }

    pub async fn bulk_approve(
        &self,
        entity_type: EntityType,
        ids: &[String],
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<BulkResult> {
        self.bulk(entity_type, ids, ReviewDecision::Approved, reviewer, notes)
            .await
    }

    pub async fn bulk_reject(
        &self,
        entity_type: EntityType,
        ids: &[String],
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<BulkResult> {
        self.bulk(entity_type, ids, ReviewDecision::Rejected, reviewer, notes)
            .await
    }

    async fn bulk(
        &self,
        entity_type: EntityType,
        ids: &[String],
        decision: ReviewDecision,
        reviewer: &str,
        notes: Option<String>,
    ) -> Result<BulkResult> {
        self.check_bulk_size(ids)?;
        if reviewer.trim().is_empty() {
            return Err(ForageError::Validation("reviewer is required".into()));
        }
        let mut result = BulkResult::default();
        for id in ids {
            let outcome = self
                .decide(entity_type, id, decision, reviewer, notes.clone())
                .await;
            result.push(id, outcome);
        }
        info!(
            %entity_type,
            ?decision,
            successful = result.successful,
            not_found = result.not_found,
            failed = result.failed,
            "Bulk review"
        );
        Ok(result)
    }

    /// Attach staged venues to a chain. Promoted venues are refused per item.
    pub async fn assign_chain(&self, venue_ids: &[String], chain_id: &str) -> Result<BulkResult> {
        self.check_bulk_size(venue_ids)?;
        if chain_id.trim().is_empty() {
            return Err(ForageError::Validation("chain_id must not be blank".into()));
        }
        let mut result = BulkResult::default();
        for id in venue_ids {
            let outcome = self
                .apply(EntityType::Venue, id, |e| {
                    if e.status.is_terminal() {
                        return Err(ForageError::Validation(format!(
                            "venue {} is already promoted",
                            e.id
                        )));
                    }
                    match &mut e.payload {
                        StagedPayload::Venue(v) => {
                            v.chain_id = Some(chain_id.to_string());
                            Ok(())
                        }
                        _ => Err(ForageError::Validation("not a venue".into())),
                    }
                })
                .await;
            result.push(id, outcome);
        }
        info!(chain_id, successful = result.successful, "Assigned chain");
        Ok(result)
    }

    fn check_bulk_size(&self, ids: &[String]) -> Result<()> {
        if ids.len() > self.config.bulk_max {
            return Err(ForageError::Validation(format!(
                "at most {} ids per bulk request, got {}",
                self.config.bulk_max,
                ids.len()
            )));
        }
        Ok(())
    }

    async fn apply<F>(&self, entity_type: EntityType, id: &str, mut f: F) -> Result<StagedEntity>
    where
        F: FnMut(&mut StagedEntity) -> Result<()> + Send,
    {
        let (entity, ()) = self.collection(entity_type).mutate(id, |e| f(e)).await?;
        self.invalidate(entity_type).await;
        Ok(entity)
    }

    /// `learn` is true only for the record's first decision.
    async fn after_decision(&self, entity: &StagedEntity, learn: bool) {
        if let Some(key) = &entity.dedup_key {
            self.release_key(key, &entity.id).await;
        }
        if !learn {
            return;
        }
        if let (Some(hooks), Some(event)) = (&self.learning, DecisionEvent::from_entity(entity)) {
            hooks.notify(event);
        }
    }

    async fn invalidate(&self, entity_type: EntityType) {
        let removed = self
            .invalidation
            .apply(self.cache.as_ref(), entity_type.collection())
            .await;
        if removed > 0 {
            debug!(%entity_type, removed, "Invalidated review queue cache");
        }
    }
}

fn queue_query(filter: &ReviewQueueFilter) -> Query {
    let mut query = Query::new();
    query = match filter.status {
        Some(status) => query.filter(Filter::eq("status", status.as_str())),
        None => query.filter(Filter::is_in(
            "status",
            [
                StagingStatus::Pending,
                StagingStatus::Validating,
                StagingStatus::NeedsReview,
            ]
            .iter()
            .map(|s| s.as_str()),
        )),
    };
    if let Some(country) = filter.country.as_deref().filter(|c| !c.trim().is_empty()) {
        query = query.filter(Filter::eq("country", country));
    }
    if let Some(min) = filter.min_confidence {
        query = query.filter(Filter::gte("confidence_score", min));
    }
    if let Some(max) = filter.max_confidence {
        query = query.filter(Filter::lte("confidence_score", max));
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.trim().is_empty()) {
        query = query.filter(Filter::text("display_name", search.trim()));
    }
    query
}

#[cfg(test)]
mod tests {
    use forage_store::{MemoryCache, MemoryStore};

    use super::*;
    use crate::testing::{confidence, new_dish, new_venue, MockCatalog};

    fn staging() -> StagingStore {
        StagingStore::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryCache::default()),
            StagingConfig::default(),
        )
    }

    #[tokio::test]
    async fn duplicate_submission_merges_into_open_record() {
        let s = staging();
        let first = s
            .stage(new_venue("Burger Palace", Some("p1"), "ext-1"), confidence(50))
            .await
            .unwrap();
        let second = s
            .stage(new_venue("Burger Palace Downtown", Some("p1"), "ext-1"), confidence(70))
            .await
            .unwrap();

        assert!(!first.merged);
        assert!(second.merged);
        assert_eq!(second.entity.id, first.entity.id);
        assert_eq!(second.entity.submission_count, 2);
        assert_eq!(second.entity.display_name, "Burger Palace Downtown");
        assert_eq!(second.entity.confidence_score, 70);
        assert_eq!(s.venues.count(&[]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn different_partners_do_not_collide() {
        let s = staging();
        let a = s.stage(new_venue("A", Some("p1"), "x"), confidence(50)).await.unwrap();
        let b = s.stage(new_venue("A", Some("p2"), "x"), confidence(50)).await.unwrap();
        assert_ne!(a.entity.id, b.entity.id);
    }

    #[tokio::test]
    async fn decided_record_releases_its_key() {
        let s = staging();
        let first = s.stage(new_venue("A", Some("p1"), "x"), confidence(50)).await.unwrap();
        s.reject(EntityType::Venue, &first.entity.id, "alice", None)
            .await
            .unwrap();

        let second = s.stage(new_venue("A", Some("p1"), "x"), confidence(50)).await.unwrap();
        assert!(!second.merged);
        assert_ne!(second.entity.id, first.entity.id);
        let third = s.stage(new_venue("A", Some("p1"), "x"), confidence(60)).await.unwrap();
        assert!(third.merged);
        assert_eq!(third.entity.id, second.entity.id);
    }

    #[tokio::test]
    async fn concurrent_duplicates_leave_one_live_record() {
        let s = staging();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let s = s.clone();
            handles.push(tokio::spawn(async move {
                s.stage(new_venue("A", Some("p1"), "x"), confidence(50)).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        let all = s.venues.all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].submission_count, 10);
    }

    #[tokio::test]
    async fn auto_route_follows_thresholds() {
        let s = staging();
        let policy = s.default_policy();

        let high = s
            .submit(new_venue("High", None, "h"), confidence(90), policy)
            .await
            .unwrap();
        assert_eq!(high.entity.status, StagingStatus::Approved);
        assert_eq!(high.entity.review.unwrap().reviewer, SYSTEM_REVIEWER);

        let low = s
            .submit(new_venue("Low", None, "l"), confidence(20), policy)
            .await
            .unwrap();
        assert_eq!(low.entity.status, StagingStatus::Rejected);

        let middle = s
            .submit(new_venue("Mid", None, "m"), confidence(60), policy)
            .await
            .unwrap();
        assert_eq!(middle.entity.status, StagingStatus::NeedsReview);
        assert!(middle.entity.review.is_none());

        let mut flagged = new_venue("Flagged", None, "f");
        flagged.flags.push("possible_duplicate".into());
        let flagged = s.submit(flagged, confidence(95), policy).await.unwrap();
        assert_eq!(flagged.entity.status, StagingStatus::NeedsReview);

        let manual = RoutePolicy {
            manual_review: true,
            ..policy
        };
        let held = s
            .submit(new_venue("Manual", None, "n"), confidence(95), manual)
            .await
            .unwrap();
        assert_eq!(held.entity.status, StagingStatus::NeedsReview);
    }

    #[tokio::test]
    async fn flag_reopens_approved_and_ignores_promoted() {
        let s = staging();
        let v = s.stage(new_venue("A", None, "a"), confidence(50)).await.unwrap().entity;
        s.approve(EntityType::Venue, &v.id, "alice", None).await.unwrap();

        let flagged = s.add_flag(EntityType::Venue, &v.id, "wrong_address").await.unwrap();
        assert_eq!(flagged.status, StagingStatus::NeedsReview);
        assert_eq!(flagged.flags, vec!["wrong_address"]);

        // Reopened record holds its key again.
        let merged = s.stage(new_venue("A", None, "a"), confidence(55)).await.unwrap();
        assert!(merged.merged);
        assert_eq!(merged.entity.id, v.id);

        s.approve(EntityType::Venue, &v.id, "alice", None).await.unwrap();
        let promoted = s
            .promote(EntityType::Venue, &v.id, &MockCatalog::default())
            .await
            .unwrap();
        assert_eq!(promoted.status, StagingStatus::Promoted);
        assert!(promoted.production_id.is_some());

        let after = s.add_flag(EntityType::Venue, &v.id, "late").await.unwrap();
        assert_eq!(after.status, StagingStatus::Promoted);
        assert_eq!(after.flags, vec!["wrong_address"]);
        assert!(matches!(
            s.reject(EntityType::Venue, &v.id, "alice", None).await,
            Err(ForageError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn reopened_record_feeds_learning_once() {
        use forage_common::config::WebhookConfig;
        use forage_common::{Strategy, StrategyKind};
        use serde_json::json;

        use crate::feedback::FeedbackRecorder;
        use crate::partner::PartnerAccounts;
        use crate::strategy::StrategyRegistry;

        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let strategies = StrategyRegistry::new(store.clone());
        let (hooks, _handle) = LearningHooks::spawn(
            strategies.clone(),
            FeedbackRecorder::new(store.clone()),
            PartnerAccounts::new(store.clone(), WebhookConfig::default()),
        );
        let s = StagingStore::new(store, Arc::new(MemoryCache::default()), StagingConfig::default())
            .with_learning(hooks.clone());
        let strategy = strategies
            .seed(Strategy::seed(
                StrategyKind::Discovery,
                "yelp",
                None,
                "base",
                json!({}),
                vec![],
            ))
            .await
            .unwrap();

        let mut new = new_venue("A", None, "a");
        new.strategy_id = Some(strategy.id.clone());
        let v = s.stage(new, confidence(50)).await.unwrap().entity;
        s.approve(EntityType::Venue, &v.id, "alice", None).await.unwrap();
        s.add_flag(EntityType::Venue, &v.id, "recheck").await.unwrap();
        let again = s.approve(EntityType::Venue, &v.id, "bob", None).await.unwrap();
        assert!(again.learning_recorded);
        hooks.flush().await;

        let strategy = strategies.get(&strategy.id).await.unwrap();
        assert_eq!(strategy.total_uses, 1);
        assert_eq!(strategy.successful_uses, 1);
        assert_eq!(hooks.stats().queued, 1);
    }

    #[tokio::test]
    async fn promote_requires_approval() {
        let s = staging();
        let v = s.stage(new_venue("A", None, "a"), confidence(50)).await.unwrap().entity;
        let catalog = MockCatalog::default();
        assert!(matches!(
            s.promote(EntityType::Venue, &v.id, &catalog).await,
            Err(ForageError::InvalidTransition { .. })
        ));
        assert!(catalog.published().is_empty());
    }

    #[tokio::test]
    async fn bulk_approve_reports_missing_ids() {
        let s = staging();
        let v1 = s.stage(new_venue("One", None, "1"), confidence(50)).await.unwrap().entity;
        let v3 = s.stage(new_venue("Three", None, "3"), confidence(50)).await.unwrap().entity;
        let ids = vec![v1.id.clone(), "v2-missing".to_string(), v3.id.clone()];

        let result = s
            .bulk_approve(EntityType::Venue, &ids, "alice", None)
            .await
            .unwrap();
        assert_eq!(result.successful, 2);
        assert_eq!(result.not_found, 1);
        assert_eq!(result.failed, 0);
        assert_eq!(result.items[1].status, BulkItemStatus::NotFound);

        // Second pass: both already approved.
        let again = s
            .bulk_approve(EntityType::Venue, &ids, "alice", None)
            .await
            .unwrap();
        assert_eq!(again.failed, 2);
    }

    #[tokio::test]
    async fn bulk_is_capped() {
        let s = staging();
        let ids: Vec<String> = (0..101).map(|i| i.to_string()).collect();
        assert!(matches!(
            s.bulk_reject(EntityType::Dish, &ids, "alice", None).await,
            Err(ForageError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn partial_approve_rejects_unselected_dishes() {
        let s = staging();
        let v = s.stage(new_venue("A", None, "a"), confidence(50)).await.unwrap().entity;
        let d1 = s.stage(new_dish("Fries", &v.id, "d1"), confidence(50)).await.unwrap().entity;
        let d2 = s.stage(new_dish("Shake", &v.id, "d2"), confidence(50)).await.unwrap().entity;

        let result = s
            .partial_approve(&v.id, &[d1.id.clone()], "alice", None)
            .await
            .unwrap();
        assert_eq!(result.venue.status, StagingStatus::Approved);
        assert_eq!(result.approved.len(), 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(
            s.get(EntityType::Dish, &d2.id).await.unwrap().status,
            StagingStatus::Rejected
        );
    }

    #[tokio::test]
    async fn partial_approve_reports_failed_dishes_and_continues() {
        let s = staging();
        let v = s.stage(new_venue("A", None, "a"), confidence(50)).await.unwrap().entity;
        let done = s.stage(new_dish("Fries", &v.id, "d1"), confidence(50)).await.unwrap().entity;
        let open = s.stage(new_dish("Shake", &v.id, "d2"), confidence(50)).await.unwrap().entity;
        let spare = s.stage(new_dish("Pie", &v.id, "d3"), confidence(50)).await.unwrap().entity;
        s.reject(EntityType::Dish, &done.id, "alice", None).await.unwrap();

        let result = s
            .partial_approve(&v.id, &[done.id.clone(), open.id.clone()], "alice", None)
            .await
            .unwrap();

        assert_eq!(result.venue.status, StagingStatus::Approved);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].id, done.id);
        assert_eq!(result.failed[0].status, BulkItemStatus::Failed);
        assert_eq!(result.approved.len(), 1);
        assert_eq!(result.approved[0].id, open.id);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(result.rejected[0].id, spare.id);
        assert_eq!(
            s.get(EntityType::Dish, &done.id).await.unwrap().status,
            StagingStatus::Rejected
        );
    }

    #[tokio::test]
    async fn partial_approve_refuses_unlinked_dish() {
        let s = staging();
        let v = s.stage(new_venue("A", None, "a"), confidence(50)).await.unwrap().entity;
        let other = s.stage(new_venue("B", None, "b"), confidence(50)).await.unwrap().entity;
        let d = s.stage(new_dish("Fries", &other.id, "d"), confidence(50)).await.unwrap().entity;

        assert!(matches!(
            s.partial_approve(&v.id, &[d.id], "alice", None).await,
            Err(ForageError::Validation(_))
        ));
        assert_eq!(
            s.get(EntityType::Venue, &v.id).await.unwrap().status,
            StagingStatus::Pending
        );
    }

    #[tokio::test]
    async fn review_queue_filters_and_sees_fresh_writes() {
        let s = staging();
        s.stage(new_venue("Burger Palace", None, "1"), confidence(40)).await.unwrap();
        s.stage(new_venue("Taco Town", None, "2"), confidence(80)).await.unwrap();

        let filter = ReviewQueueFilter {
            min_confidence: Some(50),
            ..ReviewQueueFilter::default()
        };
        let page = s.review_queue(&filter).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].display_name, "Taco Town");

        // A write after the cached read must show up.
        s.stage(new_venue("Pizza Port", None, "3"), confidence(90)).await.unwrap();
        let page = s.review_queue(&filter).await.unwrap();
        assert_eq!(page.total, 2);

        let search = ReviewQueueFilter {
            search: Some("burger".into()),
            ..ReviewQueueFilter::default()
        };
        assert_eq!(s.review_queue(&search).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn assign_chain_sets_venue_chain() {
        let s = staging();
        let v = s.stage(new_venue("A", None, "a"), confidence(50)).await.unwrap().entity;
        let result = s
            .assign_chain(&[v.id.clone(), "missing".into()], "chain-1")
            .await
            .unwrap();
        assert_eq!(result.successful, 1);
        assert_eq!(result.not_found, 1);
        let v = s.get(EntityType::Venue, &v.id).await.unwrap();
        assert_eq!(v.chain_id(), Some("chain-1"));
    }
}
