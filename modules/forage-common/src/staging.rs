use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::confidence::{ConfidenceResult, FactorScore};
use crate::error::{ForageError, Result};

/// Reviewer recorded on decisions made by auto-routing.
pub const SYSTEM_REVIEWER: &str = "system:auto";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Venue,
    Dish,
    Promotion,
    Availability,
}

impl EntityType {
    pub const ALL: [EntityType; 4] = [Self::Venue, Self::Dish, Self::Promotion, Self::Availability];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Venue => "venue",
            Self::Dish => "dish",
            Self::Promotion => "promotion",
            Self::Availability => "availability",
        }
    }

    pub fn collection(&self) -> &'static str {
        match self {
            Self::Venue => "staged_venues",
            Self::Dish => "staged_dishes",
            Self::Promotion => "staged_promotions",
            Self::Availability => "staged_availability",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = ForageError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "venue" | "venues" => Ok(Self::Venue),
            "dish" | "dishes" => Ok(Self::Dish),
            "promotion" | "promotions" => Ok(Self::Promotion),
            "availability" => Ok(Self::Availability),
            other => Err(ForageError::Validation(format!("unknown entity type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingStatus {
    Pending,
    Validating,
    NeedsReview,
    Approved,
    Rejected,
    Promoted,
}

impl StagingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Validating => "validating",
            Self::NeedsReview => "needs_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Promoted => "promoted",
        }
    }

    /// Open records hold their dedup key; resubmissions merge into them.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::Validating | Self::NeedsReview)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Promoted)
    }

    pub fn can_transition_to(&self, next: StagingStatus) -> bool {
        use StagingStatus::*;
        matches!(
            (self, next),
            (Pending, Validating | NeedsReview | Approved | Rejected)
                | (Validating, Pending | NeedsReview | Approved | Rejected)
                | (NeedsReview, Validating | Approved | Rejected)
                | (Approved, NeedsReview | Promoted)
                | (Rejected, NeedsReview)
        )
    }
}

impl fmt::Display for StagingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StagingStatus {
    type Err = ForageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "validating" => Ok(Self::Validating),
            "needs_review" => Ok(Self::NeedsReview),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "promoted" => Ok(Self::Promoted),
            other => Err(ForageError::Validation(format!("unknown staging status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
}

impl ReviewDecision {
    pub fn status(&self) -> StagingStatus {
        match self {
            Self::Approved => StagingStatus::Approved,
            Self::Rejected => StagingStatus::Rejected,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub reviewer: String,
    pub decision: ReviewDecision,
    pub notes: Option<String>,
    pub decided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Price {
    pub amount: f64,
    pub currency: String,
}

impl Price {
    fn validate(&self) -> Result<()> {
        if !self.amount.is_finite() || self.amount < 0.0 {
            return Err(ForageError::Validation(format!(
                "price must be a non-negative amount, got {}",
                self.amount
            )));
        }
        if self.currency.trim().is_empty() {
            return Err(ForageError::Validation("price currency is required".into()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenuePayload {
    pub name: String,
    pub address: String,
    pub city: String,
    pub country: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub chain_id: Option<String>,
    pub platform: Option<String>,
    pub source_url: Option<String>,
    pub website: Option<String>,
    pub phone: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DishPayload {
    pub name: String,
    pub description: Option<String>,
    pub price: Option<Price>,
    pub product_sku: Option<String>,
    pub platform: Option<String>,
    pub source_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromotionPayload {
    pub title: String,
    pub description: Option<String>,
    pub product_sku: Option<String>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub discount_text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailabilityPayload {
    pub product_sku: String,
    pub available: bool,
    pub price: Option<Price>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity_type", rename_all = "snake_case")]
pub enum StagedPayload {
    Venue(VenuePayload),
    Dish(DishPayload),
    Promotion(PromotionPayload),
    Availability(AvailabilityPayload),
}

impl StagedPayload {
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Venue(_) => EntityType::Venue,
            Self::Dish(_) => EntityType::Dish,
            Self::Promotion(_) => EntityType::Promotion,
            Self::Availability(_) => EntityType::Availability,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Venue(v) => {
                require("venue name", &v.name)?;
                if let Some(lat) = v.latitude {
                    if !(-90.0..=90.0).contains(&lat) {
                        return Err(ForageError::Validation(format!(
                            "latitude {lat} outside [-90, 90]"
                        )));
                    }
                }
                if let Some(lng) = v.longitude {
                    if !(-180.0..=180.0).contains(&lng) {
                        return Err(ForageError::Validation(format!(
                            "longitude {lng} outside [-180, 180]"
                        )));
                    }
                }
            }
            Self::Dish(d) => {
                require("dish name", &d.name)?;
                if let Some(price) = &d.price {
                    price.validate()?;
                }
                if let Some(sku) = &d.product_sku {
                    require("product sku", sku)?;
                }
            }
            Self::Promotion(p) => {
                require("promotion title", &p.title)?;
                if let (Some(start), Some(end)) = (p.starts_at, p.ends_at) {
                    if end < start {
                        return Err(ForageError::Validation(
                            "promotion ends before it starts".into(),
                        ));
                    }
                }
            }
            Self::Availability(a) => {
                require("product sku", &a.product_sku)?;
                if let Some(price) = &a.price {
                    price.validate()?;
                }
            }
        }
        Ok(())
    }

    pub fn display_name(&self) -> String {
        match self {
            Self::Venue(v) => v.name.clone(),
            Self::Dish(d) => d.name.clone(),
            Self::Promotion(p) => p.title.clone(),
            Self::Availability(a) => a.product_sku.clone(),
        }
    }

    pub fn country(&self) -> Option<String> {
        match self {
            Self::Venue(v) => Some(v.country.clone()).filter(|c| !c.trim().is_empty()),
            _ => None,
        }
    }

    pub fn chain_id(&self) -> Option<&str> {
        match self {
            Self::Venue(v) => v.chain_id.as_deref(),
            _ => None,
        }
    }
}

fn require(what: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ForageError::Validation(format!("{what} must not be blank")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A submission before it has been staged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStagedEntity {
    pub payload: StagedPayload,
    pub partner_id: Option<String>,
    pub external_id: Option<String>,
    pub batch_id: Option<String>,
    pub staged_venue_id: Option<String>,
    pub production_venue_id: Option<String>,
    pub discovery_run_id: Option<String>,
    pub strategy_id: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

impl NewStagedEntity {
    pub fn new(payload: StagedPayload) -> Self {
        Self {
            payload,
            partner_id: None,
            external_id: None,
            batch_id: None,
            staged_venue_id: None,
            production_venue_id: None,
            discovery_run_id: None,
            strategy_id: None,
            flags: Vec::new(),
        }
    }

    pub fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    pub fn validate(&self) -> Result<()> {
        self.payload.validate()?;
        if matches!(self.payload, StagedPayload::Availability(_))
            && self
                .production_venue_id
                .as_deref()
                .is_none_or(|id| id.trim().is_empty())
        {
            return Err(ForageError::Validation(
                "availability requires production_venue_id".into(),
            ));
        }
        Ok(())
    }

    /// Logical identity used to merge resubmissions. None when the producer gave
    /// nothing stable to key on.
    pub fn dedup_key(&self) -> Option<String> {
        if let StagedPayload::Availability(a) = &self.payload {
            let venue = self.production_venue_id.as_deref()?;
            return Some(format!("availability:{venue}:{}", a.product_sku));
        }
        let external_id = self.external_id.as_deref().filter(|s| !s.trim().is_empty())?;
        let producer = self.partner_id.as_deref().unwrap_or("scraper");
        Some(format!("{}:{producer}:{external_id}", self.entity_type()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedEntity {
    #[serde(default)]
    pub id: String,
    pub status: StagingStatus,
    pub payload: StagedPayload,
    pub batch_id: Option<String>,
    pub partner_id: Option<String>,
    pub external_id: Option<String>,
    pub confidence_score: u8,
    #[serde(default)]
    pub confidence_breakdown: Vec<FactorScore>,
    /// Ordered, no repeats, never shrinks.
    #[serde(default)]
    pub flags: Vec<String>,
    pub staged_venue_id: Option<String>,
    pub production_venue_id: Option<String>,
    pub discovery_run_id: Option<String>,
    pub strategy_id: Option<String>,
    pub submission_count: u32,
    pub dedup_key: Option<String>,
    pub review: Option<Review>,
    /// Set by the first decision. Later decisions of a reopened record do not
    /// feed learning again.
    #[serde(default)]
    pub learning_recorded: bool,
    pub production_id: Option<String>,
    /// Denormalised for review-queue filters.
    pub display_name: String,
    pub country: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagedEntity {
    pub fn from_new(new: NewStagedEntity, confidence: ConfidenceResult) -> Self {
        let now = Utc::now();
        let dedup_key = new.dedup_key();
        let mut entity = Self {
            id: String::new(),
            status: StagingStatus::Pending,
            display_name: new.payload.display_name(),
            country: new.payload.country(),
            payload: new.payload,
            batch_id: new.batch_id,
            partner_id: new.partner_id,
            external_id: new.external_id,
            confidence_score: confidence.score,
            confidence_breakdown: confidence.breakdown,
            flags: Vec::new(),
            staged_venue_id: new.staged_venue_id,
            production_venue_id: new.production_venue_id,
            discovery_run_id: new.discovery_run_id,
            strategy_id: new.strategy_id,
            submission_count: 1,
            dedup_key,
            review: None,
            learning_recorded: false,
            production_id: None,
            created_at: now,
            updated_at: now,
        };
        for flag in new.flags {
            entity.push_flag(flag);
        }
        if !entity.flags.is_empty() {
            entity.status = StagingStatus::NeedsReview;
        }
        entity
    }

    pub fn entity_type(&self) -> EntityType {
        self.payload.entity_type()
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    pub fn transition(&mut self, to: StagingStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(ForageError::invalid_transition(self.status, to));
        }
        self.status = to;
        Ok(())
    }

    /// Returns true if the flag was new. Any flag sends a non-promoted record
    /// back to review.
    pub fn add_flag(&mut self, flag: impl Into<String>) -> bool {
        if self.status == StagingStatus::Promoted {
            return false;
        }
        let added = self.push_flag(flag.into());
        self.status = StagingStatus::NeedsReview;
        added
    }

    fn push_flag(&mut self, flag: String) -> bool {
        let flag = flag.trim().to_string();
        if flag.is_empty() || self.flags.contains(&flag) {
            return false;
        }
        self.flags.push(flag);
        true
    }

    pub fn decide(
        &mut self,
        decision: ReviewDecision,
        reviewer: impl Into<String>,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.transition(decision.status())?;
        self.review = Some(Review {
            reviewer: reviewer.into(),
            decision,
            notes,
            decided_at: now,
        });
        Ok(())
    }

    /// True exactly once per record, on the first call after a decision.
    pub fn claim_learning(&mut self) -> bool {
        if self.review.is_none() || self.learning_recorded {
            return false;
        }
        self.learning_recorded = true;
        true
    }

    pub fn mark_promoted(&mut self, production_id: &str) -> Result<()> {
        if production_id.trim().is_empty() {
            return Err(ForageError::Validation("production id must not be blank".into()));
        }
        self.transition(StagingStatus::Promoted)?;
        self.production_id = Some(production_id.to_string());
        Ok(())
    }

    pub fn set_confidence(&mut self, confidence: ConfidenceResult) {
        self.confidence_score = confidence.score;
        self.confidence_breakdown = confidence.breakdown;
    }

    /// Fold a duplicate submission into this open record.
    pub fn merge_resubmission(&mut self, new: NewStagedEntity, confidence: ConfidenceResult) {
        self.display_name = new.payload.display_name();
        self.country = new.payload.country();
        self.payload = new.payload;
        self.set_confidence(confidence);
        if new.batch_id.is_some() {
            self.batch_id = new.batch_id;
        }
        if new.discovery_run_id.is_some() {
            self.discovery_run_id = new.discovery_run_id;
        }
        if new.strategy_id.is_some() {
            self.strategy_id = new.strategy_id;
        }
        let flagged = !new.flags.is_empty();
        for flag in new.flags {
            self.push_flag(flag);
        }
        if flagged {
            self.status = StagingStatus::NeedsReview;
        }
        self.submission_count = self.submission_count.saturating_add(1);
    }

    pub fn chain_id(&self) -> Option<&str> {
        self.payload.chain_id()
    }
}

/// Reference to one staged record across the four collections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StagedRef {
    pub entity_type: EntityType,
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue() -> StagedPayload {
        StagedPayload::Venue(VenuePayload {
            name: "Burger Palace".into(),
            address: "1 Main St".into(),
            city: "Austin".into(),
            country: "US".into(),
            latitude: Some(30.27),
            longitude: Some(-97.74),
            chain_id: None,
            platform: Some("google_maps".into()),
            source_url: None,
            website: None,
            phone: None,
        })
    }

    fn staged() -> StagedEntity {
        let mut new = NewStagedEntity::new(venue());
        new.partner_id = Some("p1".into());
        new.external_id = Some("ext-1".into());
        StagedEntity::from_new(
            new,
            ConfidenceResult {
                score: 70,
                breakdown: vec![],
            },
        )
    }

    #[test]
    fn payload_is_tagged_by_entity_type() {
        let json = serde_json::to_value(venue()).unwrap();
        assert_eq!(json["entity_type"], "venue");
        let back: StagedPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.entity_type(), EntityType::Venue);
    }

    #[test]
    fn invalid_payloads_are_rejected() {
        let StagedPayload::Venue(mut v) = venue() else {
            unreachable!()
        };
        v.latitude = Some(91.0);
        assert!(StagedPayload::Venue(v).validate().is_err());

        let dish = StagedPayload::Dish(DishPayload {
            name: "Fries".into(),
            description: None,
            price: Some(Price {
                amount: -1.0,
                currency: "USD".into(),
            }),
            product_sku: None,
            platform: None,
            source_url: None,
        });
        assert!(dish.validate().is_err());

        let now = Utc::now();
        let promo = StagedPayload::Promotion(PromotionPayload {
            title: "2 for 1".into(),
            description: None,
            product_sku: None,
            starts_at: Some(now),
            ends_at: Some(now - chrono::Duration::days(1)),
            discount_text: None,
        });
        assert!(promo.validate().is_err());

        let availability = NewStagedEntity::new(StagedPayload::Availability(AvailabilityPayload {
            product_sku: "SKU-1".into(),
            available: true,
            price: None,
            observed_at: now,
        }));
        assert!(availability.validate().is_err());
    }

    #[test]
    fn dedup_keys_use_producer_identity() {
        let mut new = NewStagedEntity::new(venue());
        assert_eq!(new.dedup_key(), None);
        new.partner_id = Some("p1".into());
        new.external_id = Some("ext-1".into());
        assert_eq!(new.dedup_key().as_deref(), Some("venue:p1:ext-1"));

        let mut availability = NewStagedEntity::new(StagedPayload::Availability(AvailabilityPayload {
            product_sku: "SKU-1".into(),
            available: true,
            price: None,
            observed_at: Utc::now(),
        }));
        availability.production_venue_id = Some("pv-9".into());
        assert_eq!(
            availability.dedup_key().as_deref(),
            Some("availability:pv-9:SKU-1")
        );
    }

    #[test]
    fn promoted_is_terminal() {
        for next in [
            StagingStatus::Pending,
            StagingStatus::Validating,
            StagingStatus::NeedsReview,
            StagingStatus::Approved,
            StagingStatus::Rejected,
        ] {
            assert!(!StagingStatus::Promoted.can_transition_to(next));
        }
    }

    #[test]
    fn promotion_requires_approval() {
        let mut e = staged();
        assert!(matches!(
            e.mark_promoted("prod-1"),
            Err(ForageError::InvalidTransition { .. })
        ));
        e.decide(ReviewDecision::Approved, "alice", None, Utc::now()).unwrap();
        assert!(e.mark_promoted("").is_err());
        e.mark_promoted("prod-1").unwrap();
        assert_eq!(e.status, StagingStatus::Promoted);
        assert_eq!(e.production_id.as_deref(), Some("prod-1"));
    }

    #[test]
    fn flag_reopens_approved_but_not_promoted() {
        let mut e = staged();
        e.decide(ReviewDecision::Approved, "alice", None, Utc::now()).unwrap();
        assert!(e.add_flag("address_mismatch"));
        assert_eq!(e.status, StagingStatus::NeedsReview);
        assert!(!e.add_flag("address_mismatch"));
        assert_eq!(e.flags, vec!["address_mismatch"]);

        e.decide(ReviewDecision::Approved, "alice", None, Utc::now()).unwrap();
        e.mark_promoted("prod-1").unwrap();
        assert!(!e.add_flag("late"));
        assert_eq!(e.status, StagingStatus::Promoted);
        assert_eq!(e.flags.len(), 1);
    }

    #[test]
    fn resubmission_unions_flags_and_counts() {
        let mut e = staged();
        e.add_flag("a");
        let mut again = NewStagedEntity::new(venue());
        again.flags = vec!["b".into(), "a".into()];
        e.merge_resubmission(
            again,
            ConfidenceResult {
                score: 91,
                breakdown: vec![],
            },
        );
        assert_eq!(e.flags, vec!["a", "b"]);
        assert_eq!(e.submission_count, 2);
        assert_eq!(e.confidence_score, 91);
    }

    #[test]
    fn flags_at_intake_send_the_record_to_review() {
        let mut new = NewStagedEntity::new(venue());
        new.flags = vec!["price_outlier".into()];
        let e = StagedEntity::from_new(
            new,
            ConfidenceResult {
                score: 95,
                breakdown: vec![],
            },
        );
        assert_eq!(e.status, StagingStatus::NeedsReview);

        let mut e = staged();
        assert_eq!(e.status, StagingStatus::Pending);
        let mut again = NewStagedEntity::new(venue());
        again.flags = vec!["possible_duplicate".into()];
        e.merge_resubmission(
            again,
            ConfidenceResult {
                score: 70,
                breakdown: vec![],
            },
        );
        assert_eq!(e.status, StagingStatus::NeedsReview);
        assert_eq!(e.flags, vec!["possible_duplicate"]);
    }

    #[test]
    fn learning_is_claimed_once_per_record() {
        let mut e = staged();
        assert!(!e.claim_learning());
        e.decide(ReviewDecision::Approved, "alice", None, Utc::now()).unwrap();
        assert!(e.claim_learning());
        e.add_flag("recheck");
        e.decide(ReviewDecision::Approved, "alice", None, Utc::now()).unwrap();
        assert!(!e.claim_learning());
    }

    #[test]
    fn entity_type_parses_plural_path_segments() {
        assert_eq!("venues".parse::<EntityType>().unwrap(), EntityType::Venue);
        assert_eq!("Dish".parse::<EntityType>().unwrap(), EntityType::Dish);
        assert!("menus".parse::<EntityType>().is_err());
    }
}
