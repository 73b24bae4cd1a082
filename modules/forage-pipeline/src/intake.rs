//! Partner webhook intake.
//!
//! Authenticate (API key, then signed timestamp), count the request against the
//! partner's per-minute rate, parse the batch, charge it to the partner's daily
//! allowance, then score, stage and auto-route each item.
//! Item-level problems are reported per item and never fail the batch.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use forage_common::confidence::{
    self, completeness_factor, geocoding_factor, name_match_factor, partner_quality_factor,
    GeocodePrecision,
};
use forage_common::{
    EntityType, Factor, ForageError, NewStagedEntity, Partner, Result, StagedPayload,
    StagingStatus,
};

use crate::partner::PartnerAccounts;
use crate::staging::{RoutePolicy, StagingStore};

const PARTNER_QUALITY_WEIGHT: f64 = 0.35;
const COMPLETENESS_WEIGHT: f64 = 0.25;
const GEOCODING_WEIGHT: f64 = 0.25;
const NAME_MATCH_WEIGHT: f64 = 0.15;

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookBatch {
    pub batch_id: Option<String>,
    pub items: Vec<Value>,
}

/// Observations the partner attaches to an item, used as scoring inputs.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ItemSignals {
    pub geocode_precision: Option<GeocodePrecision>,
    /// Name the partner matched this record against, if any.
    pub matched_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct WebhookItem {
    external_id: String,
    payload: StagedPayload,
    staged_venue_id: Option<String>,
    production_venue_id: Option<String>,
    #[serde(default)]
    signals: ItemSignals,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntakeItemResult {
    pub index: usize,
    pub external_id: Option<String>,
    pub accepted: bool,
    pub entity_type: Option<EntityType>,
    pub staged_id: Option<String>,
    pub status: Option<StagingStatus>,
    pub merged: bool,
    pub confidence: Option<u8>,
    pub error: Option<String>,
}

impl IntakeItemResult {
    fn refused(index: usize, external_id: Option<String>, error: impl Into<String>) -> Self {
        Self {
            index,
            external_id,
            accepted: false,
            entity_type: None,
            staged_id: None,
            status: None,
            merged: false,
            confidence: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IntakeResponse {
    pub partner_id: String,
    pub batch_id: Option<String>,
    pub accepted: usize,
    pub rejected: usize,
    pub items: Vec<IntakeItemResult>,
}

#[derive(Clone)]
pub struct PartnerIntake {
    partners: PartnerAccounts,
    staging: StagingStore,
}

impl PartnerIntake {
    pub fn new(partners: PartnerAccounts, staging: StagingStore) -> Self {
        Self { partners, staging }
    }

    pub async fn process(
        &self,
        api_key: &str,
        signature: &str,
        timestamp: &str,
        raw_body: &[u8],
    ) -> Result<IntakeResponse> {
        let partner = self.partners.get_by_api_key(api_key).await?;
        if !partner.is_active() {
            return Err(ForageError::Signature(format!(
                "partner {} is {}",
                partner.id, partner.status
            )));
        }
        self.partners
            .verify_webhook_signature(&partner.id, raw_body, signature, timestamp)
            .await?;
        self.partners.check_request_rate(&partner).await?;

        let batch: WebhookBatch = serde_json::from_slice(raw_body)
            .map_err(|e| ForageError::Validation(format!("malformed webhook body: {e}")))?;
        if batch.items.is_empty() {
            return Err(ForageError::Validation("webhook batch has no items".into()));
        }
        self.partners
            .record_intake(&partner.id, batch.items.len() as u64)
            .await?;

        let policy = RoutePolicy::for_partner(&partner.config, self.staging.config());
        let mut items = Vec::with_capacity(batch.items.len());
        for (index, raw) in batch.items.into_iter().enumerate() {
            items.push(
                self.process_item(&partner, batch.batch_id.as_deref(), index, raw, policy)
                    .await,
            );
        }

        let accepted = items.iter().filter(|i| i.accepted).count();
        let response = IntakeResponse {
            partner_id: partner.id.clone(),
            batch_id: batch.batch_id,
            accepted,
            rejected: items.len() - accepted,
            items,
        };
        info!(
            partner_id = %response.partner_id,
            batch_id = ?response.batch_id,
            accepted = response.accepted,
            rejected = response.rejected,
            "Processed partner webhook"
        );
        Ok(response)
    }

    async fn process_item(
        &self,
        partner: &Partner,
        batch_id: Option<&str>,
        index: usize,
        raw: Value,
        policy: RoutePolicy,
    ) -> IntakeItemResult {
        let external_id = raw
            .get("external_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        let item: WebhookItem = match serde_json::from_value(raw) {
            Ok(item) => item,
            Err(e) => return IntakeItemResult::refused(index, external_id, format!("malformed item: {e}")),
        };

        let entity_type = item.payload.entity_type();
        if !partner.accepts(entity_type) {
            return IntakeItemResult::refused(
                index,
                external_id,
                format!("partner may not submit {entity_type} records"),
            );
        }
        if let Some(country) = item.payload.country() {
            let markets = &partner.config.markets;
            if !markets.is_empty() && !markets.iter().any(|m| m.eq_ignore_ascii_case(&country)) {
                return IntakeItemResult::refused(
                    index,
                    external_id,
                    format!("market {country} is not enabled for this partner"),
                );
            }
        }

        let factors = item_factors(partner, &item);
        let mut entity = NewStagedEntity::new(item.payload);
        entity.partner_id = Some(partner.id.clone());
        entity.external_id = Some(item.external_id);
        entity.batch_id = batch_id.map(str::to_string);
        entity.staged_venue_id = item.staged_venue_id;
        entity.production_venue_id = item.production_venue_id;

        match self
            .staging
            .submit(entity, confidence::score(&factors), policy)
            .await
        {
            Ok(outcome) => IntakeItemResult {
                index,
                external_id,
                accepted: outcome.entity.status != StagingStatus::Rejected,
                entity_type: Some(entity_type),
                staged_id: Some(outcome.entity.id.clone()),
                status: Some(outcome.entity.status),
                merged: outcome.merged,
                confidence: Some(outcome.entity.confidence_score),
                error: None,
            },
            Err(e) => {
                warn!(partner_id = %partner.id, index, error = %e, "Webhook item not staged");
                IntakeItemResult {
                    entity_type: Some(entity_type),
                    ..IntakeItemResult::refused(index, external_id, e.to_string())
                }
            }
        }
    }
}

fn item_factors(partner: &Partner, item: &WebhookItem) -> Vec<Factor> {
    let (present, expected) = completeness(&item.payload);
    let geocode = match &item.payload {
        StagedPayload::Venue(_) => Some(geocoding_factor(
            item.signals.geocode_precision,
            GEOCODING_WEIGHT,
        )),
        _ => None,
    };
    let mut factors = vec![
        partner_quality_factor(partner.quality_metrics.quality_signal(), PARTNER_QUALITY_WEIGHT),
        completeness_factor(present, expected, COMPLETENESS_WEIGHT),
        name_match_factor(
            &item.payload.display_name(),
            item.signals.matched_name.as_deref(),
            NAME_MATCH_WEIGHT,
        ),
    ];
    factors.extend(geocode);
    factors
}

/// Optional fields filled in, out of those the payload type has.
fn completeness(payload: &StagedPayload) -> (usize, usize) {
    let filled = |fields: &[bool]| (fields.iter().filter(|f| **f).count(), fields.len());
    match payload {
        StagedPayload::Venue(v) => filled(&[
            !v.address.trim().is_empty(),
            !v.city.trim().is_empty(),
            !v.country.trim().is_empty(),
            v.latitude.is_some() && v.longitude.is_some(),
            v.website.is_some(),
            v.phone.is_some(),
        ]),
        StagedPayload::Dish(d) => filled(&[
            d.description.is_some(),
            d.price.is_some(),
            d.product_sku.is_some(),
            d.source_url.is_some(),
        ]),
        StagedPayload::Promotion(p) => filled(&[
            p.description.is_some(),
            p.product_sku.is_some(),
            p.starts_at.is_some(),
            p.ends_at.is_some(),
            p.discount_text.is_some(),
        ]),
        StagedPayload::Availability(a) => filled(&[a.price.is_some()]),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use forage_common::config::{StagingConfig, WebhookConfig};
    use forage_common::{IssuedCredentials, PartnerConfig, RateLimits, RequestWindow};
    use forage_store::{DocumentStore, MemoryCache, MemoryStore};
    use serde_json::json;

    use super::*;
    use crate::partner::sign_webhook;

    struct Fixture {
        intake: PartnerIntake,
        partners: PartnerAccounts,
        partner: Partner,
        creds: IssuedCredentials,
    }

    async fn fixture(config: PartnerConfig) -> Fixture {
        let store: Arc<dyn DocumentStore> = Arc::new(MemoryStore::new());
        let partners = PartnerAccounts::new(store.clone(), WebhookConfig::default());
        let staging = StagingStore::new(
            store,
            Arc::new(MemoryCache::default()),
            StagingConfig::default(),
        );
        let (partner, creds) = partners
            .create("Acme Data", "ops@acme.test", config)
            .await
            .unwrap();
        let partner = partners.activate(&partner.id).await.unwrap();
        Fixture {
            intake: PartnerIntake::new(partners.clone(), staging),
            partners,
            partner,
            creds,
        }
    }

    fn body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "batch_id": "b-1",
            "items": [
                {
                    "external_id": "v-100",
                    "payload": {
                        "entity_type": "venue",
                        "name": "Burger Palace",
                        "address": "1 Main St",
                        "city": "Austin",
                        "country": "US",
                        "latitude": 30.27,
                        "longitude": -97.74,
                        "chain_id": null,
                        "platform": null,
                        "source_url": null,
                        "website": "https://burgerpalace.test",
                        "phone": "+1 512 555 0100"
                    },
                    "signals": { "geocode_precision": "rooftop", "matched_name": "Burger Palace" }
                },
                { "external_id": "broken", "payload": { "entity_type": "venue" } }
            ]
        }))
        .unwrap()
    }

    fn signed(f: &Fixture, body: &[u8], ts: i64) -> (String, String) {
        let ts = ts.to_string();
        let sig = sign_webhook(&f.creds.webhook_secret, &ts, body).unwrap();
        (sig, ts)
    }

    #[tokio::test]
    async fn signed_batch_is_staged_per_item() {
        let f = fixture(PartnerConfig::default()).await;
        let body = body();
        let (sig, ts) = signed(&f, &body, Utc::now().timestamp());

        let response = f
            .intake
            .process(&f.creds.api_key, &sig, &ts, &body)
            .await
            .unwrap();

        assert_eq!(response.items.len(), 2);
        assert_eq!(response.accepted, 1);
        assert_eq!(response.rejected, 1);
        let venue = &response.items[0];
        assert!(venue.accepted);
        assert_eq!(venue.entity_type, Some(EntityType::Venue));
        // Rooftop geocode, full record, exact name match; no partner history yet.
        assert_eq!(venue.confidence, Some(100));
        assert_eq!(venue.status, Some(StagingStatus::Approved));
        assert!(response.items[1].error.is_some());

        let partner = f.partners.get(&f.partner.id).await.unwrap();
        assert_eq!(partner.quality_metrics.total_submissions, 2);
    }

    #[tokio::test]
    async fn manual_review_partner_never_auto_approves() {
        let f = fixture(PartnerConfig {
            manual_review_required: true,
            ..PartnerConfig::default()
        })
        .await;
        let body = body();
        let (sig, ts) = signed(&f, &body, Utc::now().timestamp());
        let response = f
            .intake
            .process(&f.creds.api_key, &sig, &ts, &body)
            .await
            .unwrap();
        assert_eq!(response.items[0].status, Some(StagingStatus::NeedsReview));
    }

    #[tokio::test]
    async fn stale_timestamp_is_refused_even_when_signed() {
        let f = fixture(PartnerConfig::default()).await;
        let body = body();
        let (sig, ts) = signed(&f, &body, Utc::now().timestamp() - 600);
        assert!(matches!(
            f.intake.process(&f.creds.api_key, &sig, &ts, &body).await,
            Err(ForageError::StaleTimestamp { .. })
        ));
    }

    #[tokio::test]
    async fn bad_signature_and_unknown_key_are_refused() {
        let f = fixture(PartnerConfig::default()).await;
        let body = body();
        let ts = Utc::now().timestamp().to_string();
        assert!(matches!(
            f.intake.process(&f.creds.api_key, "deadbeef", &ts, &body).await,
            Err(ForageError::Signature(_))
        ));
        let (sig, ts) = signed(&f, &body, Utc::now().timestamp());
        assert!(matches!(
            f.intake.process("fk_live_nope", &sig, &ts, &body).await,
            Err(ForageError::Signature(_))
        ));
    }

    #[tokio::test]
    async fn requests_over_the_minute_rate_are_refused() {
        let f = fixture(PartnerConfig::default()).await;
        f.partners
            .update_rate_limits(
                &f.partner.id,
                RateLimits {
                    requests_per_minute: 1,
                    daily_submissions: 100,
                },
            )
            .await
            .unwrap();
        let body = body();
        let window = RequestWindow::doc_id(&f.partner.id, Utc::now());

        let (sig, ts) = signed(&f, &body, Utc::now().timestamp());
        f.intake
            .process(&f.creds.api_key, &sig, &ts, &body)
            .await
            .unwrap();
        let second = f.intake.process(&f.creds.api_key, &sig, &ts, &body).await;

        if RequestWindow::doc_id(&f.partner.id, Utc::now()) == window {
            let err = second.unwrap_err();
            assert!(matches!(err, ForageError::RateLimited(_)));
            assert!(err.is_retryable());
        }
    }

    #[tokio::test]
    async fn suspended_partner_is_refused() {
        let f = fixture(PartnerConfig::default()).await;
        f.partners.suspend(&f.partner.id).await.unwrap();
        let body = body();
        let (sig, ts) = signed(&f, &body, Utc::now().timestamp());
        assert!(matches!(
            f.intake.process(&f.creds.api_key, &sig, &ts, &body).await,
            Err(ForageError::Signature(_))
        ));
    }

    #[tokio::test]
    async fn disallowed_entity_type_is_refused_per_item() {
        let f = fixture(PartnerConfig {
            allowed_entity_types: vec![EntityType::Dish],
            ..PartnerConfig::default()
        })
        .await;
        let body = body();
        let (sig, ts) = signed(&f, &body, Utc::now().timestamp());
        let response = f
            .intake
            .process(&f.creds.api_key, &sig, &ts, &body)
            .await
            .unwrap();
        assert_eq!(response.accepted, 0);
        assert!(response.items[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("may not submit")));
    }
}
