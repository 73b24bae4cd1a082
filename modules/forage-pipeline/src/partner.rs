use std::sync::Arc;

use chrono::{Duration, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use forage_common::config::WebhookConfig;
use forage_common::{
    ApiKeyIndexEntry, ForageError, IssuedCredentials, Partner, PartnerConfig, PartnerCredentials,
    PartnerStatus, PartnerUsage, PreviousCredentials, RateLimits, RequestWindow, Result,
};
use forage_store::{Collection, DocumentStore};

type HmacSha256 = Hmac<Sha256>;

pub const PARTNERS_COLLECTION: &str = "partners";
pub const CREDENTIALS_COLLECTION: &str = "partner_credentials";
pub const API_KEYS_COLLECTION: &str = "partner_api_keys";
pub const USAGE_COLLECTION: &str = "partner_usage";
pub const REQUEST_WINDOWS_COLLECTION: &str = "partner_request_windows";

const API_KEY_PREFIX: &str = "fk_live_";
const SECRET_PREFIX: &str = "whsec_";
const DISPLAY_PREFIX_LEN: usize = 12;

/// Partner identity, credentials and webhook authentication.
#[derive(Clone)]
pub struct PartnerAccounts {
    partners: Collection<Partner>,
    credentials: Collection<PartnerCredentials>,
    api_keys: Collection<ApiKeyIndexEntry>,
    usage: Collection<PartnerUsage>,
    windows: Collection<RequestWindow>,
    webhook: WebhookConfig,
}

impl PartnerAccounts {
    pub fn new(store: Arc<dyn DocumentStore>, webhook: WebhookConfig) -> Self {
        Self {
            partners: Collection::new(store.clone(), PARTNERS_COLLECTION),
            credentials: Collection::new(store.clone(), CREDENTIALS_COLLECTION),
            api_keys: Collection::new(store.clone(), API_KEYS_COLLECTION),
            usage: Collection::new(store.clone(), USAGE_COLLECTION),
            windows: Collection::new(store, REQUEST_WINDOWS_COLLECTION),
            webhook,
        }
    }

    /// Register a partner in `onboarding`. The returned plaintext credentials are
    /// not recoverable later.
    pub async fn create(
        &self,
        name: &str,
        contact_email: &str,
        config: PartnerConfig,
    ) -> Result<(Partner, IssuedCredentials)> {
        let partner = self
            .partners
            .insert(None, &Partner::new(name, contact_email, config)?)
            .await?;

        let api_key = generate_api_key();
        let webhook_secret = generate_secret();
        let api_key_hash = hash_api_key(&api_key);
        let now = Utc::now();

        self.api_keys
            .insert(
                Some(&api_key_hash),
                &ApiKeyIndexEntry {
                    id: api_key_hash.clone(),
                    partner_id: partner.id.clone(),
                    expires_at: None,
                },
            )
            .await?;
        self.credentials
            .insert(
                Some(&partner.id),
                &PartnerCredentials {
                    id: partner.id.clone(),
                    partner_id: partner.id.clone(),
                    api_key_hash,
                    api_key_prefix: display_prefix(&api_key),
                    webhook_secret: webhook_secret.clone(),
                    previous: None,
                    rotated_at: None,
                    created_at: now,
                    updated_at: now,
                },
            )
            .await?;

        info!(partner_id = %partner.id, name = %partner.name, "Created partner");
        let issued = IssuedCredentials {
            partner_id: partner.id.clone(),
            api_key,
            webhook_secret,
        };
        Ok((partner, issued))
    }

    pub async fn get(&self, id: &str) -> Result<Partner> {
        self.partners
            .get(id)
            .await?
            .ok_or_else(|| ForageError::not_found("partner", id))
    }

    pub async fn activate(&self, id: &str) -> Result<Partner> {
        self.set_status(id, PartnerStatus::Active).await
    }

    pub async fn suspend(&self, id: &str) -> Result<Partner> {
        self.set_status(id, PartnerStatus::Suspended).await
    }

    pub async fn deactivate(&self, id: &str) -> Result<Partner> {
        self.set_status(id, PartnerStatus::Inactive).await
    }

    async fn set_status(&self, id: &str, status: PartnerStatus) -> Result<Partner> {
        let (partner, ()) = self.partners.mutate(id, |p| p.set_status(status)).await?;
        info!(partner_id = id, status = %status, "Partner status changed");
        Ok(partner)
    }

    pub async fn update_config(&self, id: &str, config: PartnerConfig) -> Result<Partner> {
        config.validate()?;
        let (partner, ()) = self
            .partners
            .mutate(id, |p| {
                p.config = config.clone();
                Ok::<_, ForageError>(())
            })
            .await?;
        Ok(partner)
    }

    pub async fn update_rate_limits(&self, id: &str, limits: RateLimits) -> Result<Partner> {
        if limits.requests_per_minute == 0 || limits.daily_submissions == 0 {
            return Err(ForageError::Validation("rate limits must be positive".into()));
        }
        let (partner, ()) = self
            .partners
            .mutate(id, |p| {
                p.rate_limits = limits;
                Ok::<_, ForageError>(())
            })
            .await?;
        info!(partner_id = id, daily = limits.daily_submissions, "Partner rate limits updated");
        Ok(partner)
    }

    /// Resolve a bearer API key. Keys retired by rotation stop working once their
    /// grace window closes.
    pub async fn get_by_api_key(&self, api_key: &str) -> Result<Partner> {
        let hash = hash_api_key(api_key);
        let entry = self
            .api_keys
            .get(&hash)
            .await?
            .ok_or_else(|| ForageError::Signature("unknown api key".into()))?;
        if !entry.is_live(Utc::now()) {
            return Err(ForageError::Signature("api key expired".into()));
        }
        self.get(&entry.partner_id).await
    }

    /// Check a webhook delivery. The timestamp is checked before the signature so
    /// a replayed request fails as stale even when correctly signed.
    pub async fn verify_webhook_signature(
        &self,
        partner_id: &str,
        raw_body: &[u8],
        signature: &str,
        timestamp: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let sent_at: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| ForageError::Signature(format!("malformed timestamp: {timestamp}")))?;
        let age_secs = now.timestamp() - sent_at;
        if age_secs.abs() > self.webhook.signature_tolerance_secs {
            warn!(partner_id, age_secs, "Rejected stale webhook");
            return Err(ForageError::StaleTimestamp { age_secs });
        }

        let provided = signature.trim();
        let provided = provided.strip_prefix("sha256=").unwrap_or(provided);
        let provided = hex::decode(provided)
            .map_err(|_| ForageError::Signature("signature is not hex".into()))?;

        let creds = self
            .credentials
            .get(partner_id)
            .await?
            .ok_or_else(|| ForageError::not_found("partner credentials", partner_id))?;

        for secret in creds.webhook_secrets(now) {
            let mac = signing_mac(secret, timestamp.trim(), raw_body)?;
            if mac.verify_slice(&provided).is_ok() {
                return Ok(());
            }
        }
        warn!(partner_id, "Webhook signature mismatch");
        Err(ForageError::Signature("signature mismatch".into()))
    }

    /// Issue fresh credentials. The old API key and webhook secret keep working
    /// for the configured grace period.
    pub async fn rotate_credentials(&self, partner_id: &str) -> Result<IssuedCredentials> {
        self.get(partner_id).await?;
        let api_key = generate_api_key();
        let webhook_secret = generate_secret();
        let api_key_hash = hash_api_key(&api_key);
        let now = Utc::now();
        let valid_until = now + Duration::hours(self.webhook.credential_grace_hours);

        self.api_keys
            .insert(
                Some(&api_key_hash),
                &ApiKeyIndexEntry {
                    id: api_key_hash.clone(),
                    partner_id: partner_id.to_string(),
                    expires_at: None,
                },
            )
            .await?;

        let (_, retired_hash) = self
            .credentials
            .mutate(partner_id, |c| {
                let retired = PreviousCredentials {
                    api_key_hash: c.api_key_hash.clone(),
                    webhook_secret: c.webhook_secret.clone(),
                    valid_until,
                };
                c.api_key_hash = api_key_hash.clone();
                c.api_key_prefix = display_prefix(&api_key);
                c.webhook_secret = webhook_secret.clone();
                c.rotated_at = Some(now);
                let retired_hash = retired.api_key_hash.clone();
                c.previous = Some(retired);
                Ok::<_, ForageError>(retired_hash)
            })
            .await?;

        match self
            .api_keys
            .mutate(&retired_hash, |e| {
                e.expires_at = Some(valid_until);
                Ok::<_, ForageError>(())
            })
            .await
        {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        info!(partner_id, valid_until = %valid_until, "Rotated partner credentials");
        Ok(IssuedCredentials {
            partner_id: partner_id.to_string(),
            api_key,
            webhook_secret,
        })
    }

    /// Fold one decided submission into the partner's quality metrics.
    pub async fn record_submission(
        &self,
        partner_id: &str,
        confidence: u8,
        accepted: bool,
    ) -> Result<Partner> {
        let (partner, ()) = self
            .partners
            .mutate(partner_id, |p| {
                p.quality_metrics.record_decision(confidence, accepted);
                Ok::<_, ForageError>(())
            })
            .await?;
        Ok(partner)
    }

    /// Count `items` received today, refusing the batch if it would exceed the
    /// partner's daily allowance.
    pub async fn record_intake(&self, partner_id: &str, items: u64) -> Result<PartnerUsage> {
        let partner = self.get(partner_id).await?;
        let limit = partner.rate_limits.daily_submissions;
        let date = Utc::now().date_naive();
        let doc_id = PartnerUsage::doc_id(partner_id, date);

        let fresh = PartnerUsage {
            id: doc_id.clone(),
            partner_id: partner_id.to_string(),
            date,
            submissions: 0,
        };
        match self.usage.insert(Some(&doc_id), &fresh).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }

        let (usage, ()) = self
            .usage
            .mutate(&doc_id, |u| {
                let total = u.submissions.saturating_add(items);
                if total > limit {
                    return Err(ForageError::RateLimited(format!(
                        "daily submission limit {limit} reached ({} used, {items} requested)",
                        u.submissions
                    )));
                }
                u.submissions = total;
                Ok(())
            })
            .await?;

        self.partners
            .mutate(partner_id, |p| {
                p.quality_metrics.total_submissions += items;
                Ok::<_, ForageError>(())
            })
            .await?;
        Ok(usage)
    }

    /// Count one webhook request against the partner's per-minute allowance.
    /// Refused requests are not counted.
    pub async fn check_request_rate(&self, partner: &Partner) -> Result<RequestWindow> {
        let limit = partner.rate_limits.requests_per_minute;
        let now = Utc::now();
        let doc_id = RequestWindow::doc_id(&partner.id, now);

        let fresh = RequestWindow {
            id: doc_id.clone(),
            partner_id: partner.id.clone(),
            minute: RequestWindow::start(now),
            requests: 0,
        };
        match self.windows.insert(Some(&doc_id), &fresh).await {
            Ok(_) => {}
            Err(e) if e.is_already_exists() => {}
            Err(e) => return Err(e.into()),
        }

        let result = self
            .windows
            .mutate(&doc_id, |w| {
                if w.requests >= limit {
                    return Err(ForageError::RateLimited(format!(
                        "{limit} requests per minute exceeded"
                    )));
                }
                w.requests += 1;
                Ok(())
            })
            .await;
        match result {
            Ok((window, ())) => Ok(window),
            Err(e) => {
                if matches!(e, ForageError::RateLimited(_)) {
                    warn!(partner_id = %partner.id, limit, "Partner request rate exceeded");
                }
                Err(e)
            }
        }
    }

    pub async fn credentials(&self, partner_id: &str) -> Result<PartnerCredentials> {
        self.credentials
            .get(partner_id)
            .await?
            .ok_or_else(|| ForageError::not_found("partner credentials", partner_id))
    }
}

/// Hex HMAC-SHA256 of `"{timestamp}.{body}"`, the value partners send in `X-Signature`.
pub fn sign_webhook(secret: &str, timestamp: &str, body: &[u8]) -> Result<String> {
    let mac = signing_mac(secret, timestamp, body)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn signing_mac(secret: &str, timestamp: &str, body: &[u8]) -> Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(mac_error)?;
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    Ok(mac)
}

fn mac_error(e: hmac::digest::InvalidLength) -> ForageError {
    ForageError::Signature(format!("invalid signing key: {e}"))
}

pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

fn generate_api_key() -> String {
    format!("{API_KEY_PREFIX}{}", hex::encode(rand::random::<[u8; 24]>()))
}

fn generate_secret() -> String {
    format!("{SECRET_PREFIX}{}", hex::encode(rand::random::<[u8; 32]>()))
}

fn display_prefix(api_key: &str) -> String {
    api_key.chars().take(DISPLAY_PREFIX_LEN).collect()
}
