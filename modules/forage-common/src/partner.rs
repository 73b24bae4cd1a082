use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ForageError, Result};
use crate::staging::EntityType;

pub const DEFAULT_AUTO_APPROVE_THRESHOLD: u8 = 85;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartnerStatus {
    Onboarding,
    Active,
    Suspended,
    Inactive,
}

impl PartnerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Onboarding => "onboarding",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Inactive => "inactive",
        }
    }

    pub fn can_transition_to(&self, next: PartnerStatus) -> bool {
        use PartnerStatus::*;
        matches!(
            (self, next),
            (Onboarding | Suspended | Inactive, Active)
                | (Active, Suspended)
                | (Onboarding | Active | Suspended, Inactive)
        )
    }
}

impl std::fmt::Display for PartnerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerConfig {
    pub allowed_entity_types: Vec<EntityType>,
    #[serde(default)]
    pub markets: Vec<String>,
    pub auto_approve_threshold: u8,
    #[serde(default)]
    pub manual_review_required: bool,
}

impl Default for PartnerConfig {
    fn default() -> Self {
        Self {
            allowed_entity_types: EntityType::ALL.to_vec(),
            markets: Vec::new(),
            auto_approve_threshold: DEFAULT_AUTO_APPROVE_THRESHOLD,
            manual_review_required: false,
        }
    }
}

impl PartnerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.auto_approve_threshold > 100 {
            return Err(ForageError::Validation(
                "auto_approve_threshold must be 0-100".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    pub requests_per_minute: u32,
    pub daily_submissions: u64,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            daily_submissions: 10_000,
        }
    }
}

/// Running tallies over decided submissions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Items received, decided or not.
    pub total_submissions: u64,
    pub decided_submissions: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub average_confidence: f64,
    /// 0–100.
    pub acceptance_rate: f64,
    pub data_quality_score: u8,
}

impl QualityMetrics {
    pub fn record_decision(&mut self, confidence: u8, accepted: bool) {
        let confidence = f64::from(confidence.min(100));
        let prior = self.decided_submissions as f64;
        self.decided_submissions += 1;
        if accepted {
            self.accepted += 1;
        } else {
            self.rejected += 1;
        }
        self.average_confidence =
            (self.average_confidence * prior + confidence) / self.decided_submissions as f64;
        self.acceptance_rate = 100.0 * self.accepted as f64 / self.decided_submissions as f64;
        self.data_quality_score = quality_score(self.acceptance_rate, self.average_confidence);
    }

    /// None until at least one decision has been recorded.
    pub fn quality_signal(&self) -> Option<u8> {
        (self.decided_submissions > 0).then_some(self.data_quality_score)
    }
}

/// `round(0.6 * acceptance_rate + 0.4 * average_confidence)`, inputs clamped to 0–100.
pub fn quality_score(acceptance_rate: f64, average_confidence: f64) -> u8 {
    let clamp = |v: f64| if v.is_finite() { v.clamp(0.0, 100.0) } else { 0.0 };
    (0.6 * clamp(acceptance_rate) + 0.4 * clamp(average_confidence)).round() as u8
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Partner {
    #[serde(default)]
    pub id: String,
    pub name: String,
    pub contact_email: String,
    pub status: PartnerStatus,
    pub config: PartnerConfig,
    #[serde(default)]
    pub quality_metrics: QualityMetrics,
    #[serde(default)]
    pub rate_limits: RateLimits,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Partner {
    pub fn new(name: &str, contact_email: &str, config: PartnerConfig) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(ForageError::Validation("partner name must not be blank".into()));
        }
        if !contact_email.contains('@') {
            return Err(ForageError::Validation(format!(
                "invalid contact email: {contact_email}"
            )));
        }
        config.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: String::new(),
            name: name.trim().to_string(),
            contact_email: contact_email.trim().to_string(),
            status: PartnerStatus::Onboarding,
            config,
            quality_metrics: QualityMetrics::default(),
            rate_limits: RateLimits::default(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn set_status(&mut self, next: PartnerStatus) -> Result<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_transition_to(next) {
            return Err(ForageError::invalid_transition(self.status, next));
        }
        self.status = next;
        Ok(())
    }

    pub fn is_active(&self) -> bool {
        self.status == PartnerStatus::Active
    }

    pub fn accepts(&self, entity_type: EntityType) -> bool {
        self.config.allowed_entity_types.contains(&entity_type)
    }
}

/// Credentials retired by a rotation, honoured until `valid_until`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreviousCredentials {
    pub api_key_hash: String,
    pub webhook_secret: String,
    pub valid_until: DateTime<Utc>,
}

/// Stored under the partner's id. Holds only the API key hash; the webhook
/// secret has to be kept in the clear to verify signatures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerCredentials {
    #[serde(default)]
    pub id: String,
    pub partner_id: String,
    pub api_key_hash: String,
    pub api_key_prefix: String,
    pub webhook_secret: String,
    pub previous: Option<PreviousCredentials>,
    pub rotated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PartnerCredentials {
    /// Secrets to try, current first, skipping a previous secret past its grace window.
    pub fn webhook_secrets(&self, now: DateTime<Utc>) -> Vec<&str> {
        let mut secrets = vec![self.webhook_secret.as_str()];
        if let Some(prev) = &self.previous {
            if prev.valid_until > now {
                secrets.push(prev.webhook_secret.as_str());
            }
        }
        secrets
    }
}

/// Plaintext credentials, returned once at creation or rotation and never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssuedCredentials {
    pub partner_id: String,
    pub api_key: String,
    pub webhook_secret: String,
}

/// Document id is the API key hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyIndexEntry {
    #[serde(default)]
    pub id: String,
    pub partner_id: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKeyIndexEntry {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Items received from one partner on one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartnerUsage {
    #[serde(default)]
    pub id: String,
    pub partner_id: String,
    pub date: NaiveDate,
    pub submissions: u64,
}

impl PartnerUsage {
    pub fn doc_id(partner_id: &str, date: NaiveDate) -> String {
        format!("{partner_id}:{}", date.format("%Y-%m-%d"))
    }
}

/// Webhook requests from one partner within one UTC minute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestWindow {
    #[serde(default)]
    pub id: String,
    pub partner_id: String,
    pub minute: DateTime<Utc>,
    pub requests: u32,
}

impl RequestWindow {
    /// `at` truncated to its minute.
    pub fn start(at: DateTime<Utc>) -> DateTime<Utc> {
        DateTime::from_timestamp(at.timestamp() - at.timestamp().rem_euclid(60), 0).unwrap_or(at)
    }

    pub fn doc_id(partner_id: &str, at: DateTime<Utc>) -> String {
        format!("{partner_id}:{}", Self::start(at).format("%Y-%m-%dT%H:%M"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_windows_are_per_minute() {
        let at = DateTime::parse_from_rfc3339("2026-03-01T10:15:42Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(RequestWindow::doc_id("p1", at), "p1:2026-03-01T10:15");
        assert_eq!(RequestWindow::start(at).to_rfc3339(), "2026-03-01T10:15:00+00:00");
        let next = at + chrono::Duration::seconds(20);
        assert_eq!(RequestWindow::doc_id("p1", next), "p1:2026-03-01T10:16");
    }

    #[test]
    fn quality_score_weights_acceptance_over_confidence() {
        assert_eq!(quality_score(100.0, 50.0), 80);
        assert_eq!(quality_score(50.0, 75.0), 60);
        assert_eq!(quality_score(250.0, -10.0), 60);
        assert_eq!(quality_score(f64::NAN, 100.0), 40);
    }

    #[test]
    fn metrics_track_running_averages() {
        let mut m = QualityMetrics::default();
        assert_eq!(m.quality_signal(), None);
        m.record_decision(90, true);
        m.record_decision(70, true);
        m.record_decision(20, false);
        assert_eq!(m.decided_submissions, 3);
        assert_eq!(m.accepted, 2);
        assert!((m.average_confidence - 60.0).abs() < 1e-9);
        assert!((m.acceptance_rate - 66.666_666).abs() < 1e-3);
        // 0.6 * 66.67 + 0.4 * 60 = 64
        assert_eq!(m.quality_signal(), Some(64));
    }

    #[test]
    fn partner_status_transitions() {
        let mut p = Partner::new("Acme Data", "ops@acme.test", PartnerConfig::default()).unwrap();
        assert!(p.set_status(PartnerStatus::Suspended).is_err());
        p.set_status(PartnerStatus::Active).unwrap();
        p.set_status(PartnerStatus::Suspended).unwrap();
        p.set_status(PartnerStatus::Active).unwrap();
        p.set_status(PartnerStatus::Inactive).unwrap();
        assert!(!p.is_active());
    }

    #[test]
    fn previous_secret_expires_after_grace() {
        let now = Utc::now();
        let creds = PartnerCredentials {
            id: "p1".into(),
            partner_id: "p1".into(),
            api_key_hash: "h2".into(),
            api_key_prefix: "fk_live_ab".into(),
            webhook_secret: "new".into(),
            previous: Some(PreviousCredentials {
                api_key_hash: "h1".into(),
                webhook_secret: "old".into(),
                valid_until: now + chrono::Duration::hours(1),
            }),
            rotated_at: Some(now),
            created_at: now,
            updated_at: now,
        };
        assert_eq!(creds.webhook_secrets(now), vec!["new", "old"]);
        assert_eq!(
            creds.webhook_secrets(now + chrono::Duration::hours(2)),
            vec!["new"]
        );
    }
}
