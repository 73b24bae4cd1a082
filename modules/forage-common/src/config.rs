use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;

use crate::error::{ForageError, Result};

/// Application configuration loaded from environment variables.
/// Budget limits and thresholds are tunable without a deploy.
#[derive(Debug, Clone)]
pub struct Config {
    // Persistence. None runs against the in-memory store.
    pub database_url: Option<String>,

    // Web server
    pub web_host: String,
    pub web_port: u16,

    // Admin
    pub admin_token: String,

    pub budget: BudgetConfig,
    pub pricing: PricingConfig,
    pub staging: StagingConfig,
    pub webhook: WebhookConfig,

    /// Seconds between SSE heartbeats on run progress streams.
    pub heartbeat_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetConfig {
    pub daily_limit_usd: f64,
    pub monthly_limit_usd: f64,
    /// Fraction of the daily limit at which new runs are refused.
    pub throttle_threshold: f64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit_usd: 50.0,
            monthly_limit_usd: 1_000.0,
            throttle_threshold: 0.8,
        }
    }
}

impl BudgetConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.daily_limit_usd.is_finite() && self.daily_limit_usd > 0.0) {
            return Err(ForageError::Config("daily budget limit must be positive".into()));
        }
        if !(self.monthly_limit_usd.is_finite() && self.monthly_limit_usd > 0.0) {
            return Err(ForageError::Config("monthly budget limit must be positive".into()));
        }
        if !(self.throttle_threshold > 0.0 && self.throttle_threshold <= 1.0) {
            return Err(ForageError::Config(
                "throttle threshold must be in (0, 1]".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AiPrice {
    pub input_per_1k_tokens: f64,
    pub output_per_1k_tokens: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PricingConfig {
    /// Search queries per day covered by the provider's free tier.
    pub free_search_daily_quota: u64,
    pub paid_search_usd: f64,
    pub ai: BTreeMap<String, AiPrice>,
    /// Used for providers missing from `ai`.
    pub ai_fallback: AiPrice,
}

impl Default for PricingConfig {
    fn default() -> Self {
        let ai = BTreeMap::from([
            (
                "anthropic".to_string(),
                AiPrice { input_per_1k_tokens: 0.003, output_per_1k_tokens: 0.015 },
            ),
            (
                "openai".to_string(),
                AiPrice { input_per_1k_tokens: 0.0025, output_per_1k_tokens: 0.01 },
            ),
            (
                "google".to_string(),
                AiPrice { input_per_1k_tokens: 0.00125, output_per_1k_tokens: 0.005 },
            ),
        ]);
        Self {
            free_search_daily_quota: 100,
            paid_search_usd: 0.005,
            ai,
            ai_fallback: AiPrice { input_per_1k_tokens: 0.003, output_per_1k_tokens: 0.015 },
        }
    }
}

impl PricingConfig {
    pub fn ai_cost(&self, provider: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let price = self.ai.get(provider).copied().unwrap_or(self.ai_fallback);
        (input_tokens as f64 / 1000.0) * price.input_per_1k_tokens
            + (output_tokens as f64 / 1000.0) * price.output_per_1k_tokens
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagingConfig {
    /// Scores strictly below this are auto-rejected.
    pub auto_reject_below: u8,
    /// Used when a producer has no partner record (scrapers).
    pub default_auto_approve_threshold: u8,
    pub bulk_max: usize,
}

impl Default for StagingConfig {
    fn default() -> Self {
        Self {
            auto_reject_below: 30,
            default_auto_approve_threshold: 85,
            bulk_max: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebhookConfig {
    /// Replay window for `X-Timestamp`.
    pub signature_tolerance_secs: i64,
    /// How long rotated-out credentials keep working.
    pub credential_grace_hours: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            signature_tolerance_secs: 300,
            credential_grace_hours: 24,
        }
    }
}

impl Config {
    /// Load configuration from environment variables (and `.env` if present).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let budget = BudgetConfig {
            daily_limit_usd: env_or("BUDGET_DAILY_LIMIT_USD", 50.0)?,
            monthly_limit_usd: env_or("BUDGET_MONTHLY_LIMIT_USD", 1_000.0)?,
            throttle_threshold: env_or("BUDGET_THROTTLE_THRESHOLD", 0.8)?,
        };
        budget.validate()?;

        let defaults = PricingConfig::default();
        let pricing = PricingConfig {
            free_search_daily_quota: env_or("SEARCH_FREE_DAILY_QUOTA", defaults.free_search_daily_quota)?,
            paid_search_usd: env_or("SEARCH_PAID_COST_USD", defaults.paid_search_usd)?,
            ..defaults
        };

        let staging = StagingConfig {
            auto_reject_below: env_or("STAGING_AUTO_REJECT_BELOW", 30)?,
            default_auto_approve_threshold: env_or("STAGING_AUTO_APPROVE_THRESHOLD", 85)?,
            bulk_max: env_or("STAGING_BULK_MAX", 100)?,
        };
        if staging.auto_reject_below > 100 || staging.default_auto_approve_threshold > 100 {
            return Err(ForageError::Config("staging thresholds must be 0-100".into()));
        }

        let webhook = WebhookConfig {
            signature_tolerance_secs: env_or("WEBHOOK_TOLERANCE_SECS", 300)?,
            credential_grace_hours: env_or("CREDENTIAL_GRACE_HOURS", 24)?,
        };

        Ok(Self {
            database_url: env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            web_host: env::var("WEB_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            web_port: env_or("WEB_PORT", 3000)?,
            admin_token: env::var("ADMIN_TOKEN").unwrap_or_default(),
            budget,
            pricing,
            staging,
            webhook,
            heartbeat_secs: env_or("SSE_HEARTBEAT_SECS", 15)?,
        })
    }

    /// Defaults suitable for tests and local runs.
    pub fn for_tests() -> Self {
        Self {
            database_url: None,
            web_host: "127.0.0.1".to_string(),
            web_port: 0,
            admin_token: "test-admin-token".to_string(),
            budget: BudgetConfig::default(),
            pricing: PricingConfig::default(),
            staging: StagingConfig::default(),
            webhook: WebhookConfig::default(),
            heartbeat_secs: 15,
        }
    }

    /// Log the effective configuration with secrets redacted.
    pub fn log_redacted(&self) {
        tracing::info!("Config loaded:");
        tracing::info!(
            "  DATABASE_URL: {}",
            if self.database_url.is_some() { "<set>" } else { "<not set, using memory store>" }
        );
        tracing::info!("  ADMIN_TOKEN: {}", preview(&self.admin_token));
        tracing::info!(
            daily_limit_usd = self.budget.daily_limit_usd,
            monthly_limit_usd = self.budget.monthly_limit_usd,
            throttle_threshold = self.budget.throttle_threshold,
            "  Budget"
        );
        tracing::info!(
            auto_reject_below = self.staging.auto_reject_below,
            auto_approve_threshold = self.staging.default_auto_approve_threshold,
            "  Staging"
        );
    }
}

/// First four characters and the length of a secret.
fn preview(val: &str) -> String {
    if val.is_empty() {
        return "<not set>".to_string();
    }
    let head: String = val.chars().take(4).collect();
    format!("{head}...({} chars)", val.chars().count())
}

fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|_| ForageError::Config(format!("{key} has an invalid value: {raw}"))),
        _ => Ok(default),
    }
}
