use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ForageError, Result};

/// Success rate reported for a strategy with no usage history of its own.
pub const NEUTRAL_SUCCESS_RATE: u8 = 50;

/// Below this many uses a success rate is noise; the strategy is "untested".
pub const MIN_USES_FOR_TIER: u64 = 5;

pub const HIGH_TIER_MIN_RATE: u8 = 70;
pub const MEDIUM_TIER_MIN_RATE: u8 = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Discovery,
    DishExtraction,
}

impl StrategyKind {
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery_strategies",
            Self::DishExtraction => "extraction_strategies",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyOrigin {
    Seed,
    Evolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageOutcome {
    Success,
    Failure,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyTier {
    High,
    Medium,
    Low,
    Untested,
}

impl fmt::Display for StrategyTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::High => write!(f, "high"),
            Self::Medium => write!(f, "medium"),
            Self::Low => write!(f, "low"),
            Self::Untested => write!(f, "untested"),
        }
    }
}

/// A discovery or dish-extraction technique for one platform, optionally
/// specialised to one chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    #[serde(default)]
    pub id: String,
    pub kind: StrategyKind,
    pub platform: String,
    /// None = platform-wide default.
    pub chain_id: Option<String>,
    pub name: String,
    /// Query template or extraction config. Opaque to the engine.
    #[serde(default)]
    pub config: Value,
    pub success_rate: u8,
    pub total_uses: u64,
    pub successful_uses: u64,
    pub failed_uses: u64,
    #[serde(default)]
    pub tags: Vec<String>,
    pub origin: StrategyOrigin,
    pub parent_strategy_id: Option<String>,
    pub deprecated_at: Option<DateTime<Utc>>,
    pub deprecation_reason: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    pub fn seed(
        kind: StrategyKind,
        platform: impl Into<String>,
        chain_id: Option<String>,
        name: impl Into<String>,
        config: Value,
        tags: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            kind,
            platform: platform.into(),
            chain_id,
            name: name.into(),
            config,
            success_rate: NEUTRAL_SUCCESS_RATE,
            total_uses: 0,
            successful_uses: 0,
            failed_uses: 0,
            tags,
            origin: StrategyOrigin::Seed,
            parent_strategy_id: None,
            deprecated_at: None,
            deprecation_reason: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A variant of `parent` that starts from the parent's current success rate
    /// as a prior but carries none of its usage history.
    pub fn evolve_from(parent: &Strategy, config: Value, extra_tags: Vec<String>) -> Self {
        let mut tags = parent.tags.clone();
        for tag in extra_tags {
            if !tags.contains(&tag) {
                tags.push(tag);
            }
        }
        let now = Utc::now();
        Self {
            id: String::new(),
            kind: parent.kind,
            platform: parent.platform.clone(),
            chain_id: parent.chain_id.clone(),
            name: format!("{} (evolved)", parent.name),
            config,
            success_rate: parent.success_rate,
            total_uses: 0,
            successful_uses: 0,
            failed_uses: 0,
            tags,
            origin: StrategyOrigin::Evolved,
            parent_strategy_id: Some(parent.id.clone()),
            deprecated_at: None,
            deprecation_reason: None,
            last_used_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.deprecated_at.is_none()
    }

    /// Count one use and recompute the success rate. Deprecated strategies are terminal.
    pub fn record(&mut self, outcome: UsageOutcome, now: DateTime<Utc>) -> Result<()> {
        if !self.is_active() {
            return Err(ForageError::StrategyDeprecated {
                id: self.id.clone(),
            });
        }
        match outcome {
            UsageOutcome::Success => self.successful_uses += 1,
            UsageOutcome::Failure => self.failed_uses += 1,
        }
        self.total_uses = self.successful_uses + self.failed_uses;
        if let Some(rate) = success_rate(self.successful_uses, self.total_uses) {
            self.success_rate = rate;
        }
        self.last_used_at = Some(now);
        Ok(())
    }

    pub fn deprecate(&mut self, reason: impl Into<String>, now: DateTime<Utc>) -> Result<()> {
        if !self.is_active() {
            return Err(ForageError::StrategyDeprecated {
                id: self.id.clone(),
            });
        }
        self.deprecated_at = Some(now);
        self.deprecation_reason = Some(reason.into());
        Ok(())
    }

    pub fn tier(&self) -> StrategyTier {
        if self.total_uses < MIN_USES_FOR_TIER {
            StrategyTier::Untested
        } else if self.success_rate >= HIGH_TIER_MIN_RATE {
            StrategyTier::High
        } else if self.success_rate >= MEDIUM_TIER_MIN_RATE {
            StrategyTier::Medium
        } else {
            StrategyTier::Low
        }
    }
}

/// `round(100 * successful / total)`, None when there is no history.
pub fn success_rate(successful: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let rate = (100.0 * successful as f64 / total as f64).round();
    Some(rate.clamp(0.0, 100.0) as u8)
}

/// Active strategies bucketed by trustworthiness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategyTiers {
    pub high: Vec<Strategy>,
    pub medium: Vec<Strategy>,
    pub low: Vec<Strategy>,
    pub untested: Vec<Strategy>,
}

impl StrategyTiers {
    pub fn classify(strategies: impl IntoIterator<Item = Strategy>) -> Self {
        let mut tiers = Self::default();
        for s in strategies.into_iter().filter(Strategy::is_active) {
            match s.tier() {
                StrategyTier::High => tiers.high.push(s),
                StrategyTier::Medium => tiers.medium.push(s),
                StrategyTier::Low => tiers.low.push(s),
                StrategyTier::Untested => tiers.untested.push(s),
            }
        }
        for bucket in [
            &mut tiers.high,
            &mut tiers.medium,
            &mut tiers.low,
            &mut tiers.untested,
        ] {
            bucket.sort_by(|a, b| b.success_rate.cmp(&a.success_rate));
        }
        tiers
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn seed() -> Strategy {
        let mut s = Strategy::seed(
            StrategyKind::Discovery,
            "google_maps",
            None,
            "name search",
            json!({"q": "{chain} near {city}"}),
            vec!["maps".into()],
        );
        s.id = "s1".into();
        s
    }

    #[test]
    fn fresh_seed_reports_neutral_rate() {
        let s = seed();
        assert_eq!(s.success_rate, NEUTRAL_SUCCESS_RATE);
        assert_eq!(s.tier(), StrategyTier::Untested);
    }

    #[test]
    fn rate_tracks_counts_after_every_use() {
        let mut s = seed();
        let outcomes = [
            UsageOutcome::Success,
            UsageOutcome::Failure,
            UsageOutcome::Success,
            UsageOutcome::Success,
            UsageOutcome::Failure,
            UsageOutcome::Failure,
            UsageOutcome::Success,
        ];
        for outcome in outcomes {
            s.record(outcome, Utc::now()).unwrap();
            assert_eq!(s.total_uses, s.successful_uses + s.failed_uses);
            assert_eq!(
                Some(s.success_rate),
                success_rate(s.successful_uses, s.total_uses)
            );
        }
        // 4 of 7 = 57.14
        assert_eq!(s.success_rate, 57);
    }

    #[test]
    fn halves_round_away_from_zero() {
        assert_eq!(success_rate(1, 8), Some(13));
        assert_eq!(success_rate(0, 3), Some(0));
        assert_eq!(success_rate(3, 3), Some(100));
        assert_eq!(success_rate(0, 0), None);
    }

    #[test]
    fn deprecated_strategy_rejects_usage() {
        let mut s = seed();
        s.deprecate("low yield", Utc::now()).unwrap();
        let err = s.record(UsageOutcome::Success, Utc::now()).unwrap_err();
        assert!(matches!(err, ForageError::StrategyDeprecated { .. }));
        assert_eq!(s.total_uses, 0);
        assert!(s.deprecate("again", Utc::now()).is_err());
    }

    #[test]
    fn evolved_child_inherits_prior_not_history() {
        let mut parent = seed();
        for _ in 0..8 {
            parent.record(UsageOutcome::Success, Utc::now()).unwrap();
        }
        for _ in 0..2 {
            parent.record(UsageOutcome::Failure, Utc::now()).unwrap();
        }

        let child = Strategy::evolve_from(&parent, json!({"q": "v2"}), vec!["v2".into(), "maps".into()]);
        assert_eq!(child.success_rate, 80);
        assert_eq!(child.total_uses, 0);
        assert_eq!(child.parent_strategy_id.as_deref(), Some("s1"));
        assert_eq!(child.origin, StrategyOrigin::Evolved);
        assert_eq!(child.tags, vec!["maps", "v2"]);
    }

    #[test]
    fn tiers_gate_on_sample_size() {
        let mut high_but_small = seed();
        for _ in 0..4 {
            high_but_small.record(UsageOutcome::Success, Utc::now()).unwrap();
        }
        let mut proven = seed();
        for _ in 0..5 {
            proven.record(UsageOutcome::Success, Utc::now()).unwrap();
        }
        let mut poor = seed();
        for _ in 0..5 {
            poor.record(UsageOutcome::Failure, Utc::now()).unwrap();
        }
        let mut deprecated = seed();
        deprecated.deprecate("gone", Utc::now()).unwrap();

        let tiers = StrategyTiers::classify(vec![high_but_small, proven, poor, deprecated]);
        assert_eq!(tiers.untested.len(), 1);
        assert_eq!(tiers.high.len(), 1);
        assert_eq!(tiers.low.len(), 1);
        assert!(tiers.medium.is_empty());
    }
}
