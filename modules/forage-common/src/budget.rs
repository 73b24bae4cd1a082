use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::BudgetConfig;
use crate::error::{ForageError, Result};

/// Slack applied to USD comparisons so accumulated float error cannot flip a
/// threshold decision.
pub const COST_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CostCategory {
    SearchFree,
    SearchPaid,
    Ai { provider: String },
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleEvent {
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Spend for one UTC day. Document id is the date (`YYYY-MM-DD`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetRecord {
    #[serde(default)]
    pub id: String,
    pub date: NaiveDate,
    /// `YYYY-MM`, for monthly folds.
    pub month: String,
    pub search_queries_free: u64,
    pub search_queries_paid: u64,
    #[serde(default)]
    pub ai_calls: BTreeMap<String, u64>,
    pub search_cost_usd: f64,
    #[serde(default)]
    pub ai_cost_usd: BTreeMap<String, f64>,
    pub other_cost_usd: f64,
    pub total_cost_usd: f64,
    #[serde(default)]
    pub throttle_events: Vec<ThrottleEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetRecord {
    pub fn new(date: NaiveDate) -> Self {
        let now = Utc::now();
        Self {
            id: day_id(date),
            date,
            month: month_key(date),
            search_queries_free: 0,
            search_queries_paid: 0,
            ai_calls: BTreeMap::new(),
            search_cost_usd: 0.0,
            ai_cost_usd: BTreeMap::new(),
            other_cost_usd: 0.0,
            total_cost_usd: 0.0,
            throttle_events: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Count one billable operation of `category` costing `amount_usd`.
    pub fn apply(&mut self, category: &CostCategory, amount_usd: f64) -> Result<()> {
        if !amount_usd.is_finite() || amount_usd < 0.0 {
            return Err(ForageError::Validation(format!(
                "cost must be a non-negative amount, got {amount_usd}"
            )));
        }
        match category {
            CostCategory::SearchFree => {
                self.search_queries_free += 1;
                self.search_cost_usd += amount_usd;
            }
            CostCategory::SearchPaid => {
                self.search_queries_paid += 1;
                self.search_cost_usd += amount_usd;
            }
            CostCategory::Ai { provider } => {
                *self.ai_calls.entry(provider.clone()).or_default() += 1;
                *self.ai_cost_usd.entry(provider.clone()).or_default() += amount_usd;
            }
            CostCategory::Other => self.other_cost_usd += amount_usd,
        }
        self.total_cost_usd += amount_usd;
        Ok(())
    }

    pub fn search_queries(&self) -> u64 {
        self.search_queries_free + self.search_queries_paid
    }
}

pub fn day_id(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

pub fn month_key(date: NaiveDate) -> String {
    date.format("%Y-%m").to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonthlyTotals {
    pub month: String,
    pub days: u32,
    pub search_queries_free: u64,
    pub search_queries_paid: u64,
    pub ai_calls: BTreeMap<String, u64>,
    pub search_cost_usd: f64,
    pub ai_cost_usd: BTreeMap<String, f64>,
    pub other_cost_usd: f64,
    pub total_cost_usd: f64,
    pub throttle_events: u64,
}

impl MonthlyTotals {
    pub fn fold<'a>(month: &str, records: impl IntoIterator<Item = &'a BudgetRecord>) -> Self {
        let mut totals = Self {
            month: month.to_string(),
            ..Self::default()
        };
        for r in records.into_iter().filter(|r| r.month == month) {
            totals.days += 1;
            totals.search_queries_free += r.search_queries_free;
            totals.search_queries_paid += r.search_queries_paid;
            for (provider, calls) in &r.ai_calls {
                *totals.ai_calls.entry(provider.clone()).or_default() += calls;
            }
            for (provider, cost) in &r.ai_cost_usd {
                *totals.ai_cost_usd.entry(provider.clone()).or_default() += cost;
            }
            totals.search_cost_usd += r.search_cost_usd;
            totals.other_cost_usd += r.other_cost_usd;
            totals.total_cost_usd += r.total_cost_usd;
            totals.throttle_events += r.throttle_events.len() as u64;
        }
        totals
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleState {
    pub throttled: bool,
    pub reason: Option<String>,
}

impl ThrottleState {
    /// Daily spend at or past `daily_limit * threshold`, or monthly spend at or
    /// past the monthly limit, throttles.
    pub fn evaluate(today_usd: f64, month_usd: f64, config: &BudgetConfig) -> Self {
        let daily_cap = config.daily_limit_usd * config.throttle_threshold;
        if today_usd + COST_EPSILON >= daily_cap {
            return Self {
                throttled: true,
                reason: Some(format!(
                    "daily spend ${today_usd:.2} reached {:.0}% of ${:.2} limit",
                    config.throttle_threshold * 100.0,
                    config.daily_limit_usd
                )),
            };
        }
        if month_usd + COST_EPSILON >= config.monthly_limit_usd {
            return Self {
                throttled: true,
                reason: Some(format!(
                    "monthly spend ${month_usd:.2} reached ${:.2} limit",
                    config.monthly_limit_usd
                )),
            };
        }
        Self {
            throttled: false,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "admission", content = "reason", rename_all = "snake_case")]
pub enum Admission {
    Allow,
    Deny(String),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub date: NaiveDate,
    pub month: String,
    pub today_usd: f64,
    pub month_usd: f64,
    pub daily_limit_usd: f64,
    pub monthly_limit_usd: f64,
    pub throttle_threshold: f64,
    /// May exceed 100.
    pub daily_percent: f64,
    pub monthly_percent: f64,
    pub search_queries_today: u64,
    pub throttle: ThrottleState,
}

impl BudgetStatus {
    pub fn new(today: &BudgetRecord, month: &MonthlyTotals, config: &BudgetConfig) -> Self {
        Self {
            date: today.date,
            month: month.month.clone(),
            today_usd: today.total_cost_usd,
            month_usd: month.total_cost_usd,
            daily_limit_usd: config.daily_limit_usd,
            monthly_limit_usd: config.monthly_limit_usd,
            throttle_threshold: config.throttle_threshold,
            daily_percent: percent(today.total_cost_usd, config.daily_limit_usd),
            monthly_percent: percent(month.total_cost_usd, config.monthly_limit_usd),
            search_queries_today: today.search_queries(),
            throttle: ThrottleState::evaluate(
                today.total_cost_usd,
                month.total_cost_usd,
                config,
            ),
        }
    }
}

fn percent(used: f64, limit: f64) -> f64 {
    if limit <= 0.0 {
        return 0.0;
    }
    100.0 * used / limit
}
