use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::staging::{EntityType, ReviewDecision};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchResultType {
    TruePositive,
    FalsePositive,
    NoResults,
    Error,
}

/// What a reviewer said about one search result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackDetails {
    pub useful: bool,
    pub corrections: Option<Value>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HumanFeedback {
    pub useful: bool,
    pub corrections: Option<Value>,
    pub notes: Option<String>,
    pub reviewer: String,
    pub reviewed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSearchFeedback {
    pub run_id: Option<String>,
    pub strategy_id: Option<String>,
    pub platform: String,
    pub chain_id: Option<String>,
    pub query: String,
    pub result_type: SearchResultType,
    pub results_count: u64,
    #[serde(default)]
    pub staged_ids: Vec<String>,
}

/// One executed search. `result_type` is fixed at creation; human judgments
/// only ever append.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFeedback {
    #[serde(default)]
    pub id: String,
    pub run_id: Option<String>,
    pub strategy_id: Option<String>,
    pub platform: String,
    pub chain_id: Option<String>,
    pub query: String,
    pub result_type: SearchResultType,
    pub results_count: u64,
    #[serde(default)]
    pub staged_ids: Vec<String>,
    #[serde(default)]
    pub human_feedback: Vec<HumanFeedback>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SearchFeedback {
    pub fn new(input: NewSearchFeedback) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            run_id: input.run_id,
            strategy_id: input.strategy_id,
            platform: input.platform,
            chain_id: input.chain_id,
            query: input.query,
            result_type: input.result_type,
            results_count: input.results_count,
            staged_ids: input.staged_ids,
            human_feedback: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A review decision on a staged entity, kept for learning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    #[serde(default)]
    pub id: String,
    pub entity_type: EntityType,
    pub staged_id: String,
    pub strategy_id: Option<String>,
    pub partner_id: Option<String>,
    pub discovery_run_id: Option<String>,
    pub decision: ReviewDecision,
    pub confidence: u8,
    pub reviewer: String,
    pub decided_at: DateTime<Utc>,
}

/// Counts over a slice of the feedback log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedbackTally {
    pub searches: u64,
    pub true_positives: u64,
    pub false_positives: u64,
    pub no_results: u64,
    pub errors: u64,
    pub results: u64,
    /// tp / (tp + fp); None without any classified hits.
    pub precision: Option<f64>,
    pub feedback_count: u64,
    pub useful_count: u64,
    pub useful_rate: Option<f64>,
    pub reviews_approved: u64,
    pub reviews_rejected: u64,
}

impl FeedbackTally {
    pub fn fold<'a>(
        searches: impl IntoIterator<Item = &'a SearchFeedback>,
        reviews: impl IntoIterator<Item = &'a ReviewOutcome>,
    ) -> Self {
        let mut t = Self::default();
        for s in searches {
            t.searches += 1;
            t.results += s.results_count;
            match s.result_type {
                SearchResultType::TruePositive => t.true_positives += 1,
                SearchResultType::FalsePositive => t.false_positives += 1,
                SearchResultType::NoResults => t.no_results += 1,
                SearchResultType::Error => t.errors += 1,
            }
            t.feedback_count += s.human_feedback.len() as u64;
            t.useful_count += s.human_feedback.iter().filter(|f| f.useful).count() as u64;
        }
        for r in reviews {
            match r.decision {
                ReviewDecision::Approved => t.reviews_approved += 1,
                ReviewDecision::Rejected => t.reviews_rejected += 1,
            }
        }
        let classified = t.true_positives + t.false_positives;
        t.precision = (classified > 0).then(|| t.true_positives as f64 / classified as f64);
        t.useful_rate =
            (t.feedback_count > 0).then(|| t.useful_count as f64 / t.feedback_count as f64);
        t
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyPerformance {
    /// None = every strategy.
    pub strategy_id: Option<String>,
    #[serde(flatten)]
    pub tally: FeedbackTally,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackStats {
    pub since: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub tally: FeedbackTally,
}
