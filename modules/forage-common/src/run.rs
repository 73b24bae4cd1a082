use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Pending, Self::Failed)
                | (Self::Pending, Self::Completed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Discovery,
    DishExtraction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggeredBy {
    Scheduled,
    Manual,
    Webhook,
}

/// Immutable once the run is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub platforms: Vec<String>,
    #[serde(default)]
    pub chain_ids: Vec<String>,
    #[serde(default)]
    pub markets: Vec<String>,
    pub max_targets: Option<u32>,
    /// Producer-specific knobs the engine does not interpret.
    #[serde(default)]
    pub params: Value,
}

/// Counters only ever grow within a run. Deltas are unsigned, so `apply` cannot
/// move a field backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub queries_executed: u64,
    pub queries_successful: u64,
    pub queries_failed: u64,
    pub venues_discovered: u64,
    pub venues_verified: u64,
    pub venues_rejected: u64,
    pub chains_detected: u64,
    pub new_strategies_created: u64,
}

impl RunStats {
    pub fn apply(&mut self, delta: &RunStats) {
        self.queries_executed = self.queries_executed.saturating_add(delta.queries_executed);
        self.queries_successful = self.queries_successful.saturating_add(delta.queries_successful);
        self.queries_failed = self.queries_failed.saturating_add(delta.queries_failed);
        self.venues_discovered = self.venues_discovered.saturating_add(delta.venues_discovered);
        self.venues_verified = self.venues_verified.saturating_add(delta.venues_verified);
        self.venues_rejected = self.venues_rejected.saturating_add(delta.venues_rejected);
        self.chains_detected = self.chains_detected.saturating_add(delta.chains_detected);
        self.new_strategies_created = self
            .new_strategies_created
            .saturating_add(delta.new_strategies_created);
    }

    pub fn is_zero(&self) -> bool {
        *self == RunStats::default()
    }
}

impl fmt::Display for RunStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queries={}/{} ok, {} failed venues discovered={} verified={} rejected={} chains={} new_strategies={}",
            self.queries_successful,
            self.queries_executed,
            self.queries_failed,
            self.venues_discovered,
            self.venues_verified,
            self.venues_rejected,
            self.chains_detected,
            self.new_strategies_created,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnedPattern {
    pub pattern: String,
    pub context: Option<String>,
    pub learned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunError {
    pub message: String,
    pub context: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// One scraping/extraction batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRun {
    #[serde(default)]
    pub id: String,
    pub kind: RunKind,
    pub status: RunStatus,
    pub config: RunConfig,
    #[serde(default)]
    pub stats: RunStats,
    /// Insertion-ordered, no repeats.
    #[serde(default)]
    pub strategies_used: Vec<String>,
    #[serde(default)]
    pub learned_patterns: Vec<LearnedPattern>,
    #[serde(default)]
    pub errors: Vec<RunError>,
    pub triggered_by: TriggeredBy,
    #[serde(default)]
    pub cancel_requested: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscoveryRun {
    pub fn new(kind: RunKind, config: RunConfig, triggered_by: TriggeredBy) -> Self {
        let now = Utc::now();
        Self {
            id: String::new(),
            kind,
            status: RunStatus::Pending,
            config,
            stats: RunStats::default(),
            strategies_used: Vec::new(),
            learned_patterns: Vec::new(),
            errors: Vec::new(),
            triggered_by,
            cancel_requested: false,
            cancelled_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    /// Returns false if the id was already recorded.
    pub fn add_strategy(&mut self, strategy_id: &str) -> bool {
        if self.strategies_used.iter().any(|s| s == strategy_id) {
            return false;
        }
        self.strategies_used.push(strategy_id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_runs_cannot_move() {
        for terminal in [RunStatus::Completed, RunStatus::Failed] {
            for next in [
                RunStatus::Pending,
                RunStatus::Running,
                RunStatus::Completed,
                RunStatus::Failed,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn stats_apply_only_adds() {
        let mut stats = RunStats {
            queries_executed: 3,
            ..RunStats::default()
        };
        stats.apply(&RunStats {
            queries_executed: 2,
            venues_discovered: 1,
            ..RunStats::default()
        });
        assert_eq!(stats.queries_executed, 5);
        assert_eq!(stats.venues_discovered, 1);
    }

    #[test]
    fn strategies_used_keeps_first_insertion_order() {
        let mut run = DiscoveryRun::new(RunKind::Discovery, RunConfig::default(), TriggeredBy::Manual);
        assert!(run.add_strategy("s2"));
        assert!(run.add_strategy("s1"));
        assert!(!run.add_strategy("s2"));
        assert_eq!(run.strategies_used, vec!["s2", "s1"]);
    }
}
