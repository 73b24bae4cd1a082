use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use forage_common::{
    FeedbackDetails, FeedbackStats, FeedbackTally, ForageError, HumanFeedback, NewSearchFeedback,
    Result, ReviewOutcome, SearchFeedback, StrategyPerformance,
};
use forage_store::store::format_timestamp;
use forage_store::{Collection, DocumentStore, Filter, Query};

pub const SEARCH_FEEDBACK_COLLECTION: &str = "search_feedback";
pub const REVIEW_OUTCOMES_COLLECTION: &str = "review_outcomes";

/// Append-only log of executed searches and review decisions.
#[derive(Clone)]
pub struct FeedbackRecorder {
    searches: Collection<SearchFeedback>,
    reviews: Collection<ReviewOutcome>,
}

impl FeedbackRecorder {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            searches: Collection::new(store.clone(), SEARCH_FEEDBACK_COLLECTION),
            reviews: Collection::new(store, REVIEW_OUTCOMES_COLLECTION),
        }
    }

    pub async fn record_search(&self, input: NewSearchFeedback) -> Result<SearchFeedback> {
        if input.platform.trim().is_empty() || input.query.trim().is_empty() {
            return Err(ForageError::Validation(
                "search feedback needs a platform and a query".into(),
            ));
        }
        let row = self.searches.insert(None, &SearchFeedback::new(input)).await?;
        debug!(id = %row.id, result_type = ?row.result_type, "Recorded search feedback");
        Ok(row)
    }

    /// Attach a reviewer's judgment. The automatic classification is left alone.
    pub async fn add_feedback(
        &self,
        id: &str,
        details: FeedbackDetails,
        reviewer: &str,
    ) -> Result<SearchFeedback> {
        if reviewer.trim().is_empty() {
            return Err(ForageError::Validation("reviewer is required".into()));
        }
        let now = Utc::now();
        let (row, ()) = self
            .searches
            .mutate(id, |row| {
                row.human_feedback.push(HumanFeedback {
                    useful: details.useful,
                    corrections: details.corrections.clone(),
                    notes: details.notes.clone(),
                    reviewer: reviewer.to_string(),
                    reviewed_at: now,
                });
                Ok::<_, ForageError>(())
            })
            .await?;
        Ok(row)
    }

    pub async fn record_review(&self, outcome: ReviewOutcome) -> Result<ReviewOutcome> {
        Ok(self.reviews.insert(None, &outcome).await?)
    }

    pub async fn get(&self, id: &str) -> Result<SearchFeedback> {
        Ok(self.searches.require(id).await?)
    }

    pub async fn get_strategy_performance(
        &self,
        strategy_id: Option<&str>,
    ) -> Result<StrategyPerformance> {
        let filters: Vec<Filter> = strategy_id
            .map(|id| Filter::eq("strategy_id", id))
            .into_iter()
            .collect();
        let (searches, reviews) = self.load(&filters).await?;
        Ok(StrategyPerformance {
            strategy_id: strategy_id.map(str::to_string),
            tally: FeedbackTally::fold(&searches, &reviews),
        })
    }

    pub async fn get_stats(&self, since: Option<DateTime<Utc>>) -> Result<FeedbackStats> {
        let filters: Vec<Filter> = since
            .map(|ts| Filter::gte("created_at", format_timestamp(&ts)))
            .into_iter()
            .collect();
        let (searches, reviews) = self.load(&filters).await?;
        Ok(FeedbackStats {
            since,
            tally: FeedbackTally::fold(&searches, &reviews),
        })
    }

    async fn load(&self, filters: &[Filter]) -> Result<(Vec<SearchFeedback>, Vec<ReviewOutcome>)> {
        let query = filters
            .iter()
            .cloned()
            .fold(Query::new(), |q, f| q.filter(f));
        let searches = self.searches.query(&query).await?;
        let reviews = self.reviews.query(&query).await?;
        Ok((searches, reviews))
    }
}

#[cfg(test)]
mod tests {
    use forage_common::{EntityType, ReviewDecision, SearchResultType};
    use forage_store::MemoryStore;

    use super::*;

    fn recorder() -> FeedbackRecorder {
        FeedbackRecorder::new(Arc::new(MemoryStore::new()))
    }

    fn search(strategy: &str, result_type: SearchResultType) -> NewSearchFeedback {
        NewSearchFeedback {
            run_id: Some("r1".into()),
            strategy_id: Some(strategy.into()),
            platform: "google_maps".into(),
            chain_id: None,
            query: "burger palace".into(),
            result_type,
            results_count: 3,
            staged_ids: vec![],
        }
    }

    #[tokio::test]
    async fn human_feedback_appends_without_reclassifying() {
        let rec = recorder();
        let row = rec
            .record_search(search("s1", SearchResultType::FalsePositive))
            .await
            .unwrap();
        for reviewer in ["alice", "bob"] {
            rec.add_feedback(
                &row.id,
                FeedbackDetails {
                    useful: true,
                    corrections: None,
                    notes: None,
                },
                reviewer,
            )
            .await
            .unwrap();
        }
        let row = rec.get(&row.id).await.unwrap();
        assert_eq!(row.result_type, SearchResultType::FalsePositive);
        let reviewers: Vec<_> = row.human_feedback.iter().map(|f| f.reviewer.as_str()).collect();
        assert_eq!(reviewers, vec!["alice", "bob"]);
    }

    #[tokio::test]
    async fn performance_is_scoped_to_one_strategy() {
        let rec = recorder();
        rec.record_search(search("s1", SearchResultType::TruePositive)).await.unwrap();
        rec.record_search(search("s1", SearchResultType::FalsePositive)).await.unwrap();
        rec.record_search(search("s2", SearchResultType::NoResults)).await.unwrap();
        rec.record_review(ReviewOutcome {
            id: String::new(),
            entity_type: EntityType::Venue,
            staged_id: "v1".into(),
            strategy_id: Some("s1".into()),
            partner_id: None,
            discovery_run_id: None,
            decision: ReviewDecision::Approved,
            confidence: 88,
            reviewer: "alice".into(),
            decided_at: Utc::now(),
        })
        .await
        .unwrap();

        let s1 = rec.get_strategy_performance(Some("s1")).await.unwrap();
        assert_eq!(s1.tally.searches, 2);
        assert_eq!(s1.tally.precision, Some(0.5));
        assert_eq!(s1.tally.reviews_approved, 1);

        let all = rec.get_strategy_performance(None).await.unwrap();
        assert_eq!(all.tally.searches, 3);
        assert_eq!(all.tally.no_results, 1);
    }

    #[tokio::test]
    async fn stats_since_excludes_older_rows() {
        let rec = recorder();
        rec.record_search(search("s1", SearchResultType::TruePositive)).await.unwrap();
        let cutoff = Utc::now() + chrono::Duration::seconds(60);
        let stats = rec.get_stats(Some(cutoff)).await.unwrap();
        assert_eq!(stats.tally.searches, 0);
        let stats = rec.get_stats(None).await.unwrap();
        assert_eq!(stats.tally.searches, 1);
    }

    #[tokio::test]
    async fn blank_query_is_rejected() {
        let rec = recorder();
        let mut input = search("s1", SearchResultType::Error);
        input.query = "  ".into();
        assert!(matches!(
            rec.record_search(input).await,
            Err(ForageError::Validation(_))
        ));
    }
}
